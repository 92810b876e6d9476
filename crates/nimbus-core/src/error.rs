use thiserror::Error;

pub type NimbusResult<T> = Result<T, NimbusError>;

#[derive(Debug, Error)]
pub enum NimbusError {
    /// Wrong password, or the password-derived key failed to unwrap the master key.
    /// The two cases are deliberately indistinguishable.
    #[error("incorrect password")]
    IncorrectPassword,

    /// AEAD tag mismatch while unwrapping a data key or decrypting file content.
    #[error("failed to decrypt")]
    Decryption,

    #[error("session is locked; restore access by re-entering your password")]
    SessionLocked,

    #[error("malformed upload: {0}")]
    Malformed(String),

    #[error("upload truncated before the closing boundary")]
    Truncated,

    #[error("not found: {0}")]
    NotFound(String),

    /// A storage key that is already taken; existing files are never replaced.
    #[error("storage key already in use: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl NimbusError {
    /// True for errors caused by the caller's request rather than the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            NimbusError::IncorrectPassword
                | NimbusError::SessionLocked
                | NimbusError::Malformed(_)
                | NimbusError::Truncated
                | NimbusError::NotFound(_)
                | NimbusError::Conflict(_)
        )
    }

    /// True for authentication failures (password or AEAD tag).
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, NimbusError::IncorrectPassword | NimbusError::Decryption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failures_share_generic_messages() {
        assert_eq!(NimbusError::IncorrectPassword.to_string(), "incorrect password");
        assert_eq!(NimbusError::Decryption.to_string(), "failed to decrypt");
        assert!(NimbusError::Decryption.is_auth_failure());
        assert!(!NimbusError::SessionLocked.is_auth_failure());
    }

    #[test]
    fn client_error_classification() {
        assert!(NimbusError::Malformed("x".into()).is_client_error());
        assert!(NimbusError::Truncated.is_client_error());
        assert!(NimbusError::SessionLocked.is_client_error());
        assert!(NimbusError::NotFound("file k".into()).is_client_error());
        assert!(NimbusError::Conflict("k".into()).is_client_error());
        assert!(!NimbusError::Storage("disk full".into()).is_client_error());
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(!NimbusError::from(io).is_client_error());
    }
}
