//! Password authentication hashes (Argon2id PHC strings)
//!
//! Separate from [`crate::kdf`]: this hash authenticates the user and is
//! stored; the KDF output wraps the master key and never is.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use nimbus_core::{NimbusError, NimbusResult};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};

use crate::kdf::KdfParams;

/// Hash a password into a PHC string with a fresh 16-byte salt.
pub fn hash_password(password: &SecretString, params: &KdfParams) -> NimbusResult<String> {
    let mut salt_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| NimbusError::Crypto(format!("password salt encoding: {e}")))?;

    let hash = params
        .argon2(None)?
        .hash_password(password.expose_secret().as_bytes(), &salt)
        .map_err(|e| NimbusError::Crypto(format!("password hashing failed: {e}")))?;
    Ok(hash.to_string())
}

/// Verify a password against a stored PHC string.
///
/// Cost parameters are read from the stored hash, so hashes created under
/// older parameters keep verifying.
pub fn verify_password(password: &SecretString, password_hash: &str) -> NimbusResult<()> {
    let parsed = PasswordHash::new(password_hash)
        .map_err(|e| NimbusError::Crypto(format!("stored password hash is invalid: {e}")))?;
    Argon2::default()
        .verify_password(password.expose_secret().as_bytes(), &parsed)
        .map_err(|_| NimbusError::IncorrectPassword)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::test_params;

    #[test]
    fn test_hash_and_verify() {
        let pw = SecretString::from("correct horse");
        let hash = hash_password(&pw, &test_params()).unwrap();

        assert!(hash.starts_with("$argon2id$"));
        verify_password(&pw, &hash).unwrap();
    }

    #[test]
    fn test_wrong_password() {
        let hash = hash_password(&SecretString::from("right"), &test_params()).unwrap();
        let err = verify_password(&SecretString::from("wrong"), &hash).unwrap_err();
        assert!(matches!(err, NimbusError::IncorrectPassword));
    }

    #[test]
    fn test_hashes_are_salted() {
        let pw = SecretString::from("same");
        let h1 = hash_password(&pw, &test_params()).unwrap();
        let h2 = hash_password(&pw, &test_params()).unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_corrupt_hash_is_not_an_auth_failure() {
        let err = verify_password(&SecretString::from("pw"), "not-a-phc-string").unwrap_err();
        assert!(matches!(err, NimbusError::Crypto(_)));
    }
}
