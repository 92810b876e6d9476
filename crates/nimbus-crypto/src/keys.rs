//! Key types and wrapping: UMK under PDK, DEK under UMK

use nimbus_core::{EncryptedBlob, NimbusError, NimbusResult};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::aead;
use crate::kdf::PasswordKey;
use crate::KEY_SIZE;

/// The per-user root key. Exists unwrapped only in the session key cache.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct UserMasterKey {
    bytes: [u8; KEY_SIZE],
}

impl UserMasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for UserMasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserMasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A per-file data encryption key. Persisted only wrapped under the owner's UMK.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    bytes: [u8; KEY_SIZE],
}

impl DataKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

fn random_key_bytes() -> [u8; KEY_SIZE] {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Generate a random 256-bit user master key.
pub fn generate_umk() -> UserMasterKey {
    UserMasterKey::from_bytes(random_key_bytes())
}

/// Generate a random 256-bit data encryption key.
pub fn generate_dek() -> DataKey {
    DataKey::from_bytes(random_key_bytes())
}

/// Wrap the master key under a password-derived key.
pub fn wrap_umk(umk: &UserMasterKey, pdk: &PasswordKey) -> NimbusResult<EncryptedBlob> {
    aead::encrypt(umk.as_bytes(), pdk.as_bytes())
}

/// Unwrap the master key. A tag failure surfaces as [`NimbusError::Decryption`];
/// callers translate it for the user.
pub fn unwrap_umk(blob: &EncryptedBlob, pdk: &PasswordKey) -> NimbusResult<UserMasterKey> {
    aead::decrypt(blob, pdk.as_bytes()).and_then(into_key_bytes).map(UserMasterKey::from_bytes)
}

/// Wrap a data key under the owner's master key.
pub fn wrap_dek(dek: &DataKey, umk: &UserMasterKey) -> NimbusResult<EncryptedBlob> {
    aead::encrypt(dek.as_bytes(), umk.as_bytes())
}

/// Unwrap a data key. Failure means a wrong UMK or a corrupted record; both
/// are fatal to the read.
pub fn unwrap_dek(blob: &EncryptedBlob, umk: &UserMasterKey) -> NimbusResult<DataKey> {
    aead::decrypt(blob, umk.as_bytes()).and_then(into_key_bytes).map(DataKey::from_bytes)
}

fn into_key_bytes(mut plaintext: Vec<u8>) -> NimbusResult<[u8; KEY_SIZE]> {
    if plaintext.len() != KEY_SIZE {
        plaintext.zeroize();
        return Err(NimbusError::Decryption);
    }
    let mut bytes = [0u8; KEY_SIZE];
    bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::{derive_key, test_params};
    use secrecy::SecretString;

    #[test]
    fn test_key_generation() {
        assert_ne!(generate_umk().as_bytes(), generate_umk().as_bytes());
        assert_ne!(generate_dek().as_bytes(), generate_dek().as_bytes());
    }

    #[test]
    fn test_dek_wrap_unwrap_roundtrip() {
        let umk = generate_umk();
        let dek = generate_dek();

        let wrapped = wrap_dek(&dek, &umk).unwrap();
        let unwrapped = unwrap_dek(&wrapped, &umk).unwrap();

        assert_eq!(dek.as_bytes(), unwrapped.as_bytes());
        assert_eq!(wrapped.ciphertext.len(), KEY_SIZE);
    }

    #[test]
    fn test_dek_unwrap_wrong_master() {
        let dek = generate_dek();
        let wrapped = wrap_dek(&dek, &UserMasterKey::from_bytes([1u8; KEY_SIZE])).unwrap();

        let result = unwrap_dek(&wrapped, &UserMasterKey::from_bytes([2u8; KEY_SIZE]));
        assert!(matches!(result, Err(NimbusError::Decryption)));
    }

    #[test]
    fn test_umk_wrap_unwrap_with_password_key() {
        let pdk = derive_key(&SecretString::from("pw"), &[3u8; 32], &test_params()).unwrap();
        let umk = generate_umk();

        let wrapped = wrap_umk(&umk, &pdk).unwrap();
        assert_eq!(unwrap_umk(&wrapped, &pdk).unwrap(), umk);

        let other = derive_key(&SecretString::from("other"), &[3u8; 32], &test_params()).unwrap();
        assert!(unwrap_umk(&wrapped, &other).is_err());
    }

    #[test]
    fn test_wrong_length_plaintext_rejected() {
        let umk = generate_umk();
        let blob = crate::aead::encrypt(b"short", umk.as_bytes()).unwrap();
        assert!(matches!(unwrap_dek(&blob, &umk), Err(NimbusError::Decryption)));
    }

    #[test]
    fn test_debug_is_redacted() {
        let rendered = format!("{:?}", UserMasterKey::from_bytes([0xAB; KEY_SIZE]));
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("171"));
    }
}
