//! AES-256-GCM with a fresh random nonce per call
//!
//! The nonce is always generated here and never accepted from a caller, so
//! nonce reuse under one key cannot be expressed through this API.

use aes_gcm::{
    aead::{generic_array::GenericArray, AeadInPlace, KeyInit},
    Aes256Gcm, Nonce,
};
use nimbus_core::{EncryptedBlob, NimbusError, NimbusResult};
use rand::RngCore;

use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Encrypt `plaintext` under `key`, returning ciphertext, nonce, and tag.
pub fn encrypt(plaintext: &[u8], key: &[u8; KEY_SIZE]) -> NimbusResult<EncryptedBlob> {
    let cipher = Aes256Gcm::new(key.into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(nonce, b"", &mut buffer)
        .map_err(|e| NimbusError::Crypto(format!("encryption failed: {e}")))?;

    Ok(EncryptedBlob {
        ciphertext: buffer,
        nonce: nonce_bytes.to_vec(),
        auth_tag: tag.to_vec(),
    })
}

/// Decrypt an [`EncryptedBlob`] produced by [`encrypt`].
///
/// Fails with [`NimbusError::Decryption`] on a wrong key, a modified nonce,
/// tag, or ciphertext, or wrong field widths. No plaintext is returned on failure.
pub fn decrypt(blob: &EncryptedBlob, key: &[u8; KEY_SIZE]) -> NimbusResult<Vec<u8>> {
    if blob.nonce.len() != NONCE_SIZE || blob.auth_tag.len() != TAG_SIZE {
        return Err(NimbusError::Decryption);
    }

    let cipher = Aes256Gcm::new(key.into());
    let nonce = Nonce::from_slice(&blob.nonce);
    let tag = GenericArray::from_slice(&blob.auth_tag);

    let mut buffer = blob.ciphertext.clone();
    cipher
        .decrypt_in_place_detached(nonce, b"", &mut buffer, tag)
        .map_err(|_| NimbusError::Decryption)?;
    Ok(buffer)
}

/// Encrypt a short UTF-8 string.
pub fn encrypt_text(text: &str, key: &[u8; KEY_SIZE]) -> NimbusResult<EncryptedBlob> {
    encrypt(text.as_bytes(), key)
}

/// Decrypt a blob produced by [`encrypt_text`].
pub fn decrypt_text(blob: &EncryptedBlob, key: &[u8; KEY_SIZE]) -> NimbusResult<String> {
    let bytes = decrypt(blob, key)?;
    String::from_utf8(bytes).map_err(|_| NimbusError::Decryption)
}


#[cfg(test)]
mod proptest_suite {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn roundtrip_any_plaintext(
            data in proptest::collection::vec(any::<u8>(), 0..=4096),
            key in any::<[u8; KEY_SIZE]>(),
        ) {
            let blob = encrypt(&data, &key).unwrap();
            prop_assert_eq!(decrypt(&blob, &key).unwrap(), data);
        }

        #[test]
        fn any_bit_flip_is_detected(
            data in proptest::collection::vec(any::<u8>(), 1..=512),
            field in 0usize..3,
            position in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let key = [0x5Au8; KEY_SIZE];
            let mut blob = encrypt(&data, &key).unwrap();
            let target = match field {
                0 => &mut blob.ciphertext,
                1 => &mut blob.nonce,
                _ => &mut blob.auth_tag,
            };
            let i = position.index(target.len());
            target[i] ^= 1 << bit;

            prop_assert!(matches!(decrypt(&blob, &key), Err(NimbusError::Decryption)));
        }

        #[test]
        fn wrong_key_is_rejected(
            data in proptest::collection::vec(any::<u8>(), 0..=256),
            k1 in any::<[u8; KEY_SIZE]>(),
            k2 in any::<[u8; KEY_SIZE]>(),
        ) {
            prop_assume!(k1 != k2);
            let blob = encrypt(&data, &k1).unwrap();
            prop_assert!(decrypt(&blob, &k2).is_err());
        }
    }
}
