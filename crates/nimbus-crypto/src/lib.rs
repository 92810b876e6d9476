//! nimbus-crypto: per-user envelope encryption
//!
//! Key hierarchy:
//! ```text
//! Password ──Argon2id(salt)──▶ Password-Derived Key (PDK)
//!                                 └── wraps User Master Key (UMK, 256-bit random)
//!                                        └── wraps Data Encryption Key (DEK, per file, 256-bit random)
//!                                               └── AES-256-GCM over file content
//! ```
//!
//! Every wrap/encrypt draws a fresh random 96-bit nonce. Outputs are
//! [`EncryptedBlob`](nimbus_core::EncryptedBlob)s carrying nonce and tag with
//! the ciphertext.

pub mod aead;
pub mod credential;
pub mod hierarchy;
pub mod kdf;
pub mod keys;
pub mod password;
pub mod session;

pub use aead::{decrypt, decrypt_text, encrypt, encrypt_text};
pub use credential::{CredentialStore, JsonCredentialStore};
pub use hierarchy::KeyHierarchy;
pub use kdf::{derive_key, generate_salt, KdfParams, PasswordKey};
pub use keys::{generate_dek, generate_umk, unwrap_dek, unwrap_umk, wrap_dek, wrap_umk, DataKey, UserMasterKey};
pub use session::{SessionKeyCache, SessionState};

/// Size of every symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of a per-user key-derivation salt
pub const SALT_SIZE: usize = 32;
