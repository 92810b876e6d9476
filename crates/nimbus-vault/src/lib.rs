//! nimbus-vault: the per-user encrypted file pipeline
//!
//! Upload: multipart body → staged parts → (DEK encrypt, wrap under the
//! session's UMK) → blob + file record. Download dispatches on the record's
//! wrapped DEK alone: absent means raw bytes, present means decrypt.

pub mod vault;

pub use vault::{Download, Vault};
