//! nimbus-storage: content-addressed blobs on local disk
//!
//! Layout under the storage root:
//! ```text
//! blobs/{key[0..2]}/{key}                 raw bytes, or nonce ∥ tag ∥ ciphertext
//! blobs/{key[0..2]}/{key}.preview.png     preview placeholder (unencrypted images only)
//! staging/                                in-flight upload parts
//! ```

pub mod blob;
pub mod preview;
pub mod records;

pub use blob::{BlobStore, ByteStream};
pub use nimbus_core::validate_storage_key;
pub use records::{JsonRecordStore, RecordStore};
