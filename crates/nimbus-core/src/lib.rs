pub mod config;
pub mod error;
pub mod persist;
pub mod types;

pub use error::{NimbusError, NimbusResult};
pub use types::{
    validate_storage_key, BatchFailure, BatchOutcome, EncryptedBlob, FileMetadata, FileRecord,
    StorageStatus, UserCredential,
};

/// Returns the current Unix time in seconds (0 if the clock is before the epoch).
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
