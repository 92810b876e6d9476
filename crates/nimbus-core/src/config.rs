use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{NimbusError, NimbusResult};

/// Top-level configuration (loaded from nimbus.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NimbusConfig {
    pub storage: StorageConfig,
    pub crypto: CryptoConfig,
    pub upload: UploadConfig,
    pub log: LogConfig,
}

impl NimbusConfig {
    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist. Callers report the fallback once logging is up.
    pub fn load(path: &Path) -> NimbusResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| NimbusError::Config(format!("parsing {}: {e}", path.display())))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for blobs
    pub root: PathBuf,
    /// Directory for in-flight upload parts (default: `<root>/staging`)
    pub staging_dir: Option<PathBuf>,
    /// JSON file holding file records
    pub records_file: PathBuf,
    /// JSON file holding user credentials
    pub credentials_file: PathBuf,
    /// Maximum concurrent deletes in a batch
    pub delete_concurrency: usize,
}

impl StorageConfig {
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| self.root.join("staging"))
    }
}

/// Argon2id cost parameters and session lifetime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
    /// Seconds an unlocked session keeps its master key
    pub session_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Largest accepted header block of a single part
    pub max_header_bytes: usize,
    /// Largest accepted text field value
    pub max_field_bytes: usize,
    /// Largest accepted file part (unlimited if unset)
    pub max_file_bytes: Option<u64>,
    /// Buffer size for staged file writes
    pub write_buffer_bytes: usize,
    /// Generate preview placeholders for unencrypted images
    pub previews: bool,
    /// Longest edge of a preview placeholder in pixels
    pub preview_max_dim: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/nimbus/blobs"),
            staging_dir: None,
            records_file: PathBuf::from("/var/lib/nimbus/records.json"),
            credentials_file: PathBuf::from("/var/lib/nimbus/credentials.json"),
            delete_concurrency: 8,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
            session_ttl_secs: 86_400,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_header_bytes: 16 * 1024,
            max_field_bytes: 1024 * 1024,
            max_file_bytes: None,
            write_buffer_bytes: 64 * 1024,
            previews: true,
            preview_max_dim: 32,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}
