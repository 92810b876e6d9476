use serde::{Deserialize, Serialize};

/// Output of one AEAD encryption: ciphertext, nonce, and tag always travel together.
///
/// Serialized as JSON with base64 fields, which is the persisted shape of both
/// `UserCredential::wrapped_umk` and `FileRecord::encrypted_dek`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedBlob {
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub auth_tag: Vec<u8>,
}

impl EncryptedBlob {
    /// Serialize to the JSON form stored in credential and file records.
    pub fn to_json(&self) -> crate::NimbusResult<String> {
        serde_json::to_string(self)
            .map_err(|e| crate::NimbusError::Storage(format!("encrypted blob serialization: {e}")))
    }

    /// Parse the JSON form produced by [`EncryptedBlob::to_json`].
    pub fn from_json(s: &str) -> crate::NimbusResult<Self> {
        serde_json::from_str(s).map_err(|_| crate::NimbusError::Decryption)
    }
}

/// Authentication and key-wrapping material for one user.
///
/// `wrapped_umk` and `key_salt` are absent until the first successful
/// password use after encryption was introduced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCredential {
    pub user_id: String,
    /// Argon2id PHC string
    pub password_hash: String,
    #[serde(default)]
    pub wrapped_umk: Option<EncryptedBlob>,
    #[serde(default, with = "base64_bytes_opt")]
    pub key_salt: Option<Vec<u8>>,
}

impl UserCredential {
    pub fn has_master_key(&self) -> bool {
        self.wrapped_umk.is_some() && self.key_salt.is_some()
    }
}

/// Metadata returned for each stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub storage_key: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_dek: Option<EncryptedBlob>,
}

/// Persistent row describing one stored blob.
///
/// `encrypted_dek` is the single source of truth for whether the blob on disk
/// is ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub storage_key: String,
    pub owner_id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(default)]
    pub relative_path: Option<String>,
    #[serde(default)]
    pub encrypted_dek: Option<EncryptedBlob>,
    /// Unix timestamp of upload finalize
    pub created_at: u64,
}

impl FileRecord {
    pub fn from_metadata(meta: FileMetadata, owner_id: &str) -> Self {
        Self {
            storage_key: meta.storage_key,
            owner_id: owner_id.to_string(),
            name: meta.name,
            size: meta.size,
            mime_type: meta.mime_type,
            folder_id: None,
            relative_path: None,
            encrypted_dek: meta.encrypted_dek,
            created_at: crate::unix_now(),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted_dek.is_some()
    }

    pub fn metadata(&self) -> FileMetadata {
        FileMetadata {
            storage_key: self.storage_key.clone(),
            name: self.name.clone(),
            size: self.size,
            mime_type: self.mime_type.clone(),
            encrypted_dek: self.encrypted_dek.clone(),
        }
    }
}

const MAX_STORAGE_KEY_LEN: usize = 128;

/// Reject storage keys that could escape the blob or staging directory.
///
/// Valid keys are 1–128 characters of `[A-Za-z0-9_-]`.
pub fn validate_storage_key(key: &str) -> crate::NimbusResult<()> {
    let valid = !key.is_empty()
        && key.len() <= MAX_STORAGE_KEY_LEN
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(crate::NimbusError::Malformed(format!(
            "invalid storage key: {key:?}"
        )))
    }
}

/// Disk capacity plus one user's consumption, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStatus {
    pub total: u64,
    pub free: u64,
    pub used: u64,
}

/// One failed item of a batch operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub storage_key: String,
    pub reason: String,
}

/// Aggregate result of a batch operation: items are processed independently
/// and successful ones are never rolled back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub failures: Vec<BatchFailure>,
}

impl BatchOutcome {
    pub fn record_success(&mut self) {
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self, storage_key: &str, reason: impl ToString) {
        self.failures.push(BatchFailure {
            storage_key: storage_key.to_string(),
            reason: reason.to_string(),
        });
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failures.len()
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

mod base64_bytes_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_key_validation() {
        assert!(validate_storage_key("abc-DEF_123").is_ok());
        assert!(validate_storage_key(&"x".repeat(128)).is_ok());
        assert!(validate_storage_key("").is_err());
        assert!(validate_storage_key("../etc/passwd").is_err());
        assert!(validate_storage_key("a/b").is_err());
        assert!(validate_storage_key("key.part").is_err());
        assert!(validate_storage_key(&"x".repeat(129)).is_err());
    }

    fn sample_blob() -> EncryptedBlob {
        EncryptedBlob {
            ciphertext: vec![1, 2, 3, 4],
            nonce: vec![9; 12],
            auth_tag: vec![7; 16],
        }
    }

    #[test]
    fn encrypted_blob_json_shape() {
        let json = sample_blob().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["ciphertext"], "AQIDBA==");
        assert!(value["authTag"].is_string(), "tag field must be camelCase");
        assert_eq!(EncryptedBlob::from_json(&json).unwrap(), sample_blob());
    }

    #[test]
    fn encrypted_blob_bad_json_is_decryption_error() {
        let err = EncryptedBlob::from_json("{not json").unwrap_err();
        assert!(matches!(err, crate::NimbusError::Decryption));
    }

    #[test]
    fn credential_without_master_key_deserializes() {
        let json = r#"{"userId":"u1","passwordHash":"$argon2id$..."}"#;
        let cred: UserCredential = serde_json::from_str(json).unwrap();
        assert!(cred.wrapped_umk.is_none());
        assert!(cred.key_salt.is_none());
        assert!(!cred.has_master_key());
    }

    #[test]
    fn credential_salt_is_base64() {
        let cred = UserCredential {
            user_id: "u1".into(),
            password_hash: "h".into(),
            wrapped_umk: Some(sample_blob()),
            key_salt: Some(vec![0xFF; 4]),
        };
        let value = serde_json::to_value(&cred).unwrap();
        assert_eq!(value["keySalt"], "/////w==");

        let parsed: UserCredential = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.key_salt, Some(vec![0xFF; 4]));
        assert!(parsed.has_master_key());
    }

    #[test]
    fn metadata_omits_absent_dek() {
        let meta = FileMetadata {
            storage_key: "k".into(),
            name: "a.txt".into(),
            size: 3,
            mime_type: "text/plain".into(),
            encrypted_dek: None,
        };
        let value = serde_json::to_value(&meta).unwrap();
        assert!(value.get("encryptedDek").is_none());
        assert_eq!(value["storageKey"], "k");
    }

    #[test]
    fn batch_outcome_counts() {
        let mut outcome = BatchOutcome::default();
        outcome.record_success();
        outcome.record_success();
        outcome.record_failure("k3", "permission denied");

        assert_eq!(outcome.succeeded, 2);
        assert_eq!(outcome.total(), 3);
        assert!(!outcome.is_complete());
        assert_eq!(outcome.failures[0].storage_key, "k3");
    }
}
