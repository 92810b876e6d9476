//! Credential persistence: user id → `UserCredential`

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nimbus_core::persist::{read_json_or_default, write_json_atomic};
use nimbus_core::{NimbusResult, UserCredential};

/// Storage for user credentials. Implementations must make `save` atomic per user.
pub trait CredentialStore: Send + Sync {
    fn load(&self, user_id: &str) -> NimbusResult<Option<UserCredential>>;
    fn save(&self, credential: &UserCredential) -> NimbusResult<()>;
}

/// Credentials held in memory and, when opened with a path, mirrored to a
/// JSON file on every save.
pub struct JsonCredentialStore {
    path: Option<PathBuf>,
    entries: Mutex<HashMap<String, UserCredential>>,
}

impl JsonCredentialStore {
    /// Load or create a credential file at `path`.
    pub fn open(path: &Path) -> NimbusResult<Self> {
        let entries = read_json_or_default(path)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            entries: Mutex::new(entries),
        })
    }

    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl CredentialStore for JsonCredentialStore {
    fn load(&self, user_id: &str) -> NimbusResult<Option<UserCredential>> {
        let map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(user_id).cloned())
    }

    fn save(&self, credential: &UserCredential) -> NimbusResult<()> {
        let mut map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(credential.user_id.clone(), credential.clone());
        if let Some(path) = &self.path {
            write_json_atomic(path, &*map)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(user: &str) -> UserCredential {
        UserCredential {
            user_id: user.into(),
            password_hash: "$argon2id$stub".into(),
            wrapped_umk: None,
            key_salt: Some(vec![1, 2, 3]),
        }
    }

    #[test]
    fn in_memory_roundtrip() {
        let store = JsonCredentialStore::in_memory();
        assert!(store.load("alice").unwrap().is_none());

        store.save(&credential("alice")).unwrap();
        assert_eq!(store.load("alice").unwrap().unwrap().key_salt, Some(vec![1, 2, 3]));
    }

    #[test]
    fn persisted_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");

        JsonCredentialStore::open(&path)
            .unwrap()
            .save(&credential("bob"))
            .unwrap();

        let reopened = JsonCredentialStore::open(&path).unwrap();
        assert_eq!(reopened.load("bob").unwrap().unwrap().user_id, "bob");
    }
}
