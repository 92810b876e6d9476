//! File record index: storage key → `FileRecord`
//!
//! Stands in for the relational files table. Used for encryption-status
//! lookups on download, per-user usage totals, and cleanup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nimbus_core::persist::{read_json_or_default, write_json_atomic};
use nimbus_core::{FileRecord, NimbusResult};

pub trait RecordStore: Send + Sync {
    fn insert(&self, record: FileRecord) -> NimbusResult<()>;
    fn get(&self, storage_key: &str) -> NimbusResult<Option<FileRecord>>;
    /// Remove a record, returning it if it existed.
    fn remove(&self, storage_key: &str) -> NimbusResult<Option<FileRecord>>;
    /// Sum of `size` over all records owned by `owner_id`.
    fn usage_for(&self, owner_id: &str) -> NimbusResult<u64>;
    fn list_for(&self, owner_id: &str) -> NimbusResult<Vec<FileRecord>>;
}

/// In-memory record map, mirrored to a JSON file when opened with a path.
pub struct JsonRecordStore {
    path: Option<PathBuf>,
    entries: Mutex<HashMap<String, FileRecord>>,
}

impl JsonRecordStore {
    pub fn open(path: &Path) -> NimbusResult<Self> {
        let entries = read_json_or_default(path)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            entries: Mutex::new(entries),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn persist(&self, map: &HashMap<String, FileRecord>) -> NimbusResult<()> {
        match &self.path {
            Some(path) => write_json_atomic(path, map),
            None => Ok(()),
        }
    }
}

impl RecordStore for JsonRecordStore {
    fn insert(&self, record: FileRecord) -> NimbusResult<()> {
        let mut map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(record.storage_key.clone(), record);
        self.persist(&map)
    }

    fn get(&self, storage_key: &str) -> NimbusResult<Option<FileRecord>> {
        let map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(storage_key).cloned())
    }

    fn remove(&self, storage_key: &str) -> NimbusResult<Option<FileRecord>> {
        let mut map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let removed = map.remove(storage_key);
        if removed.is_some() {
            self.persist(&map)?;
        }
        Ok(removed)
    }

    fn usage_for(&self, owner_id: &str) -> NimbusResult<u64> {
        let map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map
            .values()
            .filter(|r| r.owner_id == owner_id)
            .map(|r| r.size)
            .sum())
    }

    fn list_for(&self, owner_id: &str) -> NimbusResult<Vec<FileRecord>> {
        let map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<FileRecord> = map
            .values()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, owner: &str, size: u64) -> FileRecord {
        FileRecord {
            storage_key: key.into(),
            owner_id: owner.into(),
            name: format!("{key}.bin"),
            size,
            mime_type: "application/octet-stream".into(),
            folder_id: None,
            relative_path: None,
            encrypted_dek: None,
            created_at: 0,
        }
    }

    #[test]
    fn usage_is_per_owner() {
        let store = JsonRecordStore::in_memory();
        store.insert(record("a", "alice", 10)).unwrap();
        store.insert(record("b", "alice", 5)).unwrap();
        store.insert(record("c", "bob", 100)).unwrap();

        assert_eq!(store.usage_for("alice").unwrap(), 15);
        assert_eq!(store.usage_for("bob").unwrap(), 100);
        assert_eq!(store.usage_for("carol").unwrap(), 0);
        assert_eq!(store.list_for("alice").unwrap().len(), 2);
    }

    #[test]
    fn remove_returns_record() {
        let store = JsonRecordStore::in_memory();
        store.insert(record("a", "alice", 10)).unwrap();

        assert!(store.remove("a").unwrap().is_some());
        assert!(store.remove("a").unwrap().is_none());
        assert!(store.get("a").unwrap().is_none());
    }

    #[test]
    fn persisted_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");

        JsonRecordStore::open(&path)
            .unwrap()
            .insert(record("k1", "alice", 42))
            .unwrap();

        let reopened = JsonRecordStore::open(&path).unwrap();
        assert_eq!(reopened.get("k1").unwrap().unwrap().size, 42);
    }
}
