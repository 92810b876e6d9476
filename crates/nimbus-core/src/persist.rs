//! Atomic JSON persistence for small record maps

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

use crate::{NimbusError, NimbusResult};

/// Read a JSON document, or `T::default()` if the file does not exist.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> NimbusResult<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| NimbusError::Storage(format!("parsing {}: {e}", path.display())))
}

/// Write a JSON document atomically: write to a temp file, then rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> NimbusResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(value)
        .map_err(|e| NimbusError::Storage(format!("serializing {}: {e}", path.display())))?;

    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let map: HashMap<String, u32> = read_json_or_default(&dir.path().join("none.json")).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.json");
        let mut map = HashMap::new();
        map.insert("a".to_string(), 1u32);

        write_json_atomic(&path, &map).unwrap();
        let loaded: HashMap<String, u32> = read_json_or_default(&path).unwrap();

        assert_eq!(loaded, map);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn corrupt_file_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{").unwrap();
        let result: NimbusResult<HashMap<String, u32>> = read_json_or_default(&path);
        assert!(matches!(result, Err(NimbusError::Storage(_))));
    }
}
