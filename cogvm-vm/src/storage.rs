//! # Durable store
//!
//! Key-value storage that outlives the working set. Pages evicted while
//! dirty are written here, LOAD_PAGE reads them back, and FREE deletes them.
//! A file backend makes the store survive between runs.

use crate::error::{self, Result};
use crate::memory::Page;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const PAGE_PREFIX: &str = "page:";

/// Storage backend trait
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&mut self, key: &str, value: Value) -> Result<()>;
    fn delete(&mut self, key: &str) -> Result<()>;
    fn exists(&self, key: &str) -> bool;
}

/// In-memory backend, the default for a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStorage {
    data: HashMap<String, Value>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn get(&self, key: &str) -> Option<Value> {
        self.data.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) -> Result<()> {
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }
}

/// One JSON file per key under a directory. File names are the hex
/// encoding of the key, so distinct keys never share a file.
pub struct FileStorage {
    base_path: PathBuf,
}

impl FileStorage {
    pub fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path).map_err(|e| {
            error::storage_failed(format!("cannot create storage dir {}: {}", base_path.display(), e))
                .set_source(e)
        })?;
        Ok(Self { base_path })
    }

    fn key_to_path(&self, key: &str) -> PathBuf {
        self.base_path.join(format!("{}.json", hex::encode(key)))
    }
}

impl StorageBackend for FileStorage {
    fn get(&self, key: &str) -> Option<Value> {
        let content = std::fs::read_to_string(self.key_to_path(key)).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn set(&mut self, key: &str, value: Value) -> Result<()> {
        let path = self.key_to_path(key);
        let content = serde_json::to_string_pretty(&value)
            .map_err(|e| error::serialization_error(e.to_string()))?;
        std::fs::write(&path, content).map_err(|e| {
            error::storage_failed(format!("failed to write {}", path.display()))
                .with_operation("FileStorage::set")
                .set_source(e)
        })
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        let path = self.key_to_path(key);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| {
                error::storage_failed(format!("failed to delete {}", path.display()))
                    .with_operation("FileStorage::delete")
                    .set_source(e)
            })?;
        }
        Ok(())
    }

    fn exists(&self, key: &str) -> bool {
        self.key_to_path(key).exists()
    }
}

/// Durable store used by a run
pub struct Storage {
    backend: Box<dyn StorageBackend>,
}

impl Default for Storage {
    fn default() -> Self {
        Self::memory()
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    /// Storage with the in-memory backend
    pub fn memory() -> Self {
        Self::with_backend(MemoryStorage::new())
    }

    /// Storage with the file backend
    pub fn file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::with_backend(FileStorage::new(path)?))
    }

    pub fn with_backend(backend: impl StorageBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.backend.get(key)
    }

    pub fn get_typed<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn set(&mut self, key: &str, value: Value) -> Result<()> {
        self.backend.set(key, value)
    }

    pub fn set_typed<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_value(value).map_err(|e| error::serialization_error(e.to_string()))?;
        self.set(key, json)
    }

    pub fn delete(&mut self, key: &str) -> Result<()> {
        self.backend.delete(key)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.backend.exists(key)
    }

    // ========================================================================
    // Pages
    // ========================================================================

    /// Write a page back, keeping its label
    pub fn put_page(&mut self, page: &Page) -> Result<()> {
        let mut stored = page.clone();
        stored.dirty = false;
        self.set_typed(&format!("{}{}", PAGE_PREFIX, page.id), &stored)
    }

    /// Read a stored page. A record filed under `id` for another page is
    /// treated as missing.
    pub fn get_page(&self, id: &str) -> Option<Page> {
        self.get_typed::<Page>(&format!("{}{}", PAGE_PREFIX, id))
            .filter(|page| page.id == id)
    }

    pub fn has_page(&self, id: &str) -> bool {
        self.exists(&format!("{}{}", PAGE_PREFIX, id))
    }

    /// Delete a stored page. Missing pages are fine.
    pub fn remove_page(&mut self, id: &str) -> Result<()> {
        self.delete(&format!("{}{}", PAGE_PREFIX, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn page(id: &str, data: Value) -> Page {
        Page {
            id: id.to_string(),
            data,
            dirty: true,
            size_estimate: 1,
            label: Some("notes".to_string()),
            last_access: 7,
        }
    }

    #[test]
    fn test_memory_storage() {
        let mut storage = Storage::memory();

        storage.set("key1", json!("value1")).unwrap();
        storage.set("key2", json!(42)).unwrap();

        assert_eq!(storage.get("key1"), Some(json!("value1")));
        assert_eq!(storage.get("key2"), Some(json!(42)));
        assert_eq!(storage.get("key3"), None);
        assert!(storage.exists("key2"));

        storage.delete("key1").unwrap();
        assert_eq!(storage.get("key1"), None);
    }

    #[test]
    fn test_typed_storage() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Snapshot {
            name: String,
            count: i32,
        }

        let mut storage = Storage::memory();
        let snapshot = Snapshot { name: "test".to_string(), count: 42 };
        storage.set_typed("snapshot", &snapshot).unwrap();

        let loaded: Option<Snapshot> = storage.get_typed("snapshot");
        assert_eq!(loaded, Some(snapshot));
    }

    #[test]
    fn test_page_helpers() {
        let mut storage = Storage::memory();
        storage.put_page(&page("notes", json!([1, 2]))).unwrap();

        let stored = storage.get_page("notes").unwrap();
        assert_eq!(stored.data, json!([1, 2]));
        assert_eq!(stored.label.as_deref(), Some("notes"));
        assert!(!stored.dirty);
        assert!(storage.has_page("notes"));

        storage.remove_page("notes").unwrap();
        storage.remove_page("notes").unwrap();
        assert!(storage.get_page("notes").is_none());
    }

    #[test]
    fn test_file_storage_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut storage = Storage::file(dir.path()).unwrap();
            storage.put_page(&page("a/b", json!({"k": "v"}))).unwrap();
            storage.set("plain", json!(1)).unwrap();
        }

        let mut storage = Storage::file(dir.path()).unwrap();
        assert_eq!(storage.get_page("a/b").unwrap().data, json!({"k": "v"}));
        assert_eq!(storage.get("plain"), Some(json!(1)));

        storage.delete("plain").unwrap();
        assert!(!storage.exists("plain"));
    }

    #[test]
    fn test_file_storage_keeps_similar_ids_apart() {
        let dir = TempDir::new().unwrap();
        let mut storage = Storage::file(dir.path()).unwrap();
        storage.put_page(&page("a/b", json!("slash"))).unwrap();
        storage.put_page(&page("a_b", json!("underscore"))).unwrap();
        storage.put_page(&page("a:b", json!("colon"))).unwrap();

        let slash = storage.get_page("a/b").unwrap();
        assert_eq!(slash.id, "a/b");
        assert_eq!(slash.data, json!("slash"));
        assert_eq!(storage.get_page("a_b").unwrap().data, json!("underscore"));
        assert_eq!(storage.get_page("a:b").unwrap().data, json!("colon"));

        storage.remove_page("a_b").unwrap();
        assert!(storage.has_page("a/b"));
        assert!(!storage.has_page("a_b"));
    }

    #[test]
    fn test_mismatched_page_record_is_missing() {
        let mut storage = Storage::memory();
        storage.set_typed("page:wanted", &page("other", json!(1))).unwrap();

        assert!(storage.get_page("wanted").is_none());
        assert!(storage.get_page("other").is_none());
    }
}
