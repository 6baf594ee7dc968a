//! Local backup of namespace snapshots
//!
//! Persists the full `namespace -> configurations` map to a single JSON
//! file so the client can warm-start, and keep serving, while the config
//! servers are unreachable. The file is only a fallback; the authoritative
//! source stays the server, so every write is a full rewrite and crash
//! safety is "last complete write wins".

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::debug;

use crate::error::Result;
use crate::model::Configurations;

/// Disk store for the per-namespace snapshot map.
///
/// Guarded by an in-process readers-writer lock; sharing the same file
/// between processes is not supported.
pub struct BackupStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl BackupStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a backup file is present on disk.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Overwrite the entry for `namespace`, keeping all other entries.
    ///
    /// A missing or unreadable existing file starts the map from empty
    /// rather than failing the save.
    pub fn save(&self, namespace: &str, configurations: &Configurations) -> Result<()> {
        let mut backup = self.load().unwrap_or_default();

        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());

        backup.insert(namespace.to_string(), configurations.clone());
        let data = serde_json::to_vec(&backup)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        fs::write(&self.path, data)?;
        debug!(file = %self.path.display(), namespace, "backup written");
        Ok(())
    }

    /// Read the whole backup map.
    pub fn load(&self) -> Result<BTreeMap<String, Configurations>> {
        let _guard = self.lock.read().unwrap_or_else(|e| e.into_inner());

        let data = fs::read(&self.path)?;
        let backup = serde_json::from_slice(&data)?;
        Ok(backup)
    }

    /// Read the entry for one namespace; absent entries come back empty.
    pub fn load_namespace(&self, namespace: &str) -> Result<Configurations> {
        let mut backup = self.load()?;
        Ok(backup.remove(namespace).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample() -> Configurations {
        let mut configurations = Configurations::new();
        configurations.insert("timeout".to_string(), json!("100"));
        configurations.insert("retries".to_string(), json!(3));
        configurations
    }

    #[test]
    fn test_save_and_load_namespace() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path().join(".agollo"));

        assert!(!store.exists());
        store.save("application", &sample()).unwrap();
        assert!(store.exists());

        let loaded = store.load_namespace("application").unwrap();
        assert_eq!(loaded, sample());
    }

    #[test]
    fn test_save_keeps_other_namespaces() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path().join(".agollo"));

        store.save("application", &sample()).unwrap();

        let mut other = Configurations::new();
        other.insert("content".to_string(), json!("{\"name\":\"foo\"}"));
        store.save("test.json", &other).unwrap();

        let backup = store.load().unwrap();
        assert_eq!(backup.len(), 2);
        assert_eq!(backup["application"], sample());
        assert_eq!(backup["test.json"], other);
    }

    #[test]
    fn test_save_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path().join("nested/deeper/.agollo"));

        store.save("application", &sample()).unwrap();
        assert!(store.exists());
    }

    #[test]
    fn test_save_load_save_is_stable() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path().join(".agollo"));

        store.save("application", &sample()).unwrap();
        let first = fs::read(store.path()).unwrap();

        let loaded = store.load_namespace("application").unwrap();
        store.save("application", &loaded).unwrap();
        let second = fs::read(store.path()).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_corrupt_file_fails_load_but_not_save() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".agollo");
        fs::write(&path, b"{definitely not json").unwrap();

        let store = BackupStore::new(&path);
        assert!(store.load().is_err());

        // A save starts over from an empty map.
        store.save("application", &sample()).unwrap();
        assert_eq!(store.load_namespace("application").unwrap(), sample());
    }

    #[test]
    fn test_load_namespace_missing_entry_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path().join(".agollo"));

        store.save("application", &sample()).unwrap();
        assert!(store.load_namespace("unknown").unwrap().is_empty());
    }
}
