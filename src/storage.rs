//! Durable key-value state
//!
//! Everything the link must remember across process restarts lives in one
//! flat JSON document: the running flag, the version marker, the paired
//! address, the latest sample and the bounded history. Writes are applied as
//! a batch and flushed to disk before `put_batch` returns.

use serde_json::{Map, Value};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::StoreError;

/// Persisted key names
pub mod keys {
    pub const SERVICE_RUNNING: &str = "service_running";
    pub const SERVICE_VERSION_CODE: &str = "service_version_code";
    pub const LAST_DEVICE_ADDRESS: &str = "last_device_address";
    pub const LAST_HEALTH_DATA: &str = "last_health_data";
    pub const LAST_UPDATE: &str = "last_update";
    pub const HEALTH_DATA_HISTORY: &str = "health_data_history";
    pub const STEP_SERVICE_RUNNING: &str = "step_service_running";
    pub const INITIAL_STEPS: &str = "initial_steps";
    pub const CURRENT_STEPS: &str = "current_steps";
}

/// Single-writer durable key-value store
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Apply all entries atomically and durably
    fn put_batch(&self, entries: Vec<(&str, Value)>) -> Result<(), StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;

    fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.put_batch(vec![(key, value)])
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, StoreError> {
        match self.get(key)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(b)),
            Some(_) => Err(mismatch(key, "bool")),
        }
    }

    fn get_i64(&self, key: &str) -> Result<Option<i64>, StoreError> {
        match self.get(key)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n.as_i64().map(Some).ok_or_else(|| mismatch(key, "i64")),
            Some(_) => Err(mismatch(key, "i64")),
        }
    }

    fn get_f64(&self, key: &str) -> Result<Option<f64>, StoreError> {
        match self.get(key)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n.as_f64().map(Some).ok_or_else(|| mismatch(key, "f64")),
            Some(_) => Err(mismatch(key, "f64")),
        }
    }

    fn get_string(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.get(key)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(mismatch(key, "string")),
        }
    }
}

fn mismatch(key: &str, expected: &'static str) -> StoreError {
    StoreError::TypeMismatch {
        key: key.to_string(),
        expected,
    }
}

/// In-memory store for tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<Map<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(values.get(key).cloned())
    }

    fn put_batch(&self, entries: Vec<(&str, Value)>) -> Result<(), StoreError> {
        let mut values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        for (key, value) in entries {
            values.insert(key.to_string(), value);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        values.remove(key);
        Ok(())
    }
}

/// JSON document on disk, rewritten and synced on every batch
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl FileStore {
    /// Open the store at `path`, creating an empty one if the file is missing
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => Map::new(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, values: &Map<String, Value>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = self.path.with_extension("tmp");
        let mut file = File::create(&tmp_path)?;
        file.write_all(serde_json::to_string(values)?.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(values.get(key).cloned())
    }

    fn put_batch(&self, entries: Vec<(&str, Value)>) -> Result<(), StoreError> {
        let mut values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        let mut next = values.clone();
        for (key, value) in entries {
            next.insert(key.to_string(), value);
        }
        self.flush(&next)?;
        *values = next;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        if !values.contains_key(key) {
            return Ok(());
        }
        let mut next = values.clone();
        next.remove(key);
        self.flush(&next)?;
        *values = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_store_typed_access() {
        let store = MemoryStore::new();
        store
            .put_batch(vec![
                (keys::SERVICE_RUNNING, json!(true)),
                (keys::SERVICE_VERSION_CODE, json!(42)),
                (keys::LAST_DEVICE_ADDRESS, json!("AA:BB")),
            ])
            .unwrap();

        assert_eq!(store.get_bool(keys::SERVICE_RUNNING).unwrap(), Some(true));
        assert_eq!(store.get_i64(keys::SERVICE_VERSION_CODE).unwrap(), Some(42));
        assert_eq!(
            store.get_string(keys::LAST_DEVICE_ADDRESS).unwrap().as_deref(),
            Some("AA:BB")
        );
        assert_eq!(store.get_string(keys::LAST_HEALTH_DATA).unwrap(), None);
        assert!(store.get_bool(keys::SERVICE_VERSION_CODE).is_err());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("health_data.json");

        let store = FileStore::open(&path).unwrap();
        store.put(keys::LAST_DEVICE_ADDRESS, json!("AA:BB:CC:DD:EE:FF")).unwrap();
        store.put(keys::LAST_UPDATE, json!(1_700_000_000_000i64)).unwrap();
        store.remove(keys::LAST_UPDATE).unwrap();
        drop(store);

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(
            reopened.get_string(keys::LAST_DEVICE_ADDRESS).unwrap().as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
        assert_eq!(reopened.get(keys::LAST_UPDATE).unwrap(), None);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("health_data.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(FileStore::open(&path), Err(StoreError::Json(_))));
    }
}
