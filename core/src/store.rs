//! KVStore / HistoryBackend capability traits (C1).
//!
//! Opaque persistence used by [`crate::identity`] and [`crate::history`].
//! `MemoryKvStore` backs tests; `FileKvStore` is a single JSON-object file,
//! following the teacher's whole-file read/write `FileTrustStore` shape.

use crate::error::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Opaque byte/string key-value store.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Same shape as `KvStore` plus batch read/clear, used by history backends.
pub trait HistoryBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn get_all(&self) -> Result<HashMap<String, String>>;
    fn clear_all(&self) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryKvStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.map.lock().unwrap().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.map.lock().unwrap().remove(key);
        Ok(())
    }
}

impl HistoryBackend for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        KvStore::get(self, key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        KvStore::set(self, key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        KvStore::remove(self, key)
    }

    fn get_all(&self) -> Result<HashMap<String, String>> {
        Ok(self.map.lock().unwrap().clone())
    }

    fn clear_all(&self) -> Result<()> {
        self.map.lock().unwrap().clear();
        Ok(())
    }
}

/// File-backed store: one JSON object `{key: value}` per file, rewritten on
/// every mutation. Adequate for identity/trust/history state on a single
/// device; not a transactional database.
pub struct FileKvStore {
    path: PathBuf,
    cache: Mutex<HashMap<String, String>>,
}

impl FileKvStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let cache = if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            if data.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&data)?
            }
        } else {
            HashMap::new()
        };
        Ok(Self { path, cache: Mutex::new(cache) })
    }

    fn flush(&self) -> Result<()> {
        let map = self.cache.lock().unwrap();
        let data = serde_json::to_string_pretty(&*map)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, data)?;
        Ok(())
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.cache.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.cache.lock().unwrap().insert(key.to_string(), value.to_string());
        self.flush()
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.cache.lock().unwrap().remove(key);
        self.flush()
    }
}

impl HistoryBackend for FileKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        KvStore::get(self, key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        KvStore::set(self, key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        KvStore::remove(self, key)
    }

    fn get_all(&self) -> Result<HashMap<String, String>> {
        Ok(self.cache.lock().unwrap().clone())
    }

    fn clear_all(&self) -> Result<()> {
        self.cache.lock().unwrap().clear();
        self.flush()
    }
}
