//! 持久化属性存储
//!
//! 对应脚本侧的 `store(key, value)` / `load(key)`。值以 JSON 保存，任何可序列化
//! 的值都能原样读回。后端可以是内存或单个 JSON 文件。

use crate::config::StorageConfig;
use crate::core::error::{StoreError, StoreResult};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// 存储后端
pub trait StorageBackend: Send {
    fn get(&self, key: &str) -> StoreResult<Option<Json>>;
    fn put(&mut self, key: &str, value: Json) -> StoreResult<()>;
    fn remove(&mut self, key: &str) -> StoreResult<bool>;
    fn clear(&mut self) -> StoreResult<()>;
    fn keys(&self) -> StoreResult<Vec<String>>;
}

/// 内存后端
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: BTreeMap<String, Json>,
}

impl StorageBackend for MemoryStorage {
    fn get(&self, key: &str) -> StoreResult<Option<Json>> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: Json) -> StoreResult<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> StoreResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    fn clear(&mut self) -> StoreResult<()> {
        self.entries.clear();
        Ok(())
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        Ok(self.entries.keys().cloned().collect())
    }
}

/// JSON 文件后端
///
/// 每次写入都重写整个文件（先写临时文件再重命名）。
#[derive(Debug)]
pub struct JsonFileStorage {
    path: PathBuf,
    entries: BTreeMap<String, Json>,
}

impl JsonFileStorage {
    /// 打开存储文件；文件不存在或为空时从空表开始
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(target: "ajs.store", path = %path.display(), keys = entries.len(), "store opened");
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> StoreResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&self.entries)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl StorageBackend for JsonFileStorage {
    fn get(&self, key: &str) -> StoreResult<Option<Json>> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: Json) -> StoreResult<()> {
        self.entries.insert(key.to_string(), value);
        self.flush()
    }

    fn remove(&mut self, key: &str) -> StoreResult<bool> {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.flush()?;
        }
        Ok(removed)
    }

    fn clear(&mut self) -> StoreResult<()> {
        self.entries.clear();
        self.flush()
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        Ok(self.entries.keys().cloned().collect())
    }
}

/// 属性存储句柄，克隆后共享同一后端
#[derive(Clone)]
pub struct PropertyStore {
    backend: Arc<Mutex<Box<dyn StorageBackend>>>,
}

impl PropertyStore {
    pub fn with_backend(backend: impl StorageBackend + 'static) -> Self {
        let backend: Box<dyn StorageBackend> = Box::new(backend);
        Self {
            backend: Arc::new(Mutex::new(backend)),
        }
    }

    pub fn in_memory() -> Self {
        Self::with_backend(MemoryStorage::default())
    }

    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Ok(Self::with_backend(JsonFileStorage::open(path)?))
    }

    /// 按配置选择后端：有路径用文件，否则用内存
    pub fn from_config(config: &StorageConfig) -> StoreResult<Self> {
        match &config.path {
            Some(path) => Self::open(path),
            None => Ok(Self::in_memory()),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut dyn StorageBackend) -> StoreResult<R>) -> StoreResult<R> {
        let mut guard = self.backend.lock().map_err(|_| StoreError::Poisoned)?;
        f(&mut **guard)
    }

    pub fn store(&self, key: &str, value: Json) -> StoreResult<()> {
        tracing::trace!(target: "ajs.store", key, "store");
        self.with(|b| b.put(key, value))
    }

    pub fn load(&self, key: &str) -> StoreResult<Option<Json>> {
        self.with(|b| b.get(key))
    }

    pub fn remove(&self, key: &str) -> StoreResult<bool> {
        self.with(|b| b.remove(key))
    }

    pub fn clear(&self) -> StoreResult<()> {
        tracing::info!(target: "ajs.store", "store cleared");
        self.with(|b| b.clear())
    }

    pub fn keys(&self) -> StoreResult<Vec<String>> {
        self.with(|b| b.keys())
    }
}

impl Default for PropertyStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl std::fmt::Debug for PropertyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyStore")
            .field("keys", &self.keys().unwrap_or_default())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_memory_round_trip() {
        let store = PropertyStore::in_memory();
        let value = json!({"on": true, "level": [1, 2, 3], "name": "lamp"});
        store.store("state", value.clone()).unwrap();
        assert_eq!(store.load("state").unwrap(), Some(value));
        assert_eq!(store.load("missing").unwrap(), None);
    }

    #[test]
    fn test_clones_share_backend() {
        let store = PropertyStore::in_memory();
        let other = store.clone();
        other.store("k", json!(1)).unwrap();
        assert_eq!(store.load("k").unwrap(), Some(json!(1)));
        store.clear().unwrap();
        assert!(other.keys().unwrap().is_empty());
    }

    #[test]
    fn test_file_backend_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");
        {
            let store = PropertyStore::open(&path).unwrap();
            store.store("DefaultLanguage", json!("fr")).unwrap();
            store.store("count", json!(3)).unwrap();
            assert!(store.remove("count").unwrap());
        }
        let reopened = PropertyStore::open(&path).unwrap();
        assert_eq!(reopened.load("DefaultLanguage").unwrap(), Some(json!("fr")));
        assert_eq!(reopened.keys().unwrap(), vec!["DefaultLanguage".to_string()]);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(PropertyStore::open(&path), Err(StoreError::Serde(_))));
    }
}
