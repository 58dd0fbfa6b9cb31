use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::Result;
use crate::error::Error;
use crate::util::lock_unpoisoned;

/// Async key/value store consumed by credential-refreshing auth strategies.
///
/// Values are stored as raw JSON text. Implementations must tolerate missing
/// keys; the typed helpers on `dyn PersistStorage` additionally swallow
/// deserialization failures so a poisoned entry reads as absent rather than
/// failing the request that touched it.
#[async_trait]
pub trait PersistStorage: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String);
    async fn delete(&self, key: &str);
}

impl dyn PersistStorage {
    pub async fn get_value<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned,
    {
        let raw = self.get(key).await?;
        serde_json::from_str(&raw).ok()
    }

    pub async fn set_value<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let raw = serde_json::to_string(value).map_err(|source| Error::SerializeJson {
            source: Arc::new(source),
        })?;
        self.set(key, raw).await;
        Ok(())
    }
}

/// Volatile process-memory backend.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Option<String> {
        lock_unpoisoned(&self.entries).get(key).cloned()
    }

    async fn set(&self, key: &str, value: String) {
        lock_unpoisoned(&self.entries).insert(key.to_owned(), value);
    }

    async fn delete(&self, key: &str) {
        lock_unpoisoned(&self.entries).remove(key);
    }
}

/// JSON-file backend that survives process restarts. The whole map is
/// rewritten on every mutation; entries are token pairs and similar
/// configuration-sized values, not bulk data.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    guard: tokio::sync::Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: tokio::sync::Mutex::new(()),
        }
    }

    async fn load(&self) -> BTreeMap<String, String> {
        let Ok(raw) = tokio::fs::read_to_string(&self.path).await else {
            return BTreeMap::new();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    async fn store(&self, entries: &BTreeMap<String, String>) {
        let Ok(raw) = serde_json::to_string_pretty(entries) else {
            return;
        };
        if let Err(error) = tokio::fs::write(&self.path, raw).await {
            tracing::warn!(path = %self.path.display(), error = %error, "failed to persist storage file");
        }
    }
}

#[async_trait]
impl PersistStorage for FileStorage {
    async fn get(&self, key: &str) -> Option<String> {
        let _guard = self.guard.lock().await;
        self.load().await.remove(key)
    }

    async fn set(&self, key: &str, value: String) {
        let _guard = self.guard.lock().await;
        let mut entries = self.load().await;
        entries.insert(key.to_owned(), value);
        self.store(&entries).await;
    }

    async fn delete(&self, key: &str) {
        let _guard = self.guard.lock().await;
        let mut entries = self.load().await;
        if entries.remove(key).is_some() {
            self.store(&entries).await;
        }
    }
}
