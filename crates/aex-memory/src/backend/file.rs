//! File-based store for persistent statistics and traces
//!
//! Stores entries in a JSON file that persists across engine restarts.
//! Supports an optional max_entries limit to prevent unbounded file growth.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use aex_core::{AexError, AexResult, KvStore};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{next_sequence, trim_oldest, StoredEntry};

/// File-based store
///
/// All entries live in one JSON file. Every change is written immediately.
///
/// ## Max Entries Limit
///
/// When the limit is reached, the oldest entries (by write time) are removed
/// to make room for new ones.
///
/// ## Example
///
/// ```rust,no_run
/// use aex_memory::FileStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// // Unlimited entries
/// let store = FileStore::new("./engine-state.json").await?;
///
/// // Limited to 500 most recent entries
/// let store = FileStore::with_max_entries("./engine-state.json", Some(500)).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct FileStore {
    path: PathBuf,
    cache: Arc<RwLock<HashMap<String, StoredEntry>>>,
    max_entries: Option<usize>,
}

impl FileStore {
    /// Open the store at `path`, loading existing entries if the file exists
    pub async fn new(path: impl Into<PathBuf>) -> AexResult<Self> {
        Self::with_max_entries(path, None).await
    }

    /// Open with an optional limit; an over-limit file is trimmed on load
    pub async fn with_max_entries(
        path: impl Into<PathBuf>,
        max_entries: Option<usize>,
    ) -> AexResult<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    AexError::store(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let mut cache: HashMap<String, StoredEntry> = if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
                AexError::store(format!("Failed to read store file {}: {}", path.display(), e))
            })?;

            if content.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&content).map_err(|e| {
                    AexError::store(format!(
                        "Failed to parse store file {}: {}",
                        path.display(),
                        e
                    ))
                })?
            }
        } else {
            HashMap::new()
        };

        let mut trimmed = false;
        if let Some(max) = max_entries {
            for key in trim_oldest(cache.iter(), cache.len(), max) {
                cache.remove(&key);
                trimmed = true;
            }
        }

        let store = Self {
            path,
            cache: Arc::new(RwLock::new(cache)),
            max_entries,
        };

        if trimmed {
            store.persist().await?;
        }

        Ok(store)
    }

    /// Write the cache to disk. Callers hold no lock; the snapshot is taken
    /// under a read lock and released before the write.
    async fn persist(&self) -> AexResult<()> {
        let cache = self.cache.read().await;
        let content = serde_json::to_string_pretty(&*cache)
            .map_err(|e| AexError::store(format!("Failed to serialize store: {}", e)))?;
        drop(cache);

        tokio::fs::write(&self.path, content).await.map_err(|e| {
            AexError::store(format!(
                "Failed to write store file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        Ok(())
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn max_entries(&self) -> Option<usize> {
        self.max_entries
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, key: &str) -> AexResult<Option<Value>> {
        Ok(self.cache.read().await.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Value) -> AexResult<()> {
        {
            let mut cache = self.cache.write().await;
            let sequence = next_sequence(&cache);
            cache.insert(key.to_string(), StoredEntry::new(value, sequence));

            if let Some(max) = self.max_entries {
                for evicted in trim_oldest(cache.iter(), cache.len(), max) {
                    tracing::debug!("Evicting oldest entry: {}", evicted);
                    cache.remove(&evicted);
                }
            }
        }
        self.persist().await
    }

    async fn delete(&self, key: &str) -> AexResult<()> {
        let removed = self.cache.write().await.remove(key).is_some();
        if removed {
            self.persist().await?;
        }
        Ok(())
    }

    async fn list_keys(&self, prefix: Option<&str>) -> AexResult<Vec<String>> {
        let cache = self.cache.read().await;
        Ok(match prefix {
            Some(p) => cache.keys().filter(|k| k.starts_with(p)).cloned().collect(),
            None => cache.keys().cloned().collect(),
        })
    }
}
