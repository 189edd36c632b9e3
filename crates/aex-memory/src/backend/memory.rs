//! In-memory store using DashMap for concurrent access

use std::sync::atomic::{AtomicU64, Ordering};

use aex_core::{AexResult, KvStore};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use super::{trim_oldest, StoredEntry};

/// Ephemeral store, cleared on restart
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: DashMap<String, StoredEntry>,
    sequence: AtomicU64,
    max_entries: Option<usize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `max_entries`, evicting the oldest writes first
    pub fn with_max_entries(max_entries: Option<usize>) -> Self {
        Self {
            max_entries,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn enforce_limit(&self) {
        let Some(max) = self.max_entries else {
            return;
        };
        if self.entries.len() <= max {
            return;
        }

        let snapshot: Vec<(String, StoredEntry)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let evicted = trim_oldest(snapshot.iter().map(|(k, e)| (k, e)), snapshot.len(), max);
        for key in evicted {
            tracing::debug!("Evicting oldest entry: {}", key);
            self.entries.remove(&key);
        }
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn get(&self, key: &str) -> AexResult<Option<Value>> {
        Ok(self.entries.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Value) -> AexResult<()> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.entries
            .insert(key.to_string(), StoredEntry::new(value, sequence));
        self.enforce_limit();
        Ok(())
    }

    async fn delete(&self, key: &str) -> AexResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: Option<&str>) -> AexResult<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| prefix.map_or(true, |p| e.key().starts_with(p)))
            .map(|e| e.key().clone())
            .collect())
    }
}
