//! Store backends and the entry format they share

pub mod file;
pub mod memory;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A stored value with the bookkeeping needed for oldest-first eviction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub value: Value,
    pub written_at: DateTime<Utc>,
    /// Monotonic write counter; breaks ties between equal timestamps
    #[serde(default)]
    pub sequence: u64,
}

impl StoredEntry {
    pub fn new(value: Value, sequence: u64) -> Self {
        Self {
            value,
            written_at: Utc::now(),
            sequence,
        }
    }

    fn age_key(&self) -> (DateTime<Utc>, u64) {
        (self.written_at, self.sequence)
    }
}

/// Remove the oldest entries until at most `max` remain. Returns the evicted keys.
pub(crate) fn trim_oldest<'a, I>(entries: I, len: usize, max: usize) -> Vec<String>
where
    I: Iterator<Item = (&'a String, &'a StoredEntry)>,
{
    if len <= max {
        return Vec::new();
    }

    let mut by_age: Vec<_> = entries.map(|(k, e)| (e.age_key(), k.clone())).collect();
    by_age.sort();
    by_age
        .into_iter()
        .take(len - max)
        .map(|(_, key)| key)
        .collect()
}

pub(crate) fn next_sequence(entries: &HashMap<String, StoredEntry>) -> u64 {
    entries.values().map(|e| e.sequence + 1).max().unwrap_or(0)
}
