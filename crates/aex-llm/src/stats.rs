//! Per-candidate statistics shared by every concurrent run.
//!
//! The store is injected into the cascade at construction. Each update is a
//! single read-modify-write under the map's shard lock, so concurrent runs
//! never lose increments.

use std::collections::HashMap;
use std::time::Duration;

use aex_core::{AexResult, Capability, CascadeConfig};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Rolling statistics for one candidate key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateStats {
    pub successes: u64,
    pub errors: u64,
    /// Errors since the last success
    pub consecutive_errors: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Capabilities the candidate was observed to reject
    #[serde(default)]
    pub unsupported: Vec<Capability>,
}

impl CandidateStats {
    /// Errors since the last success, or zero once the latest error has aged
    /// out of the decay window
    pub fn recent_errors(&self, now: DateTime<Utc>, decay_window: Duration) -> u32 {
        match self.last_error_at {
            Some(at) if self.consecutive_errors > 0 && elapsed(at, now) < decay_window => {
                self.consecutive_errors
            }
            _ => 0,
        }
    }

    /// End of the backoff period, if the candidate is in one
    pub fn backoff_until(&self, now: DateTime<Utc>, policy: &BackoffPolicy) -> Option<DateTime<Utc>> {
        let recent = self.recent_errors(now, policy.decay_window);
        let last_error = self.last_error_at?;
        if recent == 0 {
            return None;
        }
        let delay = policy.delay_for(recent);
        let until = last_error + chrono::Duration::from_std(delay).ok()?;
        (until > now).then_some(until)
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

/// Exponential backoff applied to candidates with recent errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub decay_window: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&CascadeConfig::default())
    }
}

impl From<&CascadeConfig> for BackoffPolicy {
    fn from(config: &CascadeConfig) -> Self {
        Self {
            base: config.backoff_base,
            max: config.backoff_max,
            decay_window: config.error_decay_window,
        }
    }
}

impl BackoffPolicy {
    /// `min(base * 2^(n-1), max)` for `n` recent errors
    pub fn delay_for(&self, recent_errors: u32) -> Duration {
        if recent_errors == 0 {
            return Duration::ZERO;
        }
        let exponent = (recent_errors - 1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }
}

/// Injected statistics store
pub trait StatsStore: Send + Sync {
    fn record_success(&self, key: &str, at: DateTime<Utc>);

    fn record_error(&self, key: &str, at: DateTime<Utc>, message: &str);

    fn record_unsupported(&self, key: &str, capability: Capability);

    fn get(&self, key: &str) -> Option<CandidateStats>;

    fn export(&self) -> HashMap<String, CandidateStats>;

    /// Replace the current contents with a previously exported snapshot
    fn restore(&self, snapshot: HashMap<String, CandidateStats>);
}

#[derive(Debug, Default)]
pub struct InMemoryStatsStore {
    stats: DashMap<String, CandidateStats>,
}

impl InMemoryStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

impl StatsStore for InMemoryStatsStore {
    fn record_success(&self, key: &str, at: DateTime<Utc>) {
        let mut entry = self.stats.entry(key.to_string()).or_default();
        entry.successes += 1;
        entry.consecutive_errors = 0;
        entry.last_success_at = Some(at);
    }

    fn record_error(&self, key: &str, at: DateTime<Utc>, message: &str) {
        let mut entry = self.stats.entry(key.to_string()).or_default();
        entry.errors += 1;
        entry.consecutive_errors = entry.consecutive_errors.saturating_add(1);
        entry.last_error_at = Some(at);
        entry.last_error = Some(message.to_string());
    }

    fn record_unsupported(&self, key: &str, capability: Capability) {
        let mut entry = self.stats.entry(key.to_string()).or_default();
        if !entry.unsupported.contains(&capability) {
            entry.unsupported.push(capability);
        }
    }

    fn get(&self, key: &str) -> Option<CandidateStats> {
        self.stats.get(key).map(|s| s.clone())
    }

    fn export(&self) -> HashMap<String, CandidateStats> {
        self.stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn restore(&self, snapshot: HashMap<String, CandidateStats>) {
        self.stats.clear();
        for (key, stats) in snapshot {
            self.stats.insert(key, stats);
        }
    }
}

/// Serialize a snapshot for a key/value store
pub fn snapshot_to_value(snapshot: &HashMap<String, CandidateStats>) -> AexResult<serde_json::Value> {
    Ok(serde_json::to_value(snapshot)?)
}

pub fn snapshot_from_value(value: serde_json::Value) -> AexResult<HashMap<String, CandidateStats>> {
    Ok(serde_json::from_value(value)?)
}
