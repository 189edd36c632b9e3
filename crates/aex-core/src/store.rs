//! Persistence contract used for candidate statistics and completed traces.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::AexResult;

/// Opaque key/value persistence provider
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> AexResult<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> AexResult<()>;

    async fn delete(&self, key: &str) -> AexResult<()>;

    /// Keys currently held, optionally filtered by prefix
    async fn list_keys(&self, prefix: Option<&str>) -> AexResult<Vec<String>>;
}

/// Key under which cascade statistics are persisted
pub const CASCADE_STATS_KEY: &str = "cascade:stats";
/// Key holding the ordered list of persisted trace ids
pub const TRACE_INDEX_KEY: &str = "trace:index";
pub const TRACE_KEY_PREFIX: &str = "trace:";

pub fn trace_key(trace_id: &str) -> String {
    format!("{}{}", TRACE_KEY_PREFIX, trace_id)
}
