//! Trace retention: live traces in memory, completed ones in the key/value
//! store under `trace:<id>`, bounded by an insertion-ordered index.

use std::collections::VecDeque;
use std::sync::Arc;

use aex_core::store::{trace_key, TRACE_INDEX_KEY};
use aex_core::{AexResult, KvStore, TraceNode};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use super::{RunTrace, TraceSpan};

pub struct TraceStore {
    live: DashMap<String, Arc<RunTrace>>,
    /// Finished trace ids, oldest first
    finished: Mutex<VecDeque<String>>,
    store: Option<Arc<dyn KvStore>>,
    max_retained: usize,
    /// Serializes read-modify-write of the persisted index
    index_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for TraceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceStore")
            .field("live", &self.live.len())
            .field("max_retained", &self.max_retained)
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl TraceStore {
    pub fn new(store: Option<Arc<dyn KvStore>>, max_retained: usize) -> Self {
        Self {
            live: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
            store,
            max_retained,
            index_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Start a trace and open its root node
    pub fn begin(&self, trace_id: &str, action: &str, input: Value) -> (Arc<RunTrace>, TraceSpan) {
        let trace = RunTrace::new(trace_id, self.store.clone());
        let root = trace.root(action, input);
        self.live.insert(trace_id.to_string(), trace.clone());
        (trace, root)
    }

    /// Tree of an in-progress or retained trace
    pub async fn get(&self, trace_id: &str) -> AexResult<Option<TraceNode>> {
        if let Some(trace) = self.live.get(trace_id).map(|t| t.clone()) {
            return Ok(trace.snapshot());
        }
        let Some(store) = &self.store else {
            return Ok(None);
        };
        match store.get(&trace_key(trace_id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Await outstanding writes, persist the final tree and apply retention
    pub async fn finish(&self, trace: &RunTrace) -> AexResult<()> {
        trace.flush().await;
        trace.write_snapshot().await?;

        let evicted = {
            let mut finished = self.finished.lock();
            finished.push_back(trace.trace_id().to_string());
            let overflow = finished.len().saturating_sub(self.max_retained);
            finished.drain(..overflow).collect::<Vec<_>>()
        };
        for id in &evicted {
            self.live.remove(id);
        }

        if let Some(store) = &self.store {
            let _guard = self.index_lock.lock().await;
            let mut index: Vec<String> = match store.get(TRACE_INDEX_KEY).await? {
                Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                    warn!("Discarding unreadable trace index: {}", e);
                    Vec::new()
                }),
                None => Vec::new(),
            };
            index.retain(|id| id != trace.trace_id());
            index.push(trace.trace_id().to_string());

            let overflow = index.len().saturating_sub(self.max_retained);
            for id in index.drain(..overflow) {
                debug!("Evicting persisted trace {}", id);
                store.delete(&trace_key(&id)).await?;
            }
            store.set(TRACE_INDEX_KEY, serde_json::to_value(&index)?).await?;
        }
        Ok(())
    }

    /// Forget a live trace without persisting it
    pub fn discard(&self, trace_id: &str) {
        self.live.remove(trace_id);
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aex_core::TraceStatus;
    use aex_memory::InMemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_get_reads_live_then_store() {
        let kv = Arc::new(InMemoryStore::new());
        let traces = TraceStore::new(Some(kv.clone()), 10);

        let (trace, root) = traces.begin("t1", "greet", json!({"name": "Ada"}));
        assert_eq!(traces.get("t1").await.unwrap().unwrap().status, TraceStatus::Running);

        root.succeed(json!({"ok": true}));
        traces.finish(&trace).await.unwrap();

        // A fresh store instance over the same persistence sees the tree
        let reader = TraceStore::new(Some(kv), 10);
        let tree = reader.get("t1").await.unwrap().unwrap();
        assert_eq!(tree.name, "greet");
        assert_eq!(tree.output, json!({"ok": true}));
        assert!(reader.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retention_evicts_oldest() {
        let kv = Arc::new(InMemoryStore::new());
        let traces = TraceStore::new(Some(kv.clone()), 2);

        for id in ["a", "b", "c"] {
            let (trace, root) = traces.begin(id, "run", Value::Null);
            root.succeed(Value::Null);
            traces.finish(&trace).await.unwrap();
        }

        assert_eq!(traces.live_count(), 2);
        assert!(traces.get("a").await.unwrap().is_none());
        assert!(traces.get("c").await.unwrap().is_some());

        let index = kv.get(TRACE_INDEX_KEY).await.unwrap().unwrap();
        assert_eq!(index, json!(["b", "c"]));
        assert!(kv.get(&trace_key("a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_without_store_traces_stay_in_memory() {
        let traces = TraceStore::new(None, 1);
        let (first, root) = traces.begin("x", "run", Value::Null);
        root.succeed(Value::Null);
        traces.finish(&first).await.unwrap();
        assert!(traces.get("x").await.unwrap().is_some());

        let (second, root) = traces.begin("y", "run", Value::Null);
        root.succeed(Value::Null);
        traces.finish(&second).await.unwrap();
        assert!(traces.get("x").await.unwrap().is_none());
        assert!(traces.get("y").await.unwrap().is_some());
    }
}
