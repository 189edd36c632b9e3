//! Execution tracer
//!
//! Every run owns a [`RunTrace`]: a flat map of node records keyed by node id,
//! assembled into a [`TraceNode`] tree on demand. A child id is its parent's id
//! plus `/<kind>:<name>#<seq>`, with `seq` taken from a counter stored on the
//! parent record, so concurrent subtrees never coordinate on a shared counter.
//!
//! [`TraceSpan`] is the handle an executor holds while a node is open. A span
//! dropped without being finished closes its node as an error, so a cancelled
//! or panicking run never leaves a node in `running`.

mod store;

pub use store::TraceStore;

use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;

use aex_core::{store::trace_key, KvStore, TraceKind, TraceNode, TraceStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::warn;

/// Error message given to nodes whose span was dropped while still open
pub const ABANDONED: &str = "abandoned";

struct NodeRecord {
    node: TraceNode,
    children: Vec<String>,
    next_child: usize,
    started: Instant,
}

/// Trace tree of a single run
pub struct RunTrace {
    trace_id: String,
    nodes: DashMap<String, NodeRecord>,
    /// Snapshot writes not yet awaited
    pending: Mutex<Vec<JoinHandle<()>>>,
    /// Serializes snapshot writes so a stale snapshot never lands last
    write_lock: tokio::sync::Mutex<()>,
    store: Option<Arc<dyn KvStore>>,
}

impl std::fmt::Debug for RunTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunTrace")
            .field("trace_id", &self.trace_id)
            .field("nodes", &self.nodes.len())
            .finish_non_exhaustive()
    }
}

impl RunTrace {
    pub(crate) fn new(trace_id: &str, store: Option<Arc<dyn KvStore>>) -> Arc<Self> {
        Arc::new(Self {
            trace_id: trace_id.to_string(),
            nodes: DashMap::new(),
            pending: Mutex::new(Vec::new()),
            write_lock: tokio::sync::Mutex::new(()),
            store,
        })
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Open the root node; its id is the trace id
    pub(crate) fn root(self: &Arc<Self>, name: &str, input: Value) -> TraceSpan {
        let id = self.trace_id.clone();
        self.insert(TraceNode::new(id.clone(), TraceKind::Action, name, input));
        TraceSpan::new(self.clone(), id)
    }

    /// Open a child under an existing node
    pub fn open_child(self: &Arc<Self>, parent_id: &str, kind: TraceKind, name: &str, input: Value) -> TraceSpan {
        let id = self.allocate_child(parent_id, kind, name);
        self.insert(TraceNode::new(id.clone(), kind, name, input));
        TraceSpan::new(self.clone(), id)
    }

    /// Record a child that has already finished
    #[allow(clippy::too_many_arguments)]
    pub fn record_child(
        &self,
        parent_id: &str,
        kind: TraceKind,
        name: &str,
        input: Value,
        output: Value,
        error: Option<String>,
        start_time: DateTime<Utc>,
        duration_ms: u64,
    ) {
        let id = self.allocate_child(parent_id, kind, name);
        let mut node = TraceNode::new(id, kind, name, input);
        node.output = output;
        node.status = if error.is_some() {
            TraceStatus::Error
        } else {
            TraceStatus::Success
        };
        node.error = error;
        node.start_time = start_time;
        node.duration_ms = Some(duration_ms);
        self.insert(node);
    }

    fn allocate_child(&self, parent_id: &str, kind: TraceKind, name: &str) -> String {
        match self.nodes.get_mut(parent_id) {
            Some(mut parent) => {
                let id = format!("{}/{}:{}#{}", parent_id, kind, name, parent.next_child);
                parent.next_child += 1;
                parent.children.push(id.clone());
                id
            }
            None => {
                warn!("Trace {}: parent node {} not found", self.trace_id, parent_id);
                format!("{}/{}:{}#detached", parent_id, kind, name)
            }
        }
    }

    fn insert(&self, node: TraceNode) {
        self.nodes.insert(
            node.id.clone(),
            NodeRecord {
                node,
                children: Vec::new(),
                next_child: 0,
                started: Instant::now(),
            },
        );
    }

    /// Move a running node to a terminal status. Returns the node kind when
    /// the transition happened.
    fn complete(&self, id: &str, status: TraceStatus, output: Value, error: Option<String>) -> Option<TraceKind> {
        let mut guard = self.nodes.get_mut(id)?;
        let record = &mut *guard;
        if record.node.status.is_finished() {
            return None;
        }
        record.node.status = status;
        record.node.output = output;
        record.node.error = error;
        record.node.duration_ms = Some(record.started.elapsed().as_millis() as u64);
        Some(record.node.kind)
    }

    /// Assemble the current tree
    pub fn snapshot(&self) -> Option<TraceNode> {
        self.assemble(&self.trace_id)
    }

    fn assemble(&self, id: &str) -> Option<TraceNode> {
        let (mut node, children) = {
            let record = self.nodes.get(id)?;
            (record.node.clone(), record.children.clone())
        };
        node.children = children.iter().filter_map(|c| self.assemble(c)).collect();
        Some(node)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Queue a snapshot write; it is awaited by [`RunTrace::flush`]
    fn schedule_write(self: &Arc<Self>) {
        if self.store.is_none() {
            return;
        }
        let trace = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = trace.write_snapshot().await {
                warn!("Failed to persist trace {}: {}", trace.trace_id, e);
            }
        });
        self.pending.lock().push(handle);
    }

    /// Write the tree as it is when the write lock is acquired
    pub(crate) async fn write_snapshot(&self) -> aex_core::AexResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;
        if let Some(tree) = self.snapshot() {
            store.set(&trace_key(&self.trace_id), serde_json::to_value(&tree)?).await?;
        }
        Ok(())
    }

    /// Await every pending write, including ones queued while waiting
    pub async fn flush(&self) {
        loop {
            let handles = std::mem::take(&mut *self.pending.lock());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!("Trace write task for {} failed: {}", self.trace_id, e);
                }
            }
        }
    }

    pub fn pending_writes(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Handle to an open trace node
pub struct TraceSpan {
    trace: Arc<RunTrace>,
    id: String,
    finished: bool,
}

impl std::fmt::Debug for TraceSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceSpan").field("id", &self.id).finish()
    }
}

impl TraceSpan {
    fn new(trace: Arc<RunTrace>, id: String) -> Self {
        Self {
            trace,
            id,
            finished: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn trace(&self) -> &Arc<RunTrace> {
        &self.trace
    }

    pub fn child(&self, kind: TraceKind, name: &str, input: Value) -> TraceSpan {
        self.trace.open_child(&self.id, kind, name, input)
    }

    /// Attach a finished warning node
    pub fn warning(&self, name: &str, detail: Value) {
        self.trace.record_child(
            &self.id,
            TraceKind::Warning,
            name,
            detail,
            Value::Null,
            None,
            Utc::now(),
            0,
        );
    }

    pub fn succeed(mut self, output: Value) {
        self.finish(TraceStatus::Success, output, None);
    }

    pub fn fail(mut self, error: impl Display) {
        self.finish(TraceStatus::Error, Value::Null, Some(error.to_string()));
    }

    fn finish(&mut self, status: TraceStatus, output: Value, error: Option<String>) {
        self.finished = true;
        if self.trace.complete(&self.id, status, output, error) == Some(TraceKind::Action) {
            self.trace.schedule_write();
        }
    }
}

impl Drop for TraceSpan {
    fn drop(&mut self) {
        if !self.finished {
            self.trace
                .complete(&self.id, TraceStatus::Error, Value::Null, Some(ABANDONED.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aex_memory::InMemoryStore;
    use serde_json::json;

    #[test]
    fn test_child_ids_use_parent_counters() {
        let trace = RunTrace::new("t1", None);
        let root = trace.root("greet", json!({}));
        let a = root.child(TraceKind::Step, "function:load", Value::Null);
        let b = root.child(TraceKind::Step, "model:hello", Value::Null);
        let nested = a.child(TraceKind::Action, "lookup", Value::Null);

        assert_eq!(a.id(), "t1/step:function:load#0");
        assert_eq!(b.id(), "t1/step:model:hello#1");
        assert_eq!(nested.id(), "t1/step:function:load#0/action:lookup#0");

        nested.succeed(json!({"ok": true}));
        a.succeed(Value::Null);
        b.fail("boom");
        root.succeed(Value::Null);

        let tree = trace.snapshot().unwrap();
        assert!(tree.is_settled());
        assert_eq!(tree.children.len(), 2);
        assert_eq!(tree.children[1].status, TraceStatus::Error);
        assert_eq!(tree.children[1].error.as_deref(), Some("boom"));
        assert_eq!(tree.children[0].children[0].output, json!({"ok": true}));
    }

    #[test]
    fn test_dropped_span_is_abandoned() {
        let trace = RunTrace::new("t2", None);
        let root = trace.root("run", Value::Null);
        {
            let _open = root.child(TraceKind::Step, "slow", Value::Null);
        }
        drop(root);

        let tree = trace.snapshot().unwrap();
        assert_eq!(tree.status, TraceStatus::Error);
        assert_eq!(tree.children[0].error.as_deref(), Some(ABANDONED));
        assert!(tree.is_settled());
    }

    #[test]
    fn test_finished_nodes_do_not_change() {
        let trace = RunTrace::new("t3", None);
        let root = trace.root("run", Value::Null);
        let id = root.id().to_string();
        root.succeed(json!(1));

        assert_eq!(trace.complete(&id, TraceStatus::Error, Value::Null, None), None);
        assert_eq!(trace.snapshot().unwrap().status, TraceStatus::Success);
    }

    #[test]
    fn test_record_child_and_warning() {
        let trace = RunTrace::new("t4", None);
        let root = trace.root("run", Value::Null);
        root.warning("free_text_response", json!({"turn": 1}));
        trace.record_child(
            root.id(),
            TraceKind::ModelCall,
            "m@e",
            Value::Null,
            Value::Null,
            Some("down".into()),
            Utc::now(),
            12,
        );
        root.succeed(Value::Null);

        let tree = trace.snapshot().unwrap();
        assert_eq!(tree.children[0].kind, TraceKind::Warning);
        assert_eq!(tree.children[1].id, "t4/model_call:m@e#1");
        assert_eq!(tree.children[1].status, TraceStatus::Error);
        assert_eq!(tree.children[1].duration_ms, Some(12));
    }

    #[tokio::test]
    async fn test_action_completion_queues_write() {
        let store = Arc::new(InMemoryStore::new());
        let trace = RunTrace::new("t5", Some(store.clone()));
        let root = trace.root("run", json!({"x": 1}));
        let step = root.child(TraceKind::Step, "s", Value::Null);
        step.succeed(Value::Null);
        assert_eq!(trace.pending_writes(), 0);

        root.succeed(json!({"done": true}));
        trace.flush().await;

        let stored = store.get(&trace_key("t5")).await.unwrap().unwrap();
        let tree: TraceNode = serde_json::from_value(stored).unwrap();
        assert_eq!(tree.output, json!({"done": true}));
        assert_eq!(tree.children.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_children_never_collide() {
        let trace = RunTrace::new("t6", None);
        let root = Arc::new(trace.root("run", Value::Null));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let root = root.clone();
                tokio::spawn(async move {
                    let span = root.child(TraceKind::Action, "same", Value::Null);
                    let id = span.id().to_string();
                    span.succeed(Value::Null);
                    id
                })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 16);
        assert_eq!(trace.node_count(), 17);
    }
}
