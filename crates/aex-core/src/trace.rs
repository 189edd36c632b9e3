//! Execution trace tree data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    Action,
    Step,
    ModelCall,
    Warning,
}

impl std::fmt::Display for TraceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TraceKind::Action => "action",
            TraceKind::Step => "step",
            TraceKind::ModelCall => "model_call",
            TraceKind::Warning => "warning",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Running,
    Success,
    Error,
}

impl TraceStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, TraceStatus::Running)
    }
}

/// One recorded unit of execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceNode {
    pub id: String,
    pub kind: TraceKind,
    pub name: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Value,
    pub status: TraceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub children: Vec<TraceNode>,
}

impl TraceNode {
    pub fn new(id: impl Into<String>, kind: TraceKind, name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            kind,
            name: name.into(),
            input,
            output: Value::Null,
            status: TraceStatus::Running,
            error: None,
            start_time: Utc::now(),
            duration_ms: None,
            children: Vec::new(),
        }
    }

    /// Depth-first search by id
    pub fn find(&self, id: &str) -> Option<&TraceNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut TraceNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter_mut().find_map(|child| child.find_mut(id))
    }

    /// Every node in the tree, depth first, parents before children
    pub fn walk(&self) -> Vec<&TraceNode> {
        let mut nodes = vec![self];
        for child in &self.children {
            nodes.extend(child.walk());
        }
        nodes
    }

    /// Whether every node in the tree reached a terminal status
    pub fn is_settled(&self) -> bool {
        self.walk().iter().all(|n| n.status.is_finished())
    }
}
