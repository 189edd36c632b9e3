//! Events streamed to an optional channel while runs execute

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        trace_id: String,
        action: String,
    },
    StepStarted {
        trace_id: String,
        action: String,
        step_index: usize,
        step: String,
    },
    StepCompleted {
        trace_id: String,
        action: String,
        step_index: usize,
        step: String,
        duration_ms: u64,
    },
    /// A sub-action step whose skip predicate held
    StepSkipped {
        trace_id: String,
        action: String,
        step_index: usize,
        step: String,
    },
    StepFailed {
        trace_id: String,
        action: String,
        step_index: usize,
        step: String,
        error: String,
    },
    /// The model picked an action inside a tool-choice loop
    ToolSelected {
        trace_id: String,
        action: String,
        tool: String,
        turn: usize,
    },
    RunCompleted {
        trace_id: String,
        action: String,
        duration_ms: u64,
    },
    RunFailed {
        trace_id: String,
        action: String,
        error: String,
        step_index: Option<usize>,
    },
}

impl RunEvent {
    pub fn trace_id(&self) -> &str {
        match self {
            RunEvent::RunStarted { trace_id, .. }
            | RunEvent::StepStarted { trace_id, .. }
            | RunEvent::StepCompleted { trace_id, .. }
            | RunEvent::StepSkipped { trace_id, .. }
            | RunEvent::StepFailed { trace_id, .. }
            | RunEvent::ToolSelected { trace_id, .. }
            | RunEvent::RunCompleted { trace_id, .. }
            | RunEvent::RunFailed { trace_id, .. } => trace_id,
        }
    }
}
