//! Error taxonomy shared by every aex crate.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Tier;
use crate::schema::FieldViolation;

pub type AexResult<T> = Result<T, AexError>;

/// Errors raised while building registries or executing actions
#[derive(Debug, Error)]
pub enum AexError {
    /// Input parameters do not match the action's declared input shape
    #[error("invalid input for action '{action}': {}", join_violations(.violations))]
    Validation {
        action: String,
        violations: Vec<FieldViolation>,
    },

    /// A step failed and aborted the remaining steps of its action
    #[error("step {step_index} ({step}) of action '{action}' failed: {source}")]
    StepFailed {
        action: String,
        step_index: usize,
        step: String,
        #[source]
        source: Box<AexError>,
    },

    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },

    /// Every candidate of the tier and of the recovery pass failed
    #[error("all {attempts} model attempts for tier {tier} failed; last error: {last_error}")]
    CascadeExhausted {
        tier: Tier,
        attempts: usize,
        last_error: String,
    },

    #[error("no model candidate can serve tier {tier}")]
    NoCandidates { tier: Tier },

    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// Dangling references or invalid definitions found at registry build time
    #[error("invalid action registry: {}", .0.join("; "))]
    Registry(Vec<String>),

    #[error("action nesting exceeded maximum depth of {max}")]
    DepthExceeded { max: usize },

    #[error("run cancelled")]
    Cancelled,

    #[error("function step error: {0}")]
    Function(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AexError {
    pub fn function(msg: impl Into<String>) -> Self {
        Self::Function(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Index of the failing step when this error wraps a step failure
    pub fn step_index(&self) -> Option<usize> {
        match self {
            Self::StepFailed { step_index, .. } => Some(*step_index),
            _ => None,
        }
    }

    /// Field violations carried by a validation error, searching wrapped causes
    pub fn violations(&self) -> &[FieldViolation] {
        match self {
            Self::Validation { violations, .. } => violations,
            Self::StepFailed { source, .. } => source.violations(),
            _ => &[],
        }
    }

    /// The innermost error, skipping step wrappers
    pub fn root_cause(&self) -> &AexError {
        match self {
            Self::StepFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

fn join_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Failure reported by the external model-invocation function
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelCallError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("provider returned {status}: {message}")]
    Provider { status: u16, message: String },

    /// The candidate rejected a request feature it does not support
    #[error("candidate does not support {0}")]
    Unsupported(Capability),

    #[error("model call timed out")]
    Timeout,
}

/// Request features a candidate may lack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ToolCalling,
    ForcedToolChoice,
    StructuredOutput,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Capability::ToolCalling => "tool calling",
            Capability::ForcedToolChoice => "forced tool choice",
            Capability::StructuredOutput => "structured output",
        };
        f.write_str(label)
    }
}
