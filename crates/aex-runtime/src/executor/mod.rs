//! Action executor module - step execution, tool-choice loop and the engine

mod runtime;
mod step_executor;
mod tool_loop;

pub use runtime::{Engine, EngineBuilder, RunFailure, RunOutcome};
