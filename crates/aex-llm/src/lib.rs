//! aex LLM - model selection for the aex action engine
//!
//! The [`ModelCascade`] picks candidates for a requested tier, tracks
//! per-candidate health in an injected [`StatsStore`] and falls back to a
//! recovery pass over every known candidate before giving up. Transport is
//! delegated to an [`aex_core::ModelClient`].

pub mod cascade;
pub mod mock;
pub mod stats;

pub use cascade::{AttemptObserver, CascadeAttempt, CascadePass, Generation, ModelCascade};
pub use mock::{RecordedCall, ScriptedModelClient};
pub use stats::{BackoffPolicy, CandidateStats, InMemoryStatsStore, StatsStore};
