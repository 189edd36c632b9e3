//! aex Runtime - executes actions from a validated registry
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use aex_core::{Action, ActionRegistry, FieldType, InputSchema, Step};
//! use aex_llm::ScriptedModelClient;
//! use aex_runtime::Engine;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = ActionRegistry::builder()
//!     .register(
//!         Action::new("greet")
//!             .input(InputSchema::new().required("name", FieldType::String))
//!             .step(Step::function("hello", |ctx| async move {
//!                 let name = ctx.get("name").cloned().unwrap_or_default();
//!                 Ok(json!({ "greeting": format!("Hello {}", name.as_str().unwrap_or("")) }))
//!             })),
//!     )
//!     .build()?;
//!
//! let engine = Engine::builder(registry, Arc::new(ScriptedModelClient::new()))
//!     .build()
//!     .await?;
//! let outcome = engine.run_action("greet", json!({ "name": "Ada" })).await?;
//! println!("{} -> {}", outcome.trace_id, outcome.result["greeting"]);
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod executor;
pub mod tracer;

pub use events::RunEvent;
pub use executor::{Engine, EngineBuilder, RunFailure, RunOutcome};
pub use tracer::{RunTrace, TraceSpan, TraceStore, ABANDONED};

pub use tokio_util::sync::CancellationToken;
