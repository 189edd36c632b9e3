// aex Core - Foundation types and traits for the aex action engine
//
// Declarative actions made of typed steps, the validated registry that holds
// them, and the contracts the engine consumes (model invocation, ambient
// context, persistence).

pub mod action;
pub mod config;
pub mod context;
pub mod conversation;
pub mod error;
pub mod model;
pub mod registry;
pub mod schema;
pub mod store;
pub mod template;
pub mod trace;

// Re-export core types
pub use action::{
    Action, ActionId, ActionSpec, FnStep, FunctionStep, ModelStep, ModelStepMode, SkipPredicate,
    Step, StepFunction, StepKind, StepSpec, SubActionStep, ToolChoice,
};
pub use config::{
    AmbientConfig, AmbientRefresh, CascadeConfig, ConversationConfig, EngineConfig,
    TimeoutConfig, TraceConfig,
};
pub use context::{is_truthy, RunContext, DEFAULT_OUTPUT_KEY};
pub use conversation::{Message, MessageRole, PruningPolicy, ToolCall, Transcript};
pub use error::{AexError, AexResult, Capability, ModelCallError};
pub use model::{
    CapabilityFlags, ModelCandidate, ModelClient, ModelRequest, ModelResponse, RequestedOutput,
    Tier, ToolDefinition,
};
pub use registry::{ActionRegistry, ActionRegistryBuilder, RegistryIssue};
pub use schema::{FieldSpec, FieldType, FieldViolation, InputSchema, OutputSchema, ValidationReport};
pub use store::KvStore;
pub use template::{AmbientContext, AmbientProvider, ClockProvider, TemplateResolver};
pub use trace::{TraceKind, TraceNode, TraceStatus};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
