//! Action and step definitions.
//!
//! Definitions are generic over how they reference other actions: user code
//! writes [`ActionSpec`]s that name other actions by string, and
//! [`crate::registry::ActionRegistryBuilder::build`] resolves every name into
//! an [`ActionId`], so the executor never performs a lookup that can miss.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::RunContext;
use crate::error::AexResult;
use crate::model::Tier;
use crate::schema::{InputSchema, OutputSchema};

/// Index of an action inside a built registry
///
/// Only [`crate::registry::ActionRegistryBuilder::build`] hands these out;
/// they cannot be constructed or deserialized elsewhere.
///
/// ```rust,compile_fail
/// let id: aex_core::ActionId = serde_json::from_str("7").unwrap();
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(pub(crate) usize);

impl ActionId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Handler behind a function step
#[async_trait]
pub trait StepFunction: Send + Sync {
    async fn call(&self, context: &RunContext) -> AexResult<Value>;
}

/// Adapter turning an async closure into a [`StepFunction`]
pub struct FnStep<F>(pub F);

#[async_trait]
impl<F, Fut> StepFunction for FnStep<F>
where
    F: Fn(RunContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AexResult<Value>> + Send + 'static,
{
    async fn call(&self, context: &RunContext) -> AexResult<Value> {
        (self.0)(context.clone()).await
    }
}

/// Predicate deciding that a sub-action step should be skipped
pub type SkipPredicate = Arc<dyn Fn(&RunContext) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct FunctionStep {
    pub name: String,
    pub handler: Arc<dyn StepFunction>,
    /// Overrides the engine-wide function step timeout
    pub timeout: Option<Duration>,
    pub output_key: Option<String>,
}

impl fmt::Debug for FunctionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionStep")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("output_key", &self.output_key)
            .finish_non_exhaustive()
    }
}

/// Multi-turn configuration: the model picks one action per turn until it
/// picks `stop_action` or `max_iterations` turns have elapsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolChoice<R> {
    pub available_actions: Vec<R>,
    pub stop_action: R,
    pub max_iterations: usize,
}

/// Single-turn structured output or multi-turn tool choice, never both
#[derive(Debug, Clone)]
pub enum ModelStepMode<R> {
    Structured(OutputSchema),
    ToolChoice(ToolChoice<R>),
}

#[derive(Debug, Clone)]
pub struct ModelStep<R> {
    pub name: String,
    pub tier: Tier,
    pub system_prompt: String,
    pub user_prompt: String,
    pub mode: ModelStepMode<R>,
    pub output_key: Option<String>,
}

#[derive(Clone)]
pub struct SubActionStep<R> {
    pub action: R,
    pub skip_if: Option<SkipPredicate>,
}

impl<R: fmt::Debug> fmt::Debug for SubActionStep<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubActionStep")
            .field("action", &self.action)
            .field("skip_if", &self.skip_if.is_some())
            .finish()
    }
}

/// Closed set of step kinds; dispatch over it is exhaustive
#[derive(Debug, Clone)]
pub enum Step<R = ActionId> {
    Function(FunctionStep),
    Model(ModelStep<R>),
    SubAction(SubActionStep<R>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Function,
    Model,
    SubAction,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepKind::Function => "function",
            StepKind::Model => "model",
            StepKind::SubAction => "sub_action",
        })
    }
}

impl<R> Step<R> {
    pub fn kind(&self) -> StepKind {
        match self {
            Step::Function(_) => StepKind::Function,
            Step::Model(_) => StepKind::Model,
            Step::SubAction(_) => StepKind::SubAction,
        }
    }
}

pub type StepSpec = Step<String>;

impl Step<String> {
    /// Function step backed by an async closure receiving a context snapshot
    pub fn function<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AexResult<Value>> + Send + 'static,
    {
        Step::Function(FunctionStep {
            name: name.into(),
            handler: Arc::new(FnStep(handler)),
            timeout: None,
            output_key: None,
        })
    }

    pub fn handler(name: impl Into<String>, handler: Arc<dyn StepFunction>) -> Self {
        Step::Function(FunctionStep {
            name: name.into(),
            handler,
            timeout: None,
            output_key: None,
        })
    }

    pub fn structured(
        name: impl Into<String>,
        tier: Tier,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
        output: OutputSchema,
    ) -> Self {
        Step::Model(ModelStep {
            name: name.into(),
            tier,
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            mode: ModelStepMode::Structured(output),
            output_key: None,
        })
    }

    pub fn tool_choice(
        name: impl Into<String>,
        tier: Tier,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
        available_actions: impl IntoIterator<Item = impl Into<String>>,
        stop_action: impl Into<String>,
        max_iterations: usize,
    ) -> Self {
        Step::Model(ModelStep {
            name: name.into(),
            tier,
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            mode: ModelStepMode::ToolChoice(ToolChoice {
                available_actions: available_actions.into_iter().map(Into::into).collect(),
                stop_action: stop_action.into(),
                max_iterations,
            }),
            output_key: None,
        })
    }

    pub fn sub_action(action: impl Into<String>) -> Self {
        Step::SubAction(SubActionStep {
            action: action.into(),
            skip_if: None,
        })
    }

    /// Attach a skip predicate; only meaningful on sub-action steps
    pub fn skip_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&RunContext) -> bool + Send + Sync + 'static,
    {
        if let Step::SubAction(sub) = &mut self {
            sub.skip_if = Some(Arc::new(predicate));
        }
        self
    }

    /// Key for non-object results; ignored by sub-action steps
    pub fn output_key(mut self, key: impl Into<String>) -> Self {
        match &mut self {
            Step::Function(step) => step.output_key = Some(key.into()),
            Step::Model(step) => step.output_key = Some(key.into()),
            Step::SubAction(_) => {}
        }
        self
    }

    /// Per-step timeout; only meaningful on function steps
    pub fn timeout(mut self, timeout: Duration) -> Self {
        if let Step::Function(step) = &mut self {
            step.timeout = Some(timeout);
        }
        self
    }
}

/// Named unit of work: an input shape and ordered steps
#[derive(Debug, Clone)]
pub struct Action<R = ActionId> {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
    pub steps: Vec<Step<R>>,
    /// Run after a top-level result is returned; failures are only logged
    pub post_steps: Vec<Step<R>>,
}

pub type ActionSpec = Action<String>;

impl Action<String> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            input_schema: InputSchema::default(),
            steps: Vec::new(),
            post_steps: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn input(mut self, schema: InputSchema) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn post_step(mut self, step: StepSpec) -> Self {
        self.post_steps.push(step);
        self
    }
}
