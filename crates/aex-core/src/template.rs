//! Prompt template rendering against the run context plus ambient state.
//!
//! Templates use minijinja syntax: `{{ name }}` interpolation, `{% if flag %}`
//! sections keyed by truthiness and `{% for item in items %}` iteration.
//! Unknown variables (including lookups through them) render as empty.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use minijinja::{Environment, UndefinedBehavior};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::RunContext;
use crate::error::{AexError, AexResult};

/// Template variable holding the ambient timestamp (RFC 3339)
pub const NOW_VAR: &str = "now";
/// Template variable holding ambient state summaries
pub const AMBIENT_VAR: &str = "ambient";

/// Environment facts fetched right before a prompt is rendered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmbientContext {
    pub now: DateTime<Utc>,
    #[serde(default)]
    pub summaries: Map<String, Value>,
}

impl AmbientContext {
    pub fn now() -> Self {
        Self {
            now: Utc::now(),
            summaries: Map::new(),
        }
    }

    pub fn with_summary(mut self, key: impl Into<String>, value: Value) -> Self {
        self.summaries.insert(key.into(), value);
        self
    }
}

/// Source of ambient context; called on every render unless the engine is
/// configured to refresh once per run
#[async_trait]
pub trait AmbientProvider: Send + Sync {
    async fn fetch(&self) -> AexResult<AmbientContext>;
}

/// Provider that only reports the current time
#[derive(Debug, Clone, Copy, Default)]
pub struct ClockProvider;

#[async_trait]
impl AmbientProvider for ClockProvider {
    async fn fetch(&self) -> AexResult<AmbientContext> {
        Ok(AmbientContext::now())
    }
}

pub struct TemplateResolver {
    env: Environment<'static>,
}

impl Default for TemplateResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TemplateResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateResolver").finish_non_exhaustive()
    }
}

impl TemplateResolver {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        Self { env }
    }

    /// Render `template` with the context values in scope. Ambient values are
    /// exposed as `now` and `ambient` and take precedence over context keys of
    /// the same name.
    pub fn render(
        &self,
        template: &str,
        context: &RunContext,
        ambient: Option<&AmbientContext>,
    ) -> AexResult<String> {
        let mut scope = context.values().clone();
        if let Some(ambient) = ambient {
            scope.insert(NOW_VAR.to_string(), Value::String(ambient.now.to_rfc3339()));
            scope.insert(
                AMBIENT_VAR.to_string(),
                Value::Object(ambient.summaries.clone()),
            );
        }

        self.env
            .render_str(template, Value::Object(scope))
            .map_err(|e| AexError::template(e.to_string()))
    }
}
