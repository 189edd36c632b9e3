//! Model-facing types and the external model-invocation contract.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversation::{Message, ToolCall};
use crate::error::{Capability, ModelCallError};
use crate::schema::OutputSchema;

/// Requested quality/cost level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Low,
    Medium,
    High,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Tier::Low => "low",
            Tier::Medium => "medium",
            Tier::High => "high",
        };
        f.write_str(label)
    }
}

/// Known facts about what a candidate accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityFlags {
    #[serde(default = "default_true")]
    pub tool_calling: bool,
    #[serde(default = "default_true")]
    pub forced_tool_choice: bool,
    #[serde(default = "default_true")]
    pub structured_output: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CapabilityFlags {
    fn default() -> Self {
        Self {
            tool_calling: true,
            forced_tool_choice: true,
            structured_output: true,
        }
    }
}

impl CapabilityFlags {
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::ToolCalling => self.tool_calling,
            Capability::ForcedToolChoice => self.tool_calling && self.forced_tool_choice,
            Capability::StructuredOutput => self.structured_output,
        }
    }

    pub fn without(mut self, capability: Capability) -> Self {
        match capability {
            Capability::ToolCalling => {
                self.tool_calling = false;
                self.forced_tool_choice = false;
            }
            Capability::ForcedToolChoice => self.forced_tool_choice = false,
            Capability::StructuredOutput => self.structured_output = false,
        }
        self
    }
}

/// One concrete endpoint/model/routing combination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCandidate {
    pub endpoint: String,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_provider: Option<String>,
    #[serde(default)]
    pub capabilities: CapabilityFlags,
}

impl ModelCandidate {
    pub fn new(endpoint: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            model_id: model_id.into(),
            routing_provider: None,
            capabilities: CapabilityFlags::default(),
        }
    }

    pub fn with_routing_provider(mut self, provider: impl Into<String>) -> Self {
        self.routing_provider = Some(provider.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: CapabilityFlags) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Stable key used for statistics bookkeeping
    pub fn key(&self) -> String {
        match &self.routing_provider {
            Some(provider) => format!("{}|{}|{}", self.endpoint, self.model_id, provider),
            None => format!("{}|{}", self.endpoint, self.model_id),
        }
    }
}

impl fmt::Display for ModelCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.routing_provider {
            Some(provider) => write!(f, "{}@{} via {}", self.model_id, self.endpoint, provider),
            None => write!(f, "{}@{}", self.model_id, self.endpoint),
        }
    }
}

/// An action offered to a model as a selectable tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Shape the model is asked to answer in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestedOutput {
    Structured(OutputSchema),
    ToolChoice {
        tools: Vec<ToolDefinition>,
        /// The model must call exactly one tool instead of answering in text
        require_tool_call: bool,
    },
}

impl RequestedOutput {
    /// Capabilities a candidate needs to serve this request
    pub fn required_capabilities(&self) -> Vec<Capability> {
        match self {
            RequestedOutput::Structured(_) => vec![Capability::StructuredOutput],
            RequestedOutput::ToolChoice {
                require_tool_call: true,
                ..
            } => vec![Capability::ToolCalling, Capability::ForcedToolChoice],
            RequestedOutput::ToolChoice { .. } => vec![Capability::ToolCalling],
        }
    }

    pub fn requires_tools(&self) -> bool {
        matches!(self, RequestedOutput::ToolChoice { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub messages: Vec<Message>,
    pub output: RequestedOutput,
}

/// What a model answered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelResponse {
    Structured { value: Value },
    ToolSelection { call: ToolCall },
    Text { content: String },
}

/// External model-invocation function: transport and provider specifics live
/// behind this trait.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn call(
        &self,
        request: &ModelRequest,
        candidate: &ModelCandidate,
    ) -> Result<ModelResponse, ModelCallError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_key_includes_routing() {
        let plain = ModelCandidate::new("https://api.one", "m-small");
        let routed = plain.clone().with_routing_provider("fast-lane");

        assert_eq!(plain.key(), "https://api.one|m-small");
        assert_eq!(routed.key(), "https://api.one|m-small|fast-lane");
        assert_ne!(plain.key(), routed.key());
    }

    #[test]
    fn test_forced_tool_choice_requires_tool_calling() {
        let flags = CapabilityFlags::default().without(Capability::ToolCalling);
        assert!(!flags.supports(Capability::ForcedToolChoice));
        assert!(flags.supports(Capability::StructuredOutput));
    }

    #[test]
    fn test_required_capabilities() {
        let forced = RequestedOutput::ToolChoice {
            tools: vec![],
            require_tool_call: true,
        };
        assert_eq!(
            forced.required_capabilities(),
            vec![Capability::ToolCalling, Capability::ForcedToolChoice]
        );
        assert!(forced.requires_tools());
    }

    #[test]
    fn test_candidate_yaml_defaults_capabilities() {
        let candidate: ModelCandidate = serde_yaml::from_str(
            r#"
endpoint: https://api.one
model_id: m-large
capabilities:
  forced_tool_choice: false
"#,
        )
        .unwrap();

        assert!(candidate.capabilities.tool_calling);
        assert!(!candidate.capabilities.forced_tool_choice);
        assert!(candidate.routing_provider.is_none());
    }
}
