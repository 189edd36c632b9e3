//! Run context - the key/value accumulator threaded through one run.
//!
//! Every step result is merged in, later keys overwriting earlier ones, so a
//! step can depend on an earlier step's output by name. A sub-action receives
//! a projected snapshot, never a live view.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::conversation::Message;
use crate::error::{AexError, AexResult};
use crate::schema::{value_type_name, FieldViolation, InputSchema};

/// Key under which non-object step results are merged when no output key is set
pub const DEFAULT_OUTPUT_KEY: &str = "result";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    values: Map<String, Value>,
    /// Conversation used by model-facing steps; carried into every projection
    #[serde(default)]
    conversation: Vec<Message>,
}

impl RunContext {
    pub fn new(params: Map<String, Value>) -> Self {
        Self {
            values: params,
            conversation: Vec::new(),
        }
    }

    /// Build from an arbitrary JSON value; non-objects yield an empty context
    pub fn from_value(params: Value) -> Self {
        match params {
            Value::Object(map) => Self::new(map),
            _ => Self::default(),
        }
    }

    /// Build from the parameters of a top-level run, which must be an object
    pub fn from_params(action: &str, params: Value) -> AexResult<Self> {
        match params {
            Value::Object(map) => Ok(Self::new(map)),
            other => Err(AexError::Validation {
                action: action.to_string(),
                violations: vec![FieldViolation::new(
                    "params",
                    format!("expected object, got {}", value_type_name(&other)),
                )],
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn into_values(self) -> Map<String, Value> {
        self.values
    }

    /// Overwrite matching keys and add new ones
    pub fn merge(&mut self, partial: Map<String, Value>) {
        for (key, value) in partial {
            self.values.insert(key, value);
        }
    }

    /// Merge a raw step result: objects key by key, `null` not at all,
    /// anything else under `output_key`
    pub fn merge_output(&mut self, output: Value, output_key: Option<&str>) {
        match output {
            Value::Object(map) => self.merge(map),
            Value::Null => {}
            other => {
                let key = output_key.unwrap_or(DEFAULT_OUTPUT_KEY);
                self.values.insert(key.to_string(), other);
            }
        }
    }

    /// Snapshot restricted to the fields `schema` declares, plus the conversation
    pub fn project(&self, schema: &InputSchema) -> RunContext {
        let values = schema
            .field_names()
            .filter_map(|name| {
                self.values
                    .get(name)
                    .map(|value| (name.to_string(), value.clone()))
            })
            .collect();

        RunContext {
            values,
            conversation: self.conversation.clone(),
        }
    }

    pub fn conversation(&self) -> &[Message] {
        &self.conversation
    }

    pub fn push_message(&mut self, message: Message) {
        self.conversation.push(message);
    }

    pub fn extend_conversation(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.conversation.extend(messages);
    }

    pub fn replace_conversation(&mut self, conversation: Vec<Message>) {
        self.conversation = conversation;
    }

    /// Whether a key holds a truthy value (used by templates and predicates)
    pub fn is_truthy(&self, key: &str) -> bool {
        self.values.get(key).is_some_and(is_truthy)
    }
}

/// JSON truthiness: null, false, 0, "" and empty collections are falsy
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_merge_later_wins_and_untouched_keys_persist() {
        let mut ctx = RunContext::new(map(json!({"a": 0, "b": 2})));
        ctx.merge(map(json!({"a": 1})));

        assert_eq!(Value::Object(ctx.values().clone()), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_merge_output_variants() {
        let mut ctx = RunContext::default();
        ctx.merge_output(json!({"x": 1}), None);
        ctx.merge_output(Value::Null, None);
        ctx.merge_output(json!("text"), None);
        ctx.merge_output(json!([1, 2]), Some("items"));

        assert_eq!(
            Value::Object(ctx.into_values()),
            json!({"x": 1, "result": "text", "items": [1, 2]})
        );
    }

    #[test]
    fn test_project_keeps_declared_fields_and_conversation() {
        let mut ctx = RunContext::new(map(json!({"query": "q", "secret": "s", "limit": 3})));
        ctx.push_message(Message::user("hi"));

        let schema = InputSchema::new()
            .required("query", FieldType::String)
            .optional("limit", FieldType::Number)
            .optional("missing", FieldType::String);
        let projected = ctx.project(&schema);

        assert_eq!(
            Value::Object(projected.values().clone()),
            json!({"query": "q", "limit": 3})
        );
        assert_eq!(projected.conversation().len(), 1);
    }

    #[test]
    fn test_projection_is_a_snapshot() {
        let mut ctx = RunContext::new(map(json!({"query": "before"})));
        let schema = InputSchema::new().required("query", FieldType::String);
        let projected = ctx.project(&schema);

        ctx.set("query", json!("after"));
        assert_eq!(projected.get("query"), Some(&json!("before")));
    }

    #[test]
    fn test_from_params_requires_object() {
        let ctx = RunContext::from_params("greet", json!({"name": "Ada"})).unwrap();
        assert_eq!(ctx.get("name"), Some(&json!("Ada")));

        let err = RunContext::from_params("greet", json!("x")).unwrap_err();
        assert_eq!(
            err.violations(),
            &[FieldViolation::new("params", "expected object, got string")]
        );
        assert!(RunContext::from_params("greet", Value::Null).is_err());
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!("x")));
        assert!(is_truthy(&json!({"k": 1})));
    }
}
