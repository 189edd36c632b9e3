use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Primitive type a field must carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Array,
    Object,
    /// Any JSON value is accepted
    Any,
}

impl FieldType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
            FieldType::Any => true,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
            FieldType::Any => "any",
        }
    }

    fn json_schema(&self) -> Value {
        match self {
            FieldType::Any => serde_json::json!({}),
            other => serde_json::json!({ "type": other.as_str() }),
        }
    }
}

pub(crate) fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Declaration of one input field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub field_type: FieldType,

    #[serde(default)]
    pub required: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Input shape of an action: field name to declaration
///
/// # Examples
///
/// ```rust
/// use aex_core::schema::{FieldType, InputSchema};
/// use serde_json::json;
///
/// let schema = InputSchema::new()
///     .required("query", FieldType::String)
///     .optional("limit", FieldType::Number);
///
/// let report = schema.validate(json!({"query": "pods"}).as_object().unwrap());
/// assert!(report.valid);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
}

impl InputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(
            name.into(),
            FieldSpec {
                field_type,
                required: true,
                description: None,
            },
        );
        self
    }

    pub fn optional(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(
            name.into(),
            FieldSpec {
                field_type,
                required: false,
                description: None,
            },
        );
        self
    }

    /// Attach a description to an already declared field
    pub fn describe(mut self, name: &str, description: impl Into<String>) -> Self {
        if let Some(spec) = self.fields.get_mut(name) {
            spec.description = Some(description.into());
        }
        self
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Check a parameter bag against this schema. Never fails; the caller
    /// decides whether violations are fatal.
    pub fn validate(&self, params: &Map<String, Value>) -> ValidationReport {
        let mut errors = Vec::new();

        for (name, spec) in &self.fields {
            match params.get(name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        errors.push(FieldViolation::new(name, "is required"));
                    }
                }
                Some(value) => {
                    if !spec.field_type.matches(value) {
                        errors.push(FieldViolation::new(
                            name,
                            format!(
                                "expected {}, got {}",
                                spec.field_type.as_str(),
                                value_type_name(value)
                            ),
                        ));
                    }
                }
            }
        }

        ValidationReport {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// JSON Schema rendering used when offering an action to a model as a tool
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();

        for (name, spec) in &self.fields {
            let mut property = spec.field_type.json_schema();
            if let (Some(desc), Value::Object(obj)) = (&spec.description, &mut property) {
                obj.insert("description".to_string(), Value::String(desc.clone()));
            }
            properties.insert(name.clone(), property);
            if spec.required {
                required.push(Value::String(name.clone()));
            }
        }

        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// Result of [`InputSchema::validate`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<FieldViolation>,
}

/// One field that failed validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' {}", self.field, self.message)
    }
}

/// Output shape requested from a model as structured data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSchema {
    /// JSON Schema definition
    pub schema: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl OutputSchema {
    pub fn from_json_schema(schema: Value) -> Self {
        Self {
            schema,
            description: None,
        }
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Instructions appended to the system prompt for structured output
    pub fn to_system_instructions(&self) -> String {
        let mut instructions =
            String::from("Respond with JSON matching this schema and nothing else:\n\n");

        if let Some(desc) = &self.description {
            instructions.push_str(&format!("Description: {}\n\n", desc));
        }

        instructions.push_str(
            &serde_json::to_string_pretty(&self.schema).unwrap_or_else(|_| self.schema.to_string()),
        );
        instructions
    }
}
