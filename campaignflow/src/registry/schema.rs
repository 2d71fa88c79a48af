//! Input schemas for stage submissions.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::errors::{InputValidationError, RegistryValidationError};

/// The JSON type a field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// A JSON string.
    Text,
    /// A JSON number.
    Number,
    /// A JSON boolean.
    Boolean,
    /// A JSON array.
    List,
    /// A JSON object.
    Object,
    /// Any JSON value.
    Any,
}

impl FieldKind {
    fn matches(self, value: &serde_json::Value) -> bool {
        match self {
            Self::Text => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::List => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::Text => "a string",
            Self::Number => "a number",
            Self::Boolean => "a boolean",
            Self::List => "a list",
            Self::Object => "an object",
            Self::Any => "any value",
        }
    }
}

/// A constraint on one field of a stage submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    /// The field name.
    pub name: String,
    /// The expected type.
    pub kind: FieldKind,
    /// Whether the field must be present and non-empty.
    #[serde(default)]
    pub required: bool,
    /// Regex a text field must match.
    #[serde(default)]
    pub pattern: Option<String>,
}

impl FieldSpec {
    /// Creates an optional field of the given kind.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            pattern: None,
        }
    }

    /// Creates an optional text field.
    #[must_use]
    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Text)
    }

    /// Creates an optional number field.
    #[must_use]
    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Number)
    }

    /// Creates an optional list field.
    #[must_use]
    pub fn list(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::List)
    }

    /// Marks the field as required.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Sets a regex the field must match. Checked when the registry is built.
    #[must_use]
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }
}

/// The constraints a stage's submitted input must satisfy.
///
/// Input must be a JSON object. Fields not named in the schema are allowed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputSchema {
    /// Field constraints.
    pub fields: Vec<FieldSpec>,
    #[serde(skip)]
    compiled: HashMap<String, Regex>,
}

impl InputSchema {
    /// Creates an empty schema that accepts any object.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field constraint.
    #[must_use]
    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    /// Compiles every field pattern.
    pub(crate) fn compile(&mut self, stage_id: &str) -> Result<(), RegistryValidationError> {
        for spec in &self.fields {
            if let Some(ref pattern) = spec.pattern {
                let regex = Regex::new(pattern).map_err(|e| {
                    RegistryValidationError::new(format!(
                        "Stage '{stage_id}' field '{}' has an invalid pattern: {e}",
                        spec.name
                    ))
                    .with_stages(vec![stage_id.to_string()])
                })?;
                self.compiled.insert(spec.name.clone(), regex);
            }
        }
        Ok(())
    }

    /// Validates a submission, collecting every violation.
    pub fn validate(
        &self,
        stage_id: &str,
        input: &serde_json::Value,
    ) -> Result<(), InputValidationError> {
        let Some(object) = input.as_object() else {
            return Err(InputValidationError::new(
                stage_id,
                vec!["input must be a JSON object".to_string()],
            ));
        };

        let mut violations = Vec::new();
        for spec in &self.fields {
            let value = match object.get(&spec.name) {
                Some(serde_json::Value::Null) | None => {
                    if spec.required {
                        violations.push(format!("missing required field '{}'", spec.name));
                    }
                    continue;
                }
                Some(value) => value,
            };

            if !spec.kind.matches(value) {
                violations.push(format!(
                    "field '{}' must be {}",
                    spec.name,
                    spec.kind.describe()
                ));
                continue;
            }

            if spec.required && is_blank(value) {
                violations.push(format!("field '{}' must not be empty", spec.name));
                continue;
            }

            if let (Some(pattern), Some(text)) = (spec.pattern.as_deref(), value.as_str()) {
                let matched = match self.compiled.get(&spec.name) {
                    Some(regex) => regex.is_match(text),
                    None => Regex::new(pattern).is_ok_and(|regex| regex.is_match(text)),
                };
                if !matched {
                    violations.push(format!(
                        "field '{}' does not match pattern '{pattern}'",
                        spec.name
                    ));
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(InputValidationError::new(stage_id, violations))
        }
    }
}

fn is_blank(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::String(s) => s.trim().is_empty(),
        serde_json::Value::Array(items) => items.is_empty(),
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}
