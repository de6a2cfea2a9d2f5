//! Declarative schemas for job outputs.
//!
//! A job may declare an [`OutputSchema`]; the scheduler validates the
//! response output against it before persisting. Schemas describe a
//! mapping output: which keys must be present and what JSON shape each
//! carries. A field whose value is still an unresolved reference is
//! accepted as-is, since its shape is only known once the referenced job
//! has run.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::reference::OutputReference;

/// The JSON shape a schema field accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Null,
    Bool,
    Number,
    String,
    Sequence,
    Mapping,
    /// Any shape, including null.
    Any,
}

impl ValueKind {
    fn admits(self, value: &Value) -> bool {
        match self {
            ValueKind::Null => value.is_null(),
            ValueKind::Bool => value.is_boolean(),
            ValueKind::Number => value.is_number(),
            ValueKind::String => value.is_string(),
            ValueKind::Sequence => value.is_array(),
            ValueKind::Mapping => value.is_object(),
            ValueKind::Any => true,
        }
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Sequence => "sequence",
            ValueKind::Mapping => "mapping",
            ValueKind::Any => "any",
        };
        write!(f, "{name}")
    }
}

/// One field of an [`OutputSchema`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub key: String,
    pub kind: ValueKind,
    pub required: bool,
}

/// A declarative schema for a mapping-shaped job output.
///
/// # Examples
///
/// ```
/// use jobflow::schema::{OutputSchema, ValueKind};
/// use serde_json::json;
///
/// let schema = OutputSchema::new("task_doc")
///     .field("total", ValueKind::Number)
///     .optional_field("notes", ValueKind::String);
///
/// assert!(schema.validate(&json!({"total": 6})).is_ok());
/// assert!(schema.validate(&json!({"notes": "no total"})).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSchema {
    name: String,
    fields: Vec<FieldSpec>,
}

impl OutputSchema {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Add a required field.
    #[must_use]
    pub fn field(mut self, key: impl Into<String>, kind: ValueKind) -> Self {
        self.fields.push(FieldSpec {
            key: key.into(),
            kind,
            required: true,
        });
        self
    }

    /// Add an optional field.
    #[must_use]
    pub fn optional_field(mut self, key: impl Into<String>, kind: ValueKind) -> Self {
        self.fields.push(FieldSpec {
            key: key.into(),
            kind,
            required: false,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `key` is declared by this schema.
    #[must_use]
    pub fn has_field(&self, key: &str) -> bool {
        self.fields.iter().any(|f| f.key == key)
    }

    /// Validate an output value against this schema.
    pub fn validate(&self, output: &Value) -> Result<(), SchemaViolationError> {
        let map = output
            .as_object()
            .ok_or_else(|| SchemaViolationError::NotAMapping {
                schema: self.name.clone(),
            })?;
        for field in &self.fields {
            match map.get(&field.key) {
                Some(value) => {
                    // Unresolved references cannot be shape-checked yet.
                    if OutputReference::is_reference(value) {
                        continue;
                    }
                    if !field.kind.admits(value) {
                        return Err(SchemaViolationError::WrongKind {
                            schema: self.name.clone(),
                            key: field.key.clone(),
                            expected: field.kind,
                        });
                    }
                }
                None if field.required => {
                    return Err(SchemaViolationError::MissingKey {
                        schema: self.name.clone(),
                        key: field.key.clone(),
                    })
                }
                None => {}
            }
        }
        Ok(())
    }
}

/// A job's return value did not satisfy its declared schema.
#[derive(Debug, Error, Diagnostic)]
pub enum SchemaViolationError {
    #[error("schema '{schema}' expects a mapping output")]
    #[diagnostic(code(jobflow::schema::not_a_mapping))]
    NotAMapping { schema: String },

    #[error("schema '{schema}' requires key '{key}'")]
    #[diagnostic(
        code(jobflow::schema::missing_key),
        help("Return a mapping containing every required schema key.")
    )]
    MissingKey { schema: String, key: String },

    #[error("schema '{schema}' expects key '{key}' to be a {expected}")]
    #[diagnostic(code(jobflow::schema::wrong_kind))]
    WrongKind {
        schema: String,
        key: String,
        expected: ValueKind,
    },

    #[error("schema '{schema}' was declared but the job produced no output")]
    #[diagnostic(code(jobflow::schema::no_output))]
    NoOutput { schema: String },
}
