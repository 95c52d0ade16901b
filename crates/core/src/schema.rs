//! Key schemas: the configured arity and per-position type of a key tuple.
//!
//! A key whose shape does not match its schema is a configuration defect
//! at the call site, reported as [`CoreError::Validation`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::key::KeyValue;

/// Storage type of one key component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyFieldType {
    Integer,
    Text,
    Uuid,
}

impl KeyFieldType {
    /// Parse from the compact configuration name.
    pub fn from_name(name: &str) -> Result<Self, CoreError> {
        match name {
            "integer" | "int" => Ok(Self::Integer),
            "text" | "string" => Ok(Self::Text),
            "uuid" => Ok(Self::Uuid),
            other => Err(CoreError::Validation(format!(
                "Unknown key field type '{other}'. Must be one of: integer, text, uuid"
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Text => "text",
            Self::Uuid => "uuid",
        }
    }

    pub fn matches(self, value: &KeyValue) -> bool {
        matches!(
            (self, value),
            (Self::Integer, KeyValue::Integer(_))
                | (Self::Text, KeyValue::Text(_))
                | (Self::Uuid, KeyValue::Uuid(_))
        )
    }
}

/// A named, typed position in a key tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyField {
    pub name: String,
    pub field_type: KeyFieldType,
}

/// Ordered list of key fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySchema {
    fields: Vec<KeyField>,
}

impl KeySchema {
    /// Build a schema from `(name, type)` pairs. At least one field is required.
    pub fn new<N: Into<String>>(
        fields: impl IntoIterator<Item = (N, KeyFieldType)>,
    ) -> Result<Self, CoreError> {
        let fields: Vec<KeyField> = fields
            .into_iter()
            .map(|(name, field_type)| KeyField {
                name: name.into(),
                field_type,
            })
            .collect();
        if fields.is_empty() {
            return Err(CoreError::Validation(
                "Key schema must have at least one field".into(),
            ));
        }
        for (i, field) in fields.iter().enumerate() {
            if field.name.trim().is_empty() {
                return Err(CoreError::Validation(format!(
                    "Key field at position {} has an empty name",
                    i + 1
                )));
            }
            if fields[..i].iter().any(|f| f.name == field.name) {
                return Err(CoreError::Validation(format!(
                    "Duplicate key field name '{}'",
                    field.name
                )));
            }
        }
        Ok(Self { fields })
    }

    /// Shorthand for a single-field schema.
    pub fn single(name: &str, field_type: KeyFieldType) -> Self {
        Self {
            fields: vec![KeyField {
                name: name.to_string(),
                field_type,
            }],
        }
    }

    pub fn fields(&self) -> &[KeyField] {
        &self.fields
    }

    pub fn arity(&self) -> usize {
        self.fields.len()
    }

    /// Check arity and per-position type of `values`.
    ///
    /// `role` names the key in the error message (`"source"`, `"destination"`).
    pub fn validate(&self, role: &str, values: &[KeyValue]) -> Result<(), CoreError> {
        if values.len() != self.fields.len() {
            return Err(CoreError::Validation(format!(
                "{role} key has {} value(s) but the schema defines {} field(s)",
                values.len(),
                self.fields.len()
            )));
        }
        for (field, value) in self.fields.iter().zip(values) {
            if !field.field_type.matches(value) {
                return Err(CoreError::Validation(format!(
                    "{role} key field '{}' expects {} but got {value}",
                    field.name,
                    field.field_type.name()
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for KeySchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}:{}", field.name, field.field_type.name())?;
        }
        Ok(())
    }
}

/// Parses the compact form `"name:type,name:type"`.
impl FromStr for KeySchema {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, ty) = part.split_once(':').ok_or_else(|| {
                CoreError::Validation(format!(
                    "Key field '{part}' must have the form name:type"
                ))
            })?;
            fields.push((name.trim().to_string(), KeyFieldType::from_name(ty.trim())?));
        }
        Self::new(fields)
    }
}
