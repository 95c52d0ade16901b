//! Per-migration id-map configuration.
//!
//! The namespace that scopes one migration's storage is an explicit value
//! handed to the store at construction; there is no global registry.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::schema::KeySchema;
use crate::status::MessageLevel;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Longest accepted namespace. Leaves room for the `migrate_message_`
/// prefix inside PostgreSQL's 63-byte identifier limit.
pub const MAX_NAMESPACE_LEN: usize = 48;

/// Default number of message records fetched per page by a message stream.
pub const DEFAULT_MESSAGE_PAGE_SIZE: usize = 500;

// ---------------------------------------------------------------------------
// Namespace
// ---------------------------------------------------------------------------

/// Validated storage namespace for one migration (`[a-z][a-z0-9_]*`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MapNamespace(String);

impl MapNamespace {
    pub fn new(name: impl Into<String>) -> Result<Self, CoreError> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_NAMESPACE_LEN {
            return Err(CoreError::Validation(format!(
                "Namespace must be 1-{MAX_NAMESPACE_LEN} characters, got {}",
                name.len()
            )));
        }
        let mut chars = name.chars();
        let starts_with_letter = chars.next().is_some_and(|c| c.is_ascii_lowercase());
        let rest_valid = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !starts_with_letter || !rest_valid {
            return Err(CoreError::Validation(format!(
                "Invalid namespace '{name}'. Use lowercase letters, digits and '_', starting with a letter"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MapNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for MapNamespace {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MapNamespace> for String {
    fn from(value: MapNamespace) -> Self {
        value.0
    }
}

// ---------------------------------------------------------------------------
// IdMapConfig
// ---------------------------------------------------------------------------

/// Everything an id map needs to know about the migration that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapConfig {
    pub namespace: MapNamespace,
    pub source_schema: KeySchema,
    pub destination_schema: KeySchema,
    /// Severity used by `record` when the caller does not pass one.
    pub default_message_level: MessageLevel,
    /// Rows fetched per round trip when streaming messages.
    pub message_page_size: usize,
}

impl IdMapConfig {
    pub fn builder(
        namespace: MapNamespace,
        source_schema: KeySchema,
        destination_schema: KeySchema,
    ) -> IdMapConfigBuilder {
        IdMapConfigBuilder {
            config: IdMapConfig {
                namespace,
                source_schema,
                destination_schema,
                default_message_level: MessageLevel::default(),
                message_page_size: DEFAULT_MESSAGE_PAGE_SIZE,
            },
        }
    }
}

/// Builder for [`IdMapConfig`].
#[derive(Debug)]
pub struct IdMapConfigBuilder {
    config: IdMapConfig,
}

impl IdMapConfigBuilder {
    pub fn default_message_level(mut self, level: MessageLevel) -> Self {
        self.config.default_message_level = level;
        self
    }

    pub fn message_page_size(mut self, size: usize) -> Self {
        self.config.message_page_size = size;
        self
    }

    pub fn build(self) -> Result<IdMapConfig, CoreError> {
        if self.config.message_page_size == 0 {
            return Err(CoreError::Validation(
                "message_page_size must be at least 1".into(),
            ));
        }
        Ok(self.config)
    }
}
