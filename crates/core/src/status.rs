//! Status helper enums mapping to SMALLINT columns.
//!
//! Each enum variant's discriminant is the value persisted by every
//! backend, so the numbers are part of the storage format.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Status code type matching SMALLINT in the database.
pub type StatusId = i16;

macro_rules! define_status_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $val:literal => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(i16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $val ),+
        }

        impl $name {
            /// Return the persisted status code.
            pub fn id(self) -> StatusId {
                self as StatusId
            }

            /// Decode a persisted status code.
            pub fn from_id(id: StatusId) -> Result<Self, CoreError> {
                match id {
                    $( $val => Ok(Self::$variant), )+
                    other => Err(CoreError::Internal(format!(
                        concat!("Unknown ", stringify!($name), " code {}"),
                        other
                    ))),
                }
            }

            /// Lowercase name used in logs and the audit output.
            pub fn name(self) -> &'static str {
                match self {
                    $( Self::$variant => $label, )+
                }
            }

            /// Parse from [`Self::name`].
            pub fn from_name(name: &str) -> Result<Self, CoreError> {
                match name {
                    $( $label => Ok(Self::$variant), )+
                    other => Err(CoreError::Validation(format!(
                        concat!("Unknown ", stringify!($name), " '{}'"),
                        other
                    ))),
                }
            }
        }

        impl From<$name> for StatusId {
            fn from(value: $name) -> Self {
                value as StatusId
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

define_status_enum! {
    /// Lifecycle state of a map row.
    MapStatus {
        Imported = 0 => "imported",
        NeedsUpdate = 1 => "needs_update",
        Ignored = 2 => "ignored",
        Failed = 3 => "failed",
    }
}

define_status_enum! {
    /// What happens to the destination record when the mapping is rolled back.
    RollbackAction {
        Delete = 0 => "delete",
        Preserve = 1 => "preserve",
    }
}

define_status_enum! {
    /// Severity of a message log entry.
    MessageLevel {
        Error = 1 => "error",
        Warning = 2 => "warning",
        Notice = 3 => "notice",
        Informational = 4 => "informational",
    }
}

impl MapStatus {
    /// Whether a blanket or targeted update request moves this row to
    /// [`MapStatus::NeedsUpdate`]. Ignored rows are a deliberate override
    /// and stay put.
    pub fn accepts_update(self) -> bool {
        matches!(self, Self::Imported | Self::Failed)
    }
}

impl Default for MapStatus {
    fn default() -> Self {
        Self::Imported
    }
}

impl Default for RollbackAction {
    fn default() -> Self {
        Self::Delete
    }
}

impl Default for MessageLevel {
    fn default() -> Self {
        Self::Error
    }
}
