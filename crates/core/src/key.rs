//! Key Codec: ordered identifier tuples for source and destination records.
//!
//! A [`SourceKey`] or [`DestinationKey`] is an ordered tuple of typed
//! scalars. Both derive `Ord` lexicographically by component, and
//! [`SourceKey::encode`] produces bytes whose order matches that `Ord`, so
//! every backend can return rows in the same "ascending source key" order.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hashing::sha256_hex;

// ---------------------------------------------------------------------------
// Scalar values
// ---------------------------------------------------------------------------

/// One component of a key tuple.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum KeyValue {
    Integer(i64),
    Text(String),
    Uuid(Uuid),
}

const TAG_INTEGER: u8 = 0x10;
const TAG_TEXT: u8 = 0x14;
const TAG_UUID: u8 = 0x19;

// A 0x00 inside an encoded string is always followed by 0xFF (escaped null)
// or 0x01 (end of string), so no encoded string is a prefix of another.
const TEXT_NULL_ESCAPE: [u8; 2] = [0x00, 0xFF];
const TEXT_TERMINATOR: [u8; 2] = [0x00, 0x01];

impl KeyValue {
    /// Append the order-preserving encoding of this value to `out`.
    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Integer(i) => {
                out.push(TAG_INTEGER);
                let shifted = (*i as u64) ^ 0x8000_0000_0000_0000;
                out.extend_from_slice(&shifted.to_be_bytes());
            }
            Self::Text(s) => {
                out.push(TAG_TEXT);
                for byte in s.as_bytes() {
                    if *byte == 0 {
                        out.extend_from_slice(&TEXT_NULL_ESCAPE);
                    } else {
                        out.push(*byte);
                    }
                }
                out.extend_from_slice(&TEXT_TERMINATOR);
            }
            Self::Uuid(id) => {
                out.push(TAG_UUID);
                out.extend_from_slice(id.as_bytes());
            }
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{i}"),
            Self::Text(s) => write!(f, "'{s}'"),
            Self::Uuid(id) => write!(f, "{id}"),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for KeyValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Uuid> for KeyValue {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

// ---------------------------------------------------------------------------
// Key tuples
// ---------------------------------------------------------------------------

macro_rules! define_key {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Vec<KeyValue>);

        impl $name {
            pub fn new(values: Vec<KeyValue>) -> Self {
                Self(values)
            }

            pub fn values(&self) -> &[KeyValue] {
                &self.0
            }

            pub fn len(&self) -> usize {
                self.0.len()
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }

            /// Order-preserving, self-delimiting binary encoding.
            pub fn encode(&self) -> Vec<u8> {
                let mut out = Vec::with_capacity(self.0.len() * 9);
                for value in &self.0 {
                    value.encode_into(&mut out);
                }
                out
            }

            /// SHA-256 hex digest of [`Self::encode`].
            pub fn ids_hash(&self) -> String {
                sha256_hex(&self.encode())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("(")?;
                for (i, value) in self.0.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str(")")
            }
        }

        impl From<Vec<KeyValue>> for $name {
            fn from(values: Vec<KeyValue>) -> Self {
                Self(values)
            }
        }

        impl<const N: usize> From<[KeyValue; N]> for $name {
            fn from(values: [KeyValue; N]) -> Self {
                Self(values.into())
            }
        }

        impl FromIterator<KeyValue> for $name {
            fn from_iter<I: IntoIterator<Item = KeyValue>>(iter: I) -> Self {
                Self(iter.into_iter().collect())
            }
        }
    };
}

define_key! {
    /// Identifier tuple of a record in the source system.
    SourceKey
}

define_key! {
    /// Identifier tuple of the corresponding record in the destination system.
    DestinationKey
}
