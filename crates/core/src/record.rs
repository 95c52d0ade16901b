//! Records persisted by the id map, and the row abstraction callers supply.

use serde::{Deserialize, Serialize};

use crate::hashing::json_hash;
use crate::key::{DestinationKey, SourceKey};
use crate::status::{MapStatus, MessageLevel, RollbackAction};
use crate::types::{SequenceNo, Timestamp};

// ---------------------------------------------------------------------------
// Map rows
// ---------------------------------------------------------------------------

/// One source record's mapping. At most one exists per [`SourceKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapRow {
    pub source: SourceKey,
    /// `None` for rows that never produced a destination record
    /// (typically `Failed` or `Ignored`).
    pub destination: Option<DestinationKey>,
    pub status: MapStatus,
    pub rollback_action: RollbackAction,
    /// Content hash of the source row at the last save, if the row had one.
    pub hash: Option<String>,
    pub last_imported: Timestamp,
}

/// Values written by an upsert. Backends stamp `last_imported` themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapRowWrite {
    pub source: SourceKey,
    pub destination: Option<DestinationKey>,
    pub status: MapStatus,
    pub rollback_action: RollbackAction,
    pub hash: Option<String>,
}

impl MapRowWrite {
    pub fn into_row(self, last_imported: Timestamp) -> MapRow {
        MapRow {
            source: self.source,
            destination: self.destination,
            status: self.status,
            rollback_action: self.rollback_action,
            hash: self.hash,
            last_imported,
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// An immutable diagnostic attached to a source key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub sequence: SequenceNo,
    pub source: SourceKey,
    pub level: MessageLevel,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Source rows
// ---------------------------------------------------------------------------

/// The row currently being processed by a migration.
pub trait SourceRow {
    /// Identifier values of the source record.
    fn source_id_values(&self) -> SourceKey;

    /// Content hash used for change detection. `None` disables it.
    fn hash(&self) -> Option<String> {
        None
    }
}

/// A source row carried as JSON, hashed over its canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub ids: SourceKey,
    pub data: serde_json::Value,
}

impl SourceRecord {
    pub fn new(ids: SourceKey, data: serde_json::Value) -> Self {
        Self { ids, data }
    }
}

impl SourceRow for SourceRecord {
    fn source_id_values(&self) -> SourceKey {
        self.ids.clone()
    }

    fn hash(&self) -> Option<String> {
        Some(json_hash(&self.data))
    }
}
