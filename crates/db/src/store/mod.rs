//! The storage contract every id-map backend implements.
//!
//! Backends receive keys that [`crate::IdMap`] has already validated against
//! the migration's schemas. Every method that mutates more than one row
//! must apply as a single atomic unit with respect to other readers.

use async_trait::async_trait;
use idmap_core::config::MapNamespace;
use idmap_core::key::{DestinationKey, SourceKey};
use idmap_core::record::{MapRow, MapRowWrite, MessageRecord};
use idmap_core::status::{MapStatus, MessageLevel};
use idmap_core::types::SequenceNo;
use serde::Serialize;

use crate::error::IdMapResult;

pub mod kv;
pub mod memory;
pub mod postgres;

// ---------------------------------------------------------------------------
// Shared value types
// ---------------------------------------------------------------------------

/// Filter for reading messages. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    pub source: Option<SourceKey>,
    pub level: Option<MessageLevel>,
}

impl MessageFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_source(source: SourceKey) -> Self {
        Self {
            source: Some(source),
            level: None,
        }
    }

    pub fn with_level(mut self, level: MessageLevel) -> Self {
        self.level = Some(level);
        self
    }

    pub fn matches(&self, record: &MessageRecord) -> bool {
        self.source.as_ref().is_none_or(|s| *s == record.source)
            && self.level.is_none_or(|l| l == record.level)
    }
}

/// Row and message counts taken from one consistent read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub processed: u64,
    pub imported: u64,
    pub needs_update: u64,
    pub ignored: u64,
    pub failed: u64,
    pub messages: u64,
}

impl StatusCounts {
    /// Tally one row of the given status.
    pub fn add(&mut self, status: MapStatus) {
        self.processed += 1;
        match status {
            MapStatus::Imported => self.imported += 1,
            MapStatus::NeedsUpdate => self.needs_update += 1,
            MapStatus::Ignored => self.ignored += 1,
            MapStatus::Failed => self.failed += 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Backend contract
// ---------------------------------------------------------------------------

/// Persistence for one migration's map rows and messages.
#[async_trait]
pub trait IdMapStore: Send + Sync {
    /// The migration namespace this store is scoped to.
    fn namespace(&self) -> &MapNamespace;

    /// Counter bumped by every [`IdMapStore::destroy`]. Cursors compare it to
    /// detect that their snapshot is gone.
    fn generation(&self) -> u64;

    /// Idempotently create whatever storage the backend needs.
    async fn ensure_storage(&self) -> IdMapResult<()>;

    /// Insert or overwrite the row for `row.source`.
    async fn upsert(&self, row: MapRowWrite) -> IdMapResult<MapRow>;

    async fn row_by_source(&self, source: &SourceKey) -> IdMapResult<Option<MapRow>>;

    /// All rows mapped to `destination`, in ascending source key order.
    async fn rows_by_destination(&self, destination: &DestinationKey) -> IdMapResult<Vec<MapRow>>;

    /// Up to `limit` rows with `status`, in ascending source key order.
    async fn rows_with_status(&self, status: MapStatus, limit: usize) -> IdMapResult<Vec<MapRow>>;

    /// Every mapped source key, ascending.
    async fn source_keys(&self) -> IdMapResult<Vec<SourceKey>>;

    /// Move Imported/Failed rows to NeedsUpdate: the single row for `source`
    /// when given, otherwise every row. Returns the number of rows changed.
    async fn mark_needs_update(&self, source: Option<&SourceKey>) -> IdMapResult<u64>;

    async fn counts(&self) -> IdMapResult<StatusCounts>;

    async fn append_message(
        &self,
        source: &SourceKey,
        level: MessageLevel,
        message: &str,
    ) -> IdMapResult<MessageRecord>;

    /// Up to `limit` matching messages with a sequence greater than `after`,
    /// in sequence order.
    async fn read_messages(
        &self,
        filter: &MessageFilter,
        after: Option<SequenceNo>,
        limit: usize,
    ) -> IdMapResult<Vec<MessageRecord>>;

    /// Remove every message. Returns the number removed.
    async fn clear_messages(&self) -> IdMapResult<u64>;

    /// Remove the messages of every key in `sources` and, unless
    /// `messages_only`, their map rows, as one atomic batch. Returns the
    /// number of map rows removed.
    async fn delete(&self, sources: &[SourceKey], messages_only: bool) -> IdMapResult<u64>;

    /// Remove every row mapped to `destination` together with the messages
    /// of those rows' source keys. Returns the number of map rows removed.
    async fn delete_destination(&self, destination: &DestinationKey) -> IdMapResult<u64>;

    /// Drop all rows and messages. Must bump [`IdMapStore::generation`].
    async fn destroy(&self) -> IdMapResult<()>;
}

/// Optional capability of backends that persist into named relations.
pub trait RelationalStore {
    /// Fully qualified, quoted name of the map relation.
    fn qualified_map_table_name(&self) -> String;

    /// Fully qualified, quoted name of the message relation.
    fn qualified_message_table_name(&self) -> String;
}
