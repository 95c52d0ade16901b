//! Map Store: the per-migration id map and its lookup/upsert operations.
//!
//! [`IdMap`] owns the migration's configuration and a storage backend.
//! It validates every key against the configured schemas before the
//! backend sees it, so backends only ever store well-formed keys.

use std::sync::Arc;

use idmap_core::config::IdMapConfig;
use idmap_core::error::CoreError;
use idmap_core::key::{DestinationKey, SourceKey};
use idmap_core::record::{MapRow, MapRowWrite, SourceRow};
use idmap_core::status::{MapStatus, RollbackAction};

use crate::error::IdMapResult;
use crate::messages::{MessageSink, TracingSink};
use crate::store::IdMapStore;

/// Result of resolving a destination key back to its source key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLookup {
    NotFound,
    Found(SourceKey),
    /// More than one source maps to the destination; candidates ascending.
    Ambiguous(Vec<SourceKey>),
}

impl SourceLookup {
    /// The unique source key, if exactly one exists.
    pub fn unique(self) -> Option<SourceKey> {
        match self {
            Self::Found(source) => Some(source),
            _ => None,
        }
    }
}

/// Identifier map and message ledger of one migration.
pub struct IdMap<S> {
    pub(crate) config: IdMapConfig,
    pub(crate) store: S,
    pub(crate) sink: Arc<dyn MessageSink>,
}

impl<S: IdMapStore> IdMap<S> {
    /// Bind `store` to `config`. The store must be scoped to the same namespace.
    pub fn new(config: IdMapConfig, store: S) -> IdMapResult<Self> {
        if store.namespace() != &config.namespace {
            return Err(CoreError::Validation(format!(
                "Store namespace '{}' does not match configured namespace '{}'",
                store.namespace(),
                config.namespace
            ))
            .into());
        }
        Ok(Self {
            config,
            store,
            sink: Arc::new(TracingSink),
        })
    }

    pub fn config(&self) -> &IdMapConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Replace where recorded messages are displayed.
    pub fn set_message_sink(&mut self, sink: Arc<dyn MessageSink>) {
        self.sink = sink;
    }

    pub fn with_message_sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.set_message_sink(sink);
        self
    }

    pub(crate) fn validate_source(&self, source: &SourceKey) -> IdMapResult<()> {
        self.config
            .source_schema
            .validate("source", source.values())
            .map_err(Into::into)
    }

    pub(crate) fn validate_destination(&self, destination: &DestinationKey) -> IdMapResult<()> {
        self.config
            .destination_schema
            .validate("destination", destination.values())
            .map_err(Into::into)
    }

    /// Create storage up front instead of on first use.
    pub async fn ensure_storage(&self) -> IdMapResult<()> {
        self.store.ensure_storage().await
    }

    // ── Upsert ───────────────────────────────────────────────────────

    /// Create or overwrite the mapping for `source`.
    pub async fn upsert(
        &self,
        source: &SourceKey,
        destination: Option<&DestinationKey>,
        status: MapStatus,
        rollback_action: RollbackAction,
    ) -> IdMapResult<MapRow> {
        self.write_mapping(source.clone(), destination, status, rollback_action, None)
            .await
    }

    /// Record a successful import with the default rollback action.
    pub async fn import(
        &self,
        source: &SourceKey,
        destination: &DestinationKey,
    ) -> IdMapResult<MapRow> {
        self.upsert(
            source,
            Some(destination),
            MapStatus::Imported,
            RollbackAction::default(),
        )
        .await
    }

    /// Save the mapping for the row being processed, keeping its content hash.
    pub async fn save_id_mapping<R: SourceRow + ?Sized>(
        &self,
        row: &R,
        destination: Option<&DestinationKey>,
        status: MapStatus,
        rollback_action: RollbackAction,
    ) -> IdMapResult<MapRow> {
        self.write_mapping(
            row.source_id_values(),
            destination,
            status,
            rollback_action,
            row.hash(),
        )
        .await
    }

    async fn write_mapping(
        &self,
        source: SourceKey,
        destination: Option<&DestinationKey>,
        status: MapStatus,
        rollback_action: RollbackAction,
        hash: Option<String>,
    ) -> IdMapResult<MapRow> {
        self.validate_source(&source)?;
        if let Some(destination) = destination {
            self.validate_destination(destination)?;
        }
        let row = self
            .store
            .upsert(MapRowWrite {
                source,
                destination: destination.cloned(),
                status,
                rollback_action,
                hash,
            })
            .await?;
        tracing::debug!(
            namespace = %self.config.namespace,
            source = %row.source,
            status = %row.status,
            "Saved id mapping"
        );
        Ok(row)
    }

    /// Whether `row`'s content differs from what was last saved for it.
    ///
    /// Unmapped rows, and rows without a hash on either side, count as changed.
    pub async fn has_changed<R: SourceRow + ?Sized>(&self, row: &R) -> IdMapResult<bool> {
        let Some(current) = row.hash() else {
            return Ok(true);
        };
        let source = row.source_id_values();
        self.validate_source(&source)?;
        Ok(match self.store.row_by_source(&source).await? {
            Some(MapRow {
                hash: Some(saved), ..
            }) => saved != current,
            _ => true,
        })
    }

    // ── Lookups ──────────────────────────────────────────────────────

    /// Destination key mapped to `source`, if any.
    pub async fn lookup_destination_id(
        &self,
        source: &SourceKey,
    ) -> IdMapResult<Option<DestinationKey>> {
        Ok(self.get_row_by_source(source).await?.and_then(|row| row.destination))
    }

    /// Source key mapped to `destination`. Several matches are reported as
    /// [`SourceLookup::Ambiguous`] rather than picking one.
    pub async fn lookup_source_id(&self, destination: &DestinationKey) -> IdMapResult<SourceLookup> {
        let mut rows = self.get_rows_by_destination(destination).await?;
        Ok(match rows.len() {
            0 => SourceLookup::NotFound,
            1 => SourceLookup::Found(rows.remove(0).source),
            _ => SourceLookup::Ambiguous(rows.into_iter().map(|row| row.source).collect()),
        })
    }

    pub async fn get_row_by_source(&self, source: &SourceKey) -> IdMapResult<Option<MapRow>> {
        self.validate_source(source)?;
        self.store.row_by_source(source).await
    }

    pub async fn get_rows_by_destination(
        &self,
        destination: &DestinationKey,
    ) -> IdMapResult<Vec<MapRow>> {
        self.validate_destination(destination)?;
        self.store.rows_by_destination(destination).await
    }

    /// Up to `limit` rows awaiting update, in ascending source key order.
    ///
    /// Treat the batch as a hint: another worker may process the same rows.
    pub async fn get_rows_needing_update(&self, limit: usize) -> IdMapResult<Vec<MapRow>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.store.rows_with_status(MapStatus::NeedsUpdate, limit).await
    }

    // ── Status transitions ───────────────────────────────────────────

    /// Mark every Imported or Failed row as needing update, atomically.
    /// Ignored rows keep their status. Returns the number of rows changed.
    pub async fn prepare_update(&self) -> IdMapResult<u64> {
        let changed = self.store.mark_needs_update(None).await?;
        tracing::info!(
            namespace = %self.config.namespace,
            count = changed,
            "Prepared id map for update"
        );
        Ok(changed)
    }

    /// Mark one row as needing update. Missing and Ignored rows are left
    /// alone. Returns whether the row changed.
    pub async fn set_update(&self, source: &SourceKey) -> IdMapResult<bool> {
        self.validate_source(source)?;
        let changed = self.store.mark_needs_update(Some(source)).await? > 0;
        tracing::debug!(
            namespace = %self.config.namespace,
            source = %source,
            changed,
            "Flagged row for update"
        );
        Ok(changed)
    }

    /// Irreversibly drop every row and message of this migration.
    /// Open cursors fail with `CursorInvalidated` afterwards.
    pub async fn destroy(&self) -> IdMapResult<()> {
        self.store.destroy().await.inspect_err(|err| {
            tracing::warn!(
                namespace = %self.config.namespace,
                error = %err,
                "Destroying id map storage failed"
            );
        })?;
        tracing::info!(namespace = %self.config.namespace, "Destroyed id map storage");
        Ok(())
    }
}
