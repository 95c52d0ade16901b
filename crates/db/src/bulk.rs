//! Bulk Operator: targeted and batched removal of rows and messages.
//!
//! Every operation here reaches the backend as a single atomic mutation,
//! never as a loop of per-key transactions.

use std::collections::BTreeSet;

use idmap_core::key::{DestinationKey, SourceKey};

use crate::error::IdMapResult;
use crate::id_map::IdMap;
use crate::store::IdMapStore;

impl<S: IdMapStore> IdMap<S> {
    /// Remove `source`'s messages and, unless `messages_only`, its map row.
    /// Returns whether a map row was removed.
    pub async fn delete(&self, source: &SourceKey, messages_only: bool) -> IdMapResult<bool> {
        self.validate_source(source)?;
        let removed = self
            .store
            .delete(std::slice::from_ref(source), messages_only)
            .await?;
        tracing::debug!(
            namespace = %self.config.namespace,
            source = %source,
            messages_only,
            "Deleted id map entry"
        );
        Ok(removed > 0)
    }

    /// Remove `source`'s messages, keeping its map row.
    pub async fn delete_messages(&self, source: &SourceKey) -> IdMapResult<()> {
        self.delete(source, true).await.map(|_| ())
    }

    /// Fully delete every key in `sources` as one batch. Duplicate keys are
    /// collapsed. Returns the number of map rows removed.
    pub async fn delete_bulk<I>(&self, sources: I) -> IdMapResult<u64>
    where
        I: IntoIterator<Item = SourceKey>,
    {
        let sources: BTreeSet<SourceKey> = sources.into_iter().collect();
        for source in &sources {
            self.validate_source(source)?;
        }
        if sources.is_empty() {
            return Ok(0);
        }
        let sources: Vec<SourceKey> = sources.into_iter().collect();
        let removed = self.store.delete(&sources, false).await?;
        tracing::info!(
            namespace = %self.config.namespace,
            requested = sources.len(),
            removed,
            "Bulk deleted id map entries"
        );
        Ok(removed)
    }

    /// Remove every row mapped to `destination`, with those rows' messages.
    /// Returns the number of map rows removed.
    pub async fn delete_destination(&self, destination: &DestinationKey) -> IdMapResult<u64> {
        self.validate_destination(destination)?;
        let removed = self.store.delete_destination(destination).await?;
        tracing::debug!(
            namespace = %self.config.namespace,
            destination = %destination,
            removed,
            "Deleted id map entries by destination"
        );
        Ok(removed)
    }
}
