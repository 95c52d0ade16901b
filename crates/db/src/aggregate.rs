//! Aggregator: progress counters derived from the map and message log.
//!
//! Each call reads one consistent snapshot; two calls may disagree when
//! writers are active.

use crate::error::IdMapResult;
use crate::id_map::IdMap;
use crate::store::{IdMapStore, StatusCounts};

pub struct Aggregator<'a, S> {
    id_map: &'a IdMap<S>,
}

impl<'a, S: IdMapStore> Aggregator<'a, S> {
    pub fn new(id_map: &'a IdMap<S>) -> Self {
        Self { id_map }
    }

    /// All counters from one snapshot.
    pub async fn summary(&self) -> IdMapResult<StatusCounts> {
        self.id_map.store.counts().await
    }

    /// Rows in the map, whatever their status.
    pub async fn processed_count(&self) -> IdMapResult<u64> {
        Ok(self.summary().await?.processed)
    }

    pub async fn imported_count(&self) -> IdMapResult<u64> {
        Ok(self.summary().await?.imported)
    }

    /// Rows awaiting update.
    pub async fn update_count(&self) -> IdMapResult<u64> {
        Ok(self.summary().await?.needs_update)
    }

    pub async fn ignored_count(&self) -> IdMapResult<u64> {
        Ok(self.summary().await?.ignored)
    }

    /// Rows that failed to import.
    pub async fn error_count(&self) -> IdMapResult<u64> {
        Ok(self.summary().await?.failed)
    }

    pub async fn message_count(&self) -> IdMapResult<u64> {
        Ok(self.summary().await?.messages)
    }
}

impl<S: IdMapStore> IdMap<S> {
    pub fn aggregator(&self) -> Aggregator<'_, S> {
        Aggregator::new(self)
    }
}
