//! Cursor: restartable traversal over map rows in ascending source key order.
//!
//! A cursor snapshots the set of source keys when opened. Rows added later
//! are not visited; rows deleted later are skipped. Destroying the storage
//! invalidates the cursor.

use std::collections::VecDeque;

use idmap_core::key::{DestinationKey, SourceKey};
use idmap_core::record::MapRow;

use crate::error::{IdMapError, IdMapResult};
use crate::id_map::IdMap;
use crate::store::IdMapStore;

pub struct Cursor<'a, S> {
    id_map: &'a IdMap<S>,
    pending: VecDeque<SourceKey>,
    current: Option<MapRow>,
    generation: u64,
}

impl<'a, S: IdMapStore> Cursor<'a, S> {
    /// Snapshot the current key set. Call [`Cursor::advance`] to reach the
    /// first row.
    pub async fn open(id_map: &'a IdMap<S>) -> IdMapResult<Self> {
        let generation = id_map.store.generation();
        let pending = id_map.store.source_keys().await?.into();
        Ok(Self {
            id_map,
            pending,
            current: None,
            generation,
        })
    }

    fn check_valid(&self) -> IdMapResult<()> {
        if self.id_map.store.generation() == self.generation {
            Ok(())
        } else {
            Err(IdMapError::CursorInvalidated {
                namespace: self.id_map.store.namespace().clone(),
            })
        }
    }

    /// Move to the next row that still exists. Returns `false` once the
    /// snapshot is exhausted.
    pub async fn advance(&mut self) -> IdMapResult<bool> {
        self.check_valid()?;
        while let Some(source) = self.pending.pop_front() {
            if let Some(row) = self.id_map.store.row_by_source(&source).await? {
                self.check_valid()?;
                self.current = Some(row);
                return Ok(true);
            }
        }
        self.current = None;
        Ok(false)
    }

    /// Row the cursor is positioned on.
    pub fn current(&self) -> IdMapResult<Option<&MapRow>> {
        self.check_valid()?;
        Ok(self.current.as_ref())
    }

    pub fn current_source(&self) -> IdMapResult<Option<&SourceKey>> {
        Ok(self.current()?.map(|row| &row.source))
    }

    pub fn current_destination(&self) -> IdMapResult<Option<&DestinationKey>> {
        Ok(self.current()?.and_then(|row| row.destination.as_ref()))
    }

    /// Keys in the snapshot not yet visited.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Take a fresh snapshot and start over.
    pub async fn rewind(&mut self) -> IdMapResult<()> {
        self.generation = self.id_map.store.generation();
        self.pending = self.id_map.store.source_keys().await?.into();
        self.current = None;
        Ok(())
    }
}

impl<S: IdMapStore> IdMap<S> {
    /// Open a [`Cursor`] over every row.
    pub async fn cursor(&self) -> IdMapResult<Cursor<'_, S>> {
        Cursor::open(self).await
    }
}
