//! In-process backend over ordered maps.
//!
//! All state sits behind one `RwLock`, so every mutation (including the
//! bulk ones) is observed by readers either entirely or not at all.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use idmap_core::config::MapNamespace;
use idmap_core::key::{DestinationKey, SourceKey};
use idmap_core::record::{MapRow, MapRowWrite, MessageRecord};
use idmap_core::status::{MapStatus, MessageLevel};
use idmap_core::types::SequenceNo;
use parking_lot::RwLock;

use super::{IdMapStore, MessageFilter, StatusCounts};
use crate::error::IdMapResult;

#[derive(Debug, Default)]
struct State {
    rows: BTreeMap<SourceKey, MapRow>,
    messages: BTreeMap<SequenceNo, MessageRecord>,
    last_sequence: SequenceNo,
}

impl State {
    /// Single pass over the ledger regardless of how many sources go.
    fn remove_messages_for(&mut self, sources: &BTreeSet<&SourceKey>) {
        if sources.is_empty() {
            return;
        }
        self.messages.retain(|_, m| !sources.contains(&m.source));
    }
}

/// Volatile store, suitable for tests and single-process dry runs.
#[derive(Debug)]
pub struct InMemoryStore {
    namespace: MapNamespace,
    state: RwLock<State>,
    generation: AtomicU64,
}

impl InMemoryStore {
    pub fn new(namespace: MapNamespace) -> Self {
        Self {
            namespace,
            state: RwLock::new(State::default()),
            generation: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl IdMapStore for InMemoryStore {
    fn namespace(&self) -> &MapNamespace {
        &self.namespace
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    async fn ensure_storage(&self) -> IdMapResult<()> {
        Ok(())
    }

    async fn upsert(&self, row: MapRowWrite) -> IdMapResult<MapRow> {
        let row = row.into_row(chrono::Utc::now());
        self.state.write().rows.insert(row.source.clone(), row.clone());
        Ok(row)
    }

    async fn row_by_source(&self, source: &SourceKey) -> IdMapResult<Option<MapRow>> {
        Ok(self.state.read().rows.get(source).cloned())
    }

    async fn rows_by_destination(&self, destination: &DestinationKey) -> IdMapResult<Vec<MapRow>> {
        let state = self.state.read();
        Ok(state
            .rows
            .values()
            .filter(|row| row.destination.as_ref() == Some(destination))
            .cloned()
            .collect())
    }

    async fn rows_with_status(&self, status: MapStatus, limit: usize) -> IdMapResult<Vec<MapRow>> {
        let state = self.state.read();
        Ok(state
            .rows
            .values()
            .filter(|row| row.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn source_keys(&self) -> IdMapResult<Vec<SourceKey>> {
        Ok(self.state.read().rows.keys().cloned().collect())
    }

    async fn mark_needs_update(&self, source: Option<&SourceKey>) -> IdMapResult<u64> {
        let mut state = self.state.write();
        let mut changed = 0;
        let mut mark = |row: &mut MapRow| {
            if row.status.accepts_update() {
                row.status = MapStatus::NeedsUpdate;
                changed += 1;
            }
        };
        match source {
            Some(source) => {
                if let Some(row) = state.rows.get_mut(source) {
                    mark(row);
                }
            }
            None => state.rows.values_mut().for_each(&mut mark),
        }
        Ok(changed)
    }

    async fn counts(&self) -> IdMapResult<StatusCounts> {
        let state = self.state.read();
        let mut counts = StatusCounts {
            messages: state.messages.len() as u64,
            ..StatusCounts::default()
        };
        for row in state.rows.values() {
            counts.add(row.status);
        }
        Ok(counts)
    }

    async fn append_message(
        &self,
        source: &SourceKey,
        level: MessageLevel,
        message: &str,
    ) -> IdMapResult<MessageRecord> {
        let mut state = self.state.write();
        state.last_sequence += 1;
        let record = MessageRecord {
            sequence: state.last_sequence,
            source: source.clone(),
            level,
            message: message.to_string(),
        };
        state.messages.insert(record.sequence, record.clone());
        Ok(record)
    }

    async fn read_messages(
        &self,
        filter: &MessageFilter,
        after: Option<SequenceNo>,
        limit: usize,
    ) -> IdMapResult<Vec<MessageRecord>> {
        let state = self.state.read();
        let start = after.map_or(SequenceNo::MIN, |seq| seq.saturating_add(1));
        Ok(state
            .messages
            .range(start..)
            .map(|(_, m)| m)
            .filter(|m| filter.matches(m))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn clear_messages(&self) -> IdMapResult<u64> {
        let mut state = self.state.write();
        let removed = state.messages.len() as u64;
        state.messages.clear();
        Ok(removed)
    }

    async fn delete(&self, sources: &[SourceKey], messages_only: bool) -> IdMapResult<u64> {
        let targets: BTreeSet<&SourceKey> = sources.iter().collect();
        let mut state = self.state.write();
        state.remove_messages_for(&targets);
        if messages_only {
            return Ok(0);
        }
        let mut removed = 0;
        for source in targets {
            if state.rows.remove(source).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_destination(&self, destination: &DestinationKey) -> IdMapResult<u64> {
        let mut state = self.state.write();
        let sources: Vec<SourceKey> = state
            .rows
            .values()
            .filter(|row| row.destination.as_ref() == Some(destination))
            .map(|row| row.source.clone())
            .collect();
        for source in &sources {
            state.rows.remove(source);
        }
        state.remove_messages_for(&sources.iter().collect());
        Ok(sources.len() as u64)
    }

    async fn destroy(&self) -> IdMapResult<()> {
        let mut state = self.state.write();
        *state = State::default();
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idmap_core::key::KeyValue;
    use idmap_core::status::RollbackAction;

    fn store() -> InMemoryStore {
        InMemoryStore::new(MapNamespace::new("mem_test").unwrap())
    }

    fn write(id: i64, status: MapStatus) -> MapRowWrite {
        MapRowWrite {
            source: SourceKey::from([KeyValue::from(id)]),
            destination: Some(DestinationKey::from([KeyValue::from(id * 10)])),
            status,
            rollback_action: RollbackAction::Delete,
            hash: None,
        }
    }

    #[tokio::test]
    async fn destroy_bumps_generation_and_empties_state() {
        let store = store();
        store.upsert(write(1, MapStatus::Imported)).await.unwrap();
        assert_eq!(store.generation(), 0);
        store.destroy().await.unwrap();
        assert_eq!(store.generation(), 1);
        assert!(store.source_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sequence_keeps_increasing_after_clear() {
        let store = store();
        let key = SourceKey::from([KeyValue::from(1)]);
        let first = store.append_message(&key, MessageLevel::Error, "a").await.unwrap();
        store.clear_messages().await.unwrap();
        let second = store.append_message(&key, MessageLevel::Error, "b").await.unwrap();
        assert!(second.sequence > first.sequence);
    }

    #[tokio::test]
    async fn rows_with_status_respects_order_and_limit() {
        let store = store();
        for id in [3, 1, 2] {
            store.upsert(write(id, MapStatus::NeedsUpdate)).await.unwrap();
        }
        let rows = store.rows_with_status(MapStatus::NeedsUpdate, 2).await.unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.source.values()[0].as_i64()).collect();
        assert_eq!(ids, vec![Some(1), Some(2)]);
    }

    #[tokio::test]
    async fn bulk_delete_drops_only_the_named_messages() {
        let store = store();
        for id in 1..=4 {
            store.upsert(write(id, MapStatus::Imported)).await.unwrap();
            let key = SourceKey::from([KeyValue::from(id)]);
            store.append_message(&key, MessageLevel::Error, "x").await.unwrap();
            store.append_message(&key, MessageLevel::Notice, "y").await.unwrap();
        }
        let doomed = [SourceKey::from([KeyValue::from(1)]), SourceKey::from([KeyValue::from(3)])];

        assert_eq!(store.delete(&doomed, false).await.unwrap(), 2);

        let state = store.state.read();
        assert_eq!(state.messages.len(), 4);
        assert!(state.messages.values().all(|m| !doomed.contains(&m.source)));
        assert_eq!(state.rows.len(), 2);
    }

    #[tokio::test]
    async fn messages_only_delete_keeps_rows() {
        let store = store();
        let key = SourceKey::from([KeyValue::from(1)]);
        store.upsert(write(1, MapStatus::Imported)).await.unwrap();
        store.append_message(&key, MessageLevel::Error, "x").await.unwrap();

        assert_eq!(store.delete(&[key.clone(), key.clone()], true).await.unwrap(), 0);
        assert!(store.state.read().messages.is_empty());
        assert!(store.row_by_source(&key).await.unwrap().is_some());
    }
}
