//! Key-value backend over an ordered byte-key engine.
//!
//! Layout, with `P = <namespace> 0x00`:
//!
//! | Key                               | Value                 |
//! |-----------------------------------|-----------------------|
//! | `P m <enc(src)>`                  | JSON [`MapRow`]       |
//! | `P d <enc(dst)> <enc(src)>`       | `enc(src)`            |
//! | `P g <seq:u64be>`                 | JSON [`MessageRecord`]|
//! | `P h <hash(src)> <seq:u64be>`     | empty                 |
//! | `P s`                             | last sequence, u64be  |
//!
//! Key encodings are order preserving, so prefix scans come back in
//! ascending source key order. Read-modify-write operations hold the
//! store's writer lock and commit through one [`WriteBatch`].

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use idmap_core::config::MapNamespace;
use idmap_core::key::{DestinationKey, SourceKey};
use idmap_core::record::{MapRow, MapRowWrite, MessageRecord};
use idmap_core::status::{MapStatus, MessageLevel};
use idmap_core::types::SequenceNo;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{IdMapStore, MessageFilter, StatusCounts};
use crate::error::{IdMapError, IdMapResult};

// ---------------------------------------------------------------------------
// Engine contract
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("Key-value engine error: {0}")]
    Engine(String),

    #[error("Failed to encode value: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Corrupt value under key {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Mutations applied by [`KvEngine::write`] as a single atomic unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(key));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// A consistent, point-in-time view of the engine.
pub trait KvRead {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError>;

    /// Visit entries whose key starts with `prefix`, in key order, beginning
    /// at `start` (inclusive) when given. Stops when `visit` breaks.
    fn scan(
        &self,
        prefix: &[u8],
        start: Option<&[u8]>,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<(), KvError>;
}

/// An ordered byte-key store with atomic batch writes.
pub trait KvEngine: Send + Sync {
    /// Run `read` against one consistent view.
    fn read<R, E>(&self, read: impl FnOnce(&dyn KvRead) -> Result<R, E>) -> Result<R, E>
    where
        E: From<KvError>;

    fn write(&self, batch: WriteBatch) -> Result<(), KvError>;
}

// ---------------------------------------------------------------------------
// Bundled engine
// ---------------------------------------------------------------------------

/// `BTreeMap`-backed engine living in process memory.
#[derive(Debug, Default)]
pub struct MemoryKvEngine {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKvEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

struct MemoryView<'a>(&'a BTreeMap<Vec<u8>, Vec<u8>>);

impl KvRead for MemoryView<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.0.get(key).cloned())
    }

    fn scan(
        &self,
        prefix: &[u8],
        start: Option<&[u8]>,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<(), KvError> {
        let from = match start {
            Some(start) if start > prefix => start.to_vec(),
            _ => prefix.to_vec(),
        };
        for (key, value) in self.0.range(from..) {
            if !key.starts_with(prefix) {
                break;
            }
            if visit(key, value).is_break() {
                break;
            }
        }
        Ok(())
    }
}

impl KvEngine for MemoryKvEngine {
    fn read<R, E>(&self, read: impl FnOnce(&dyn KvRead) -> Result<R, E>) -> Result<R, E>
    where
        E: From<KvError>,
    {
        let entries = self.entries.read();
        read(&MemoryView(&entries))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), KvError> {
        let mut entries = self.entries.write();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put(key, value) => {
                    entries.insert(key, value);
                }
                BatchOp::Delete(key) => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Keyspace
// ---------------------------------------------------------------------------

const TAG_ROW: u8 = b'm';
const TAG_DEST_INDEX: u8 = b'd';
const TAG_MESSAGE: u8 = b'g';
const TAG_MESSAGE_BY_SOURCE: u8 = b'h';
const TAG_SEQUENCE: u8 = b's';

#[derive(Debug)]
struct Keyspace {
    root: Vec<u8>,
}

impl Keyspace {
    fn new(namespace: &MapNamespace) -> Self {
        let mut root = namespace.as_str().as_bytes().to_vec();
        root.push(0x00);
        Self { root }
    }

    fn tagged(&self, tag: u8) -> Vec<u8> {
        let mut key = self.root.clone();
        key.push(tag);
        key
    }

    fn row(&self, source: &SourceKey) -> Vec<u8> {
        let mut key = self.tagged(TAG_ROW);
        key.extend_from_slice(&source.encode());
        key
    }

    fn dest_prefix(&self, destination: &DestinationKey) -> Vec<u8> {
        let mut key = self.tagged(TAG_DEST_INDEX);
        key.extend_from_slice(&destination.encode());
        key
    }

    fn dest_entry(&self, destination: &DestinationKey, source: &SourceKey) -> Vec<u8> {
        let mut key = self.dest_prefix(destination);
        key.extend_from_slice(&source.encode());
        key
    }

    fn message(&self, sequence: SequenceNo) -> Vec<u8> {
        let mut key = self.tagged(TAG_MESSAGE);
        key.extend_from_slice(&(sequence as u64).to_be_bytes());
        key
    }

    fn source_messages_prefix(&self, source: &SourceKey) -> Vec<u8> {
        let mut key = self.tagged(TAG_MESSAGE_BY_SOURCE);
        key.extend_from_slice(source.ids_hash().as_bytes());
        key
    }

    fn source_message(&self, source: &SourceKey, sequence: SequenceNo) -> Vec<u8> {
        let mut key = self.source_messages_prefix(source);
        key.extend_from_slice(&(sequence as u64).to_be_bytes());
        key
    }

    fn sequence(&self) -> Vec<u8> {
        self.tagged(TAG_SEQUENCE)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, KvError> {
    serde_json::to_vec(value).map_err(KvError::Encode)
}

fn decode<T: DeserializeOwned>(key: &[u8], bytes: &[u8]) -> Result<T, KvError> {
    serde_json::from_slice(bytes).map_err(|source| KvError::Decode {
        key: String::from_utf8_lossy(key).into_owned(),
        source,
    })
}

fn sequence_suffix(key: &[u8]) -> Result<SequenceNo, KvError> {
    key.len()
        .checked_sub(8)
        .and_then(|at| key[at..].try_into().ok())
        .map(|bytes: [u8; 8]| u64::from_be_bytes(bytes) as SequenceNo)
        .ok_or_else(|| KvError::Engine(format!("Malformed sequence key of {} bytes", key.len())))
}

/// Collect every entry under `prefix`.
fn scan_all(
    view: &dyn KvRead,
    prefix: &[u8],
    start: Option<&[u8]>,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError> {
    let mut out = Vec::new();
    view.scan(prefix, start, &mut |key, value| {
        out.push((key.to_vec(), value.to_vec()));
        ControlFlow::Continue(())
    })?;
    Ok(out)
}

/// Decode rows under the row prefix until `take` has accepted `limit` of them.
fn scan_rows(
    view: &dyn KvRead,
    prefix: &[u8],
    limit: usize,
    mut take: impl FnMut(&MapRow) -> bool,
) -> Result<Vec<MapRow>, KvError> {
    let mut out = Vec::new();
    if limit == 0 {
        return Ok(out);
    }
    let mut failure = None;
    view.scan(prefix, None, &mut |key, value| match decode::<MapRow>(key, value) {
        Ok(row) => {
            if take(&row) {
                out.push(row);
            }
            if out.len() >= limit {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        }
        Err(err) => {
            failure = Some(err);
            ControlFlow::Break(())
        }
    })?;
    match failure {
        Some(err) => Err(err),
        None => Ok(out),
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Id-map store laid out over any [`KvEngine`].
///
/// All writers of one namespace must share this instance: the writer lock
/// is what keeps the destination index consistent with the rows.
#[derive(Debug)]
pub struct KeyValueStore<E> {
    namespace: MapNamespace,
    keys: Keyspace,
    engine: E,
    writer: Mutex<()>,
    generation: AtomicU64,
}

impl<E: KvEngine> KeyValueStore<E> {
    pub fn new(namespace: MapNamespace, engine: E) -> Self {
        Self {
            keys: Keyspace::new(&namespace),
            namespace,
            engine,
            writer: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Queue deletion of `source`'s messages and, unless `messages_only`,
    /// its row and destination index entry. Returns whether a row was queued.
    fn queue_delete(
        &self,
        view: &dyn KvRead,
        batch: &mut WriteBatch,
        source: &SourceKey,
        messages_only: bool,
    ) -> Result<bool, KvError> {
        for (index_key, _) in scan_all(view, &self.keys.source_messages_prefix(source), None)? {
            let sequence = sequence_suffix(&index_key)?;
            batch.delete(self.keys.message(sequence));
            batch.delete(index_key);
        }
        if messages_only {
            return Ok(false);
        }
        let row_key = self.keys.row(source);
        let Some(bytes) = view.get(&row_key)? else {
            return Ok(false);
        };
        let row: MapRow = decode(&row_key, &bytes)?;
        if let Some(destination) = &row.destination {
            batch.delete(self.keys.dest_entry(destination, source));
        }
        batch.delete(row_key);
        Ok(true)
    }
}

#[async_trait]
impl<E: KvEngine> IdMapStore for KeyValueStore<E> {
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
        let row_key = self.keys.row(&row.source);
        let _writer = self.writer.lock();

        let previous = self.engine.read(|view| -> Result<_, KvError> {
            view.get(&row_key)?
                .map(|bytes| decode::<MapRow>(&row_key, &bytes))
                .transpose()
        })?;

        let mut batch = WriteBatch::default();
        if let Some(old_destination) = previous.and_then(|p| p.destination) {
            batch.delete(self.keys.dest_entry(&old_destination, &row.source));
        }
        if let Some(destination) = &row.destination {
            batch.put(self.keys.dest_entry(destination, &row.source), row.source.encode());
        }
        batch.put(row_key, encode(&row)?);
        self.engine.write(batch)?;
        Ok(row)
    }

    async fn row_by_source(&self, source: &SourceKey) -> IdMapResult<Option<MapRow>> {
        let row_key = self.keys.row(source);
        self.engine.read(|view| -> IdMapResult<_> {
            Ok(view
                .get(&row_key)?
                .map(|bytes| decode::<MapRow>(&row_key, &bytes))
                .transpose()?)
        })
    }

    async fn rows_by_destination(&self, destination: &DestinationKey) -> IdMapResult<Vec<MapRow>> {
        let prefix = self.keys.dest_prefix(destination);
        self.engine.read(|view| -> IdMapResult<_> {
            let mut rows = Vec::new();
            for (_, encoded_source) in scan_all(view, &prefix, None)? {
                let mut row_key = self.keys.tagged(TAG_ROW);
                row_key.extend_from_slice(&encoded_source);
                if let Some(bytes) = view.get(&row_key)? {
                    let row = decode::<MapRow>(&row_key, &bytes)?;
                    if row.destination.as_ref() == Some(destination) {
                        rows.push(row);
                    }
                }
            }
            Ok(rows)
        })
    }

    async fn rows_with_status(&self, status: MapStatus, limit: usize) -> IdMapResult<Vec<MapRow>> {
        let prefix = self.keys.tagged(TAG_ROW);
        self.engine
            .read(|view| -> IdMapResult<_> {
                Ok(scan_rows(view, &prefix, limit, |row| row.status == status)?)
            })
    }

    async fn source_keys(&self) -> IdMapResult<Vec<SourceKey>> {
        let prefix = self.keys.tagged(TAG_ROW);
        let rows = self
            .engine
            .read(|view| -> IdMapResult<_> { Ok(scan_rows(view, &prefix, usize::MAX, |_| true)?) })?;
        Ok(rows.into_iter().map(|row| row.source).collect())
    }

    async fn mark_needs_update(&self, source: Option<&SourceKey>) -> IdMapResult<u64> {
        let prefix = self.keys.tagged(TAG_ROW);
        let _writer = self.writer.lock();
        let candidates: Vec<MapRow> = self.engine.read(|view| -> IdMapResult<_> {
            match source {
                Some(source) => {
                    let row_key = self.keys.row(source);
                    Ok(view
                        .get(&row_key)?
                        .map(|bytes| decode::<MapRow>(&row_key, &bytes))
                        .transpose()?
                        .into_iter()
                        .collect())
                }
                None => Ok(scan_rows(view, &prefix, usize::MAX, |row| {
                    row.status.accepts_update()
                })?),
            }
        })?;

        let mut batch = WriteBatch::default();
        for mut row in candidates.into_iter().filter(|r| r.status.accepts_update()) {
            row.status = MapStatus::NeedsUpdate;
            batch.put(self.keys.row(&row.source), encode(&row)?);
        }
        let changed = batch.len() as u64;
        if !batch.is_empty() {
            self.engine.write(batch)?;
        }
        Ok(changed)
    }

    async fn counts(&self) -> IdMapResult<StatusCounts> {
        let rows_prefix = self.keys.tagged(TAG_ROW);
        let messages_prefix = self.keys.tagged(TAG_MESSAGE);
        self.engine.read(|view| -> IdMapResult<_> {
            let mut counts = StatusCounts::default();
            for row in scan_rows(view, &rows_prefix, usize::MAX, |_| true)? {
                counts.add(row.status);
            }
            view.scan(&messages_prefix, None, &mut |_, _| {
                counts.messages += 1;
                ControlFlow::Continue(())
            })?;
            Ok(counts)
        })
    }

    async fn append_message(
        &self,
        source: &SourceKey,
        level: MessageLevel,
        message: &str,
    ) -> IdMapResult<MessageRecord> {
        let sequence_key = self.keys.sequence();
        let _writer = self.writer.lock();

        let last = self.engine.read(|view| -> Result<_, KvError> {
            match view.get(&sequence_key)? {
                Some(bytes) => sequence_suffix(&bytes),
                None => Ok(0),
            }
        })?;
        let record = MessageRecord {
            sequence: last + 1,
            source: source.clone(),
            level,
            message: message.to_string(),
        };

        let mut batch = WriteBatch::default();
        batch.put(sequence_key, (record.sequence as u64).to_be_bytes().to_vec());
        batch.put(self.keys.message(record.sequence), encode(&record)?);
        batch.put(self.keys.source_message(source, record.sequence), Vec::new());
        self.engine.write(batch)?;
        Ok(record)
    }

    async fn read_messages(
        &self,
        filter: &MessageFilter,
        after: Option<SequenceNo>,
        limit: usize,
    ) -> IdMapResult<Vec<MessageRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let next = after.map_or(0, |seq| seq.saturating_add(1)).max(0);

        self.engine.read(|view| -> IdMapResult<_> {
            let mut out = Vec::new();
            let mut failure: Option<KvError> = None;

            match &filter.source {
                Some(source) => {
                    let prefix = self.keys.source_messages_prefix(source);
                    let start = self.keys.source_message(source, next);
                    view.scan(&prefix, Some(&start), &mut |index_key, _| {
                        let loaded = sequence_suffix(index_key).and_then(|sequence| {
                            let key = self.keys.message(sequence);
                            view.get(&key)?
                                .map(|bytes| decode::<MessageRecord>(&key, &bytes))
                                .transpose()
                        });
                        match loaded {
                            Ok(Some(record)) if filter.matches(&record) => out.push(record),
                            Ok(_) => {}
                            Err(err) => failure = Some(err),
                        }
                        if failure.is_some() || out.len() >= limit {
                            ControlFlow::Break(())
                        } else {
                            ControlFlow::Continue(())
                        }
                    })?;
                }
                None => {
                    let prefix = self.keys.tagged(TAG_MESSAGE);
                    let start = self.keys.message(next);
                    view.scan(&prefix, Some(&start), &mut |key, value| {
                        match decode::<MessageRecord>(key, value) {
                            Ok(record) if filter.matches(&record) => out.push(record),
                            Ok(_) => {}
                            Err(err) => failure = Some(err),
                        }
                        if failure.is_some() || out.len() >= limit {
                            ControlFlow::Break(())
                        } else {
                            ControlFlow::Continue(())
                        }
                    })?;
                }
            }

            match failure {
                Some(err) => Err(IdMapError::from(err)),
                None => Ok(out),
            }
        })
    }

    async fn clear_messages(&self) -> IdMapResult<u64> {
        let _writer = self.writer.lock();
        let messages_prefix = self.keys.tagged(TAG_MESSAGE);
        let index_prefix = self.keys.tagged(TAG_MESSAGE_BY_SOURCE);

        let (batch, removed) = self.engine.read(|view| -> Result<_, KvError> {
            let mut batch = WriteBatch::default();
            let mut removed = 0_u64;
            for (key, _) in scan_all(view, &messages_prefix, None)? {
                batch.delete(key);
                removed += 1;
            }
            for (key, _) in scan_all(view, &index_prefix, None)? {
                batch.delete(key);
            }
            Ok((batch, removed))
        })?;
        if !batch.is_empty() {
            self.engine.write(batch)?;
        }
        Ok(removed)
    }

    async fn delete(&self, sources: &[SourceKey], messages_only: bool) -> IdMapResult<u64> {
        let _writer = self.writer.lock();
        let (batch, removed) = self.engine.read(|view| -> Result<_, KvError> {
            let mut batch = WriteBatch::default();
            let mut removed = 0_u64;
            for source in sources {
                if self.queue_delete(view, &mut batch, source, messages_only)? {
                    removed += 1;
                }
            }
            Ok((batch, removed))
        })?;
        if !batch.is_empty() {
            self.engine.write(batch)?;
        }
        Ok(removed)
    }

    async fn delete_destination(&self, destination: &DestinationKey) -> IdMapResult<u64> {
        let _writer = self.writer.lock();
        let prefix = self.keys.dest_prefix(destination);
        let (batch, removed) = self.engine.read(|view| -> IdMapResult<_> {
            let mut batch = WriteBatch::default();
            let mut removed = 0_u64;
            for (_, encoded_source) in scan_all(view, &prefix, None)? {
                let mut row_key = self.keys.tagged(TAG_ROW);
                row_key.extend_from_slice(&encoded_source);
                let Some(bytes) = view.get(&row_key)? else {
                    continue;
                };
                let row: MapRow = decode(&row_key, &bytes)?;
                if row.destination.as_ref() != Some(destination) {
                    continue;
                }
                if self.queue_delete(view, &mut batch, &row.source, false)? {
                    removed += 1;
                }
            }
            Ok((batch, removed))
        })?;
        if !batch.is_empty() {
            self.engine.write(batch)?;
        }
        Ok(removed)
    }

    async fn destroy(&self) -> IdMapResult<()> {
        let _writer = self.writer.lock();
        let batch = self.engine.read(|view| -> Result<_, KvError> {
            let mut batch = WriteBatch::default();
            for (key, _) in scan_all(view, &self.keys.root, None)? {
                batch.delete(key);
            }
            Ok(batch)
        })?;
        self.engine.write(batch)?;
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
