//! Message Log: per-source-key diagnostics recorded during a migration.
//!
//! Messages are persisted through the store and then handed to a
//! [`MessageSink`] for display. Reads go through [`MessageStream`], which
//! pages through storage by sequence number.

use std::collections::VecDeque;

use idmap_core::key::SourceKey;
use idmap_core::record::MessageRecord;
use idmap_core::status::MessageLevel;
use idmap_core::types::SequenceNo;

use crate::error::IdMapResult;
use crate::id_map::IdMap;
use crate::store::{IdMapStore, MessageFilter};

// ---------------------------------------------------------------------------
// Display sink
// ---------------------------------------------------------------------------

/// Where recorded messages are shown to a human.
pub trait MessageSink: Send + Sync {
    fn display(&self, source: &SourceKey, message: &str, level: MessageLevel);
}

/// Forwards messages to `tracing` at a level derived from their severity.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MessageSink for TracingSink {
    fn display(&self, source: &SourceKey, message: &str, level: MessageLevel) {
        match level {
            MessageLevel::Error => tracing::error!(source = %source, "{message}"),
            MessageLevel::Warning => tracing::warn!(source = %source, "{message}"),
            MessageLevel::Notice => tracing::info!(source = %source, "{message}"),
            MessageLevel::Informational => tracing::debug!(source = %source, "{message}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

/// Lazy, restartable sequence of messages in insertion order.
pub struct MessageStream<'a, S> {
    store: &'a S,
    filter: MessageFilter,
    page_size: usize,
    buffer: VecDeque<MessageRecord>,
    last_sequence: Option<SequenceNo>,
    exhausted: bool,
}

impl<'a, S: IdMapStore> MessageStream<'a, S> {
    fn new(store: &'a S, filter: MessageFilter, page_size: usize) -> Self {
        Self {
            store,
            filter,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            last_sequence: None,
            exhausted: false,
        }
    }

    /// Next matching message, fetching another page when the buffer is empty.
    pub async fn next(&mut self) -> IdMapResult<Option<MessageRecord>> {
        if self.buffer.is_empty() && !self.exhausted {
            let page = self
                .store
                .read_messages(&self.filter, self.last_sequence, self.page_size)
                .await?;
            self.exhausted = page.len() < self.page_size;
            if let Some(last) = page.last() {
                self.last_sequence = Some(last.sequence);
            }
            self.buffer.extend(page);
        }
        Ok(self.buffer.pop_front())
    }

    /// Start again from the first message. Messages recorded since the
    /// previous pass are included.
    pub fn rewind(&mut self) {
        self.buffer.clear();
        self.last_sequence = None;
        self.exhausted = false;
    }

    /// Drain the remaining messages.
    pub async fn collect(mut self) -> IdMapResult<Vec<MessageRecord>> {
        let mut out = Vec::new();
        while let Some(record) = self.next().await? {
            out.push(record);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// IdMap message operations
// ---------------------------------------------------------------------------

impl<S: IdMapStore> IdMap<S> {
    /// Record a message at the configured default level.
    pub async fn record(&self, source: &SourceKey, message: &str) -> IdMapResult<MessageRecord> {
        self.record_with_level(source, message, self.config.default_message_level)
            .await
    }

    /// Record a message. Works whether or not `source` has been mapped yet.
    pub async fn record_with_level(
        &self,
        source: &SourceKey,
        message: &str,
        level: MessageLevel,
    ) -> IdMapResult<MessageRecord> {
        self.validate_source(source)?;
        let record = self.store.append_message(source, level, message).await?;
        self.sink.display(source, message, level);
        Ok(record)
    }

    /// Stream messages matching `filter`. An empty filter reads everything.
    pub fn read_all(&self, filter: MessageFilter) -> IdMapResult<MessageStream<'_, S>> {
        if let Some(source) = &filter.source {
            self.validate_source(source)?;
        }
        Ok(MessageStream::new(
            &self.store,
            filter,
            self.config.message_page_size,
        ))
    }

    /// Remove every message. Returns the number removed.
    pub async fn clear_messages(&self) -> IdMapResult<u64> {
        let removed = self.store.clear_messages().await?;
        tracing::info!(
            namespace = %self.config.namespace,
            count = removed,
            "Cleared id map messages"
        );
        Ok(removed)
    }

    pub async fn message_count(&self) -> IdMapResult<u64> {
        Ok(self.store.counts().await?.messages)
    }
}
