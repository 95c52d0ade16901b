use idmap_core::config::MapNamespace;
use idmap_core::error::CoreError;

use crate::store::kv::KvError;

/// Errors surfaced by id-map operations.
///
/// "Not found" is never an error: lookups return `Ok(None)` or an empty list.
#[derive(Debug, thiserror::Error)]
pub enum IdMapError {
    /// Key/schema mismatch or bad configuration from `idmap_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A relational storage error from sqlx.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A key-value engine error.
    #[error(transparent)]
    KeyValue(#[from] KvError),

    /// A cursor was used after the storage it traverses was destroyed.
    #[error("Cursor invalidated: storage for '{namespace}' was destroyed")]
    CursorInvalidated { namespace: MapNamespace },
}

/// Convenience alias for id-map return values.
pub type IdMapResult<T> = Result<T, IdMapError>;

impl IdMapError {
    /// Whether this error reports a call-site configuration defect rather
    /// than a storage failure.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Core(CoreError::Validation(_)))
    }
}
