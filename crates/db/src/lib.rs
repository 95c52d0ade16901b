//! Storage and components of the migration id-map ledger.
//!
//! [`IdMap`] is the entry point: it validates keys against the migration's
//! schemas and delegates persistence to an [`IdMapStore`] backend
//! ([`InMemoryStore`], [`KeyValueStore`] or [`PgStore`]). Traversal,
//! counting and bulk mutation live in their own modules.

use sqlx::postgres::PgPoolOptions;

pub mod aggregate;
pub mod bulk;
pub mod cursor;
pub mod error;
pub mod id_map;
pub mod messages;
pub mod store;

pub use aggregate::Aggregator;
pub use cursor::Cursor;
pub use error::{IdMapError, IdMapResult};
pub use id_map::{IdMap, SourceLookup};
pub use messages::{MessageSink, MessageStream, TracingSink};
pub use store::kv::{KeyValueStore, KvEngine, MemoryKvEngine};
pub use store::memory::InMemoryStore;
pub use store::postgres::PgStore;
pub use store::{IdMapStore, MessageFilter, RelationalStore, StatusCounts};

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Round-trip a trivial query to verify the pool can reach the database.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
