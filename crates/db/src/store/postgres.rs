//! PostgreSQL backend: two tables per migration namespace.
//!
//! - `migrate_map_<ns>`: one row per source key, primary key
//!   `source_ids_hash`, typed `sourceid1..N` and nullable `destid1..M`.
//! - `migrate_message_<ns>`: `msgid BIGSERIAL`, the source key columns,
//!   `level` and `message`.
//!
//! Tables are created lazily on first use and again after `destroy`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use idmap_core::config::{IdMapConfig, MapNamespace};
use idmap_core::error::CoreError;
use idmap_core::key::{DestinationKey, KeyValue, SourceKey};
use idmap_core::record::{MapRow, MapRowWrite, MessageRecord};
use idmap_core::schema::{KeyFieldType, KeySchema};
use idmap_core::status::{MapStatus, MessageLevel, RollbackAction};
use idmap_core::types::{SequenceNo, Timestamp};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row};
use uuid::Uuid;

use super::{IdMapStore, MessageFilter, RelationalStore, StatusCounts};
use crate::error::IdMapResult;
use crate::DbPool;

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// Default PostgreSQL schema the tables are created in.
pub const DEFAULT_PG_SCHEMA: &str = "public";

// ---------------------------------------------------------------------------
// Binding / decoding helpers
// ---------------------------------------------------------------------------

fn bind_value<'q>(query: PgQuery<'q>, value: &KeyValue) -> PgQuery<'q> {
    match value {
        KeyValue::Integer(i) => query.bind(*i),
        KeyValue::Text(s) => query.bind(s.clone()),
        KeyValue::Uuid(id) => query.bind(*id),
    }
}

fn bind_null(query: PgQuery<'_>, field_type: KeyFieldType) -> PgQuery<'_> {
    match field_type {
        KeyFieldType::Integer => query.bind(None::<i64>),
        KeyFieldType::Text => query.bind(None::<String>),
        KeyFieldType::Uuid => query.bind(None::<Uuid>),
    }
}

fn bind_key<'q>(mut query: PgQuery<'q>, values: &[KeyValue]) -> PgQuery<'q> {
    for value in values {
        query = bind_value(query, value);
    }
    query
}

fn sql_type(field_type: KeyFieldType) -> &'static str {
    match field_type {
        KeyFieldType::Integer => "BIGINT",
        KeyFieldType::Text => "TEXT",
        KeyFieldType::Uuid => "UUID",
    }
}

fn decode_value(
    row: &PgRow,
    column: &str,
    field_type: KeyFieldType,
) -> Result<Option<KeyValue>, sqlx::Error> {
    Ok(match field_type {
        KeyFieldType::Integer => row.try_get::<Option<i64>, _>(column)?.map(KeyValue::Integer),
        KeyFieldType::Text => row.try_get::<Option<String>, _>(column)?.map(KeyValue::Text),
        KeyFieldType::Uuid => row.try_get::<Option<Uuid>, _>(column)?.map(KeyValue::Uuid),
    })
}

fn validate_identifier(kind: &str, name: &str) -> Result<(), CoreError> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid && name.len() <= 63 {
        Ok(())
    } else {
        Err(CoreError::Validation(format!("Invalid {kind} name '{name}'")))
    }
}

// ---------------------------------------------------------------------------
// SQL layout
// ---------------------------------------------------------------------------

/// Table names, column lists and statement text for one namespace.
#[derive(Debug, Clone)]
struct Layout {
    namespace: MapNamespace,
    pg_schema: String,
    source_schema: KeySchema,
    destination_schema: KeySchema,
}

impl Layout {
    fn map_table(&self) -> String {
        format!("\"{}\".\"migrate_map_{}\"", self.pg_schema, self.namespace)
    }

    fn message_table(&self) -> String {
        format!("\"{}\".\"migrate_message_{}\"", self.pg_schema, self.namespace)
    }

    fn source_columns(&self) -> Vec<String> {
        (1..=self.source_schema.arity()).map(|i| format!("sourceid{i}")).collect()
    }

    fn destination_columns(&self) -> Vec<String> {
        (1..=self.destination_schema.arity()).map(|i| format!("destid{i}")).collect()
    }

    /// Column list for `SELECT`/`RETURNING` on the map table.
    fn map_columns(&self) -> String {
        let mut columns = vec!["source_ids_hash".to_string()];
        columns.extend(self.source_columns());
        columns.extend(self.destination_columns());
        columns.extend(
            ["source_row_status", "rollback_action", "hash", "last_imported"].map(String::from),
        );
        columns.join(", ")
    }

    /// Column list for `SELECT` on the message table.
    fn message_columns(&self) -> String {
        let mut columns = vec!["msgid".to_string()];
        columns.extend(self.source_columns());
        columns.extend(["level", "message"].map(String::from));
        columns.join(", ")
    }

    /// Ascending source key order. Text compares bytewise (`COLLATE "C"`)
    /// to match the ordering of the other backends.
    fn order_by_source(&self) -> String {
        self.source_schema
            .fields()
            .iter()
            .zip(self.source_columns())
            .map(|(field, column)| match field.field_type {
                KeyFieldType::Text => format!("{column} COLLATE \"C\""),
                _ => column,
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `destid1 = $first AND destid2 = $first+1 ...`
    fn destination_predicate(&self, first: usize) -> String {
        self.destination_columns()
            .iter()
            .enumerate()
            .map(|(i, column)| format!("{column} = ${}", first + i))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn create_statements(&self) -> Vec<String> {
        let map = self.map_table();
        let message = self.message_table();
        let ns = &self.namespace;

        let source_defs: Vec<String> = self
            .source_schema
            .fields()
            .iter()
            .zip(self.source_columns())
            .map(|(field, column)| format!("{column} {} NOT NULL", sql_type(field.field_type)))
            .collect();
        let destination_defs: Vec<String> = self
            .destination_schema
            .fields()
            .iter()
            .zip(self.destination_columns())
            .map(|(field, column)| format!("{column} {} NULL", sql_type(field.field_type)))
            .collect();

        vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {map} ( \
                    source_ids_hash VARCHAR(64) PRIMARY KEY, \
                    {}, \
                    {}, \
                    source_row_status SMALLINT NOT NULL DEFAULT {}, \
                    rollback_action SMALLINT NOT NULL DEFAULT {}, \
                    hash TEXT NULL, \
                    last_imported TIMESTAMPTZ NOT NULL DEFAULT NOW() \
                 )",
                source_defs.join(", "),
                destination_defs.join(", "),
                MapStatus::Imported.id(),
                RollbackAction::Delete.id(),
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS \"mm_{ns}_dest\" ON {map} ({})",
                self.destination_columns().join(", ")
            ),
            format!("CREATE INDEX IF NOT EXISTS \"mm_{ns}_status\" ON {map} (source_row_status)"),
            format!(
                "CREATE TABLE IF NOT EXISTS {message} ( \
                    msgid BIGSERIAL PRIMARY KEY, \
                    source_ids_hash VARCHAR(64) NOT NULL, \
                    {}, \
                    level SMALLINT NOT NULL DEFAULT {}, \
                    message TEXT NOT NULL \
                 )",
                source_defs.join(", "),
                MessageLevel::Error.id(),
            ),
            format!("CREATE INDEX IF NOT EXISTS \"mg_{ns}_source\" ON {message} (source_ids_hash)"),
        ]
    }

    fn upsert_statement(&self) -> String {
        let source_columns = self.source_columns();
        let destination_columns = self.destination_columns();
        let value_count = 1 + source_columns.len() + destination_columns.len() + 3;
        let placeholders: Vec<String> = (1..=value_count).map(|i| format!("${i}")).collect();
        let updates: Vec<String> = destination_columns
            .iter()
            .map(String::as_str)
            .chain(["source_row_status", "rollback_action", "hash", "last_imported"])
            .map(|column| format!("{column} = EXCLUDED.{column}"))
            .collect();

        format!(
            "INSERT INTO {} \
                (source_ids_hash, {}, {}, source_row_status, rollback_action, hash, last_imported) \
             VALUES ({}, NOW()) \
             ON CONFLICT (source_ids_hash) DO UPDATE SET {} \
             RETURNING {}",
            self.map_table(),
            source_columns.join(", "),
            destination_columns.join(", "),
            placeholders.join(", "),
            updates.join(", "),
            self.map_columns(),
        )
    }

    fn insert_message_statement(&self) -> String {
        let source_columns = self.source_columns();
        let placeholders: Vec<String> =
            (1..=source_columns.len() + 3).map(|i| format!("${i}")).collect();
        format!(
            "INSERT INTO {} (source_ids_hash, {}, level, message) \
             VALUES ({}) \
             RETURNING {}",
            self.message_table(),
            source_columns.join(", "),
            placeholders.join(", "),
            self.message_columns(),
        )
    }

    fn decode_source(&self, row: &PgRow) -> IdMapResult<SourceKey> {
        let mut values = Vec::with_capacity(self.source_schema.arity());
        for (field, column) in self.source_schema.fields().iter().zip(self.source_columns()) {
            let value = decode_value(row, &column, field.field_type)?.ok_or_else(|| {
                CoreError::Internal(format!("NULL in non-null column {column}"))
            })?;
            values.push(value);
        }
        Ok(SourceKey::new(values))
    }

    fn decode_destination(&self, row: &PgRow) -> IdMapResult<Option<DestinationKey>> {
        let mut values = Vec::with_capacity(self.destination_schema.arity());
        for (field, column) in self
            .destination_schema
            .fields()
            .iter()
            .zip(self.destination_columns())
        {
            values.push(decode_value(row, &column, field.field_type)?);
        }
        if values.iter().all(Option::is_none) {
            return Ok(None);
        }
        let values: Option<Vec<KeyValue>> = values.into_iter().collect();
        match values {
            Some(values) => Ok(Some(DestinationKey::new(values))),
            None => Err(CoreError::Internal(format!(
                "Partially NULL destination key in {}",
                self.map_table()
            ))
            .into()),
        }
    }

    fn decode_map_row(&self, row: &PgRow) -> IdMapResult<MapRow> {
        Ok(MapRow {
            source: self.decode_source(row)?,
            destination: self.decode_destination(row)?,
            status: MapStatus::from_id(row.try_get::<i16, _>("source_row_status")?)?,
            rollback_action: RollbackAction::from_id(row.try_get::<i16, _>("rollback_action")?)?,
            hash: row.try_get::<Option<String>, _>("hash")?,
            last_imported: row.try_get::<Timestamp, _>("last_imported")?,
        })
    }

    fn decode_message(&self, row: &PgRow) -> IdMapResult<MessageRecord> {
        Ok(MessageRecord {
            sequence: row.try_get::<i64, _>("msgid")?,
            source: self.decode_source(row)?,
            level: MessageLevel::from_id(row.try_get::<i16, _>("level")?)?,
            message: row.try_get::<String, _>("message")?,
        })
    }
}

fn limit_to_i64(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Id-map store persisting into PostgreSQL through a shared [`DbPool`].
#[derive(Debug)]
pub struct PgStore {
    pool: DbPool,
    layout: Layout,
    ready: AtomicBool,
    generation: AtomicU64,
}

impl PgStore {
    /// Create a store for `config`'s namespace in the `public` schema.
    /// No I/O happens until the first operation.
    pub fn new(pool: DbPool, config: &IdMapConfig) -> Self {
        Self {
            pool,
            layout: Layout {
                namespace: config.namespace.clone(),
                pg_schema: DEFAULT_PG_SCHEMA.to_string(),
                source_schema: config.source_schema.clone(),
                destination_schema: config.destination_schema.clone(),
            },
            ready: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    /// Place the tables in another PostgreSQL schema.
    pub fn with_pg_schema(mut self, pg_schema: &str) -> Result<Self, CoreError> {
        validate_identifier("PostgreSQL schema", pg_schema)?;
        self.layout.pg_schema = pg_schema.to_string();
        Ok(self)
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

impl RelationalStore for PgStore {
    fn qualified_map_table_name(&self) -> String {
        self.layout.map_table()
    }

    fn qualified_message_table_name(&self) -> String {
        self.layout.message_table()
    }
}

#[async_trait]
impl IdMapStore for PgStore {
    fn namespace(&self) -> &MapNamespace {
        &self.layout.namespace
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    async fn ensure_storage(&self) -> IdMapResult<()> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        // CREATE ... IF NOT EXISTS races on the catalog; serialize creators.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(self.layout.map_table())
            .execute(&mut *tx)
            .await?;
        for statement in self.layout.create_statements() {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        self.ready.store(true, Ordering::Release);
        tracing::info!(
            namespace = %self.layout.namespace,
            map_table = %self.layout.map_table(),
            "Id map tables ready"
        );
        Ok(())
    }

    async fn upsert(&self, row: MapRowWrite) -> IdMapResult<MapRow> {
        self.ensure_storage().await?;
        let sql = self.layout.upsert_statement();

        let mut query = sqlx::query(&sql).bind(row.source.ids_hash());
        query = bind_key(query, row.source.values());
        match &row.destination {
            Some(destination) => query = bind_key(query, destination.values()),
            None => {
                for field in self.layout.destination_schema.fields() {
                    query = bind_null(query, field.field_type);
                }
            }
        }
        let stored = query
            .bind(row.status.id())
            .bind(row.rollback_action.id())
            .bind(&row.hash)
            .fetch_one(&self.pool)
            .await?;
        self.layout.decode_map_row(&stored)
    }

    async fn row_by_source(&self, source: &SourceKey) -> IdMapResult<Option<MapRow>> {
        self.ensure_storage().await?;
        let sql = format!(
            "SELECT {} FROM {} WHERE source_ids_hash = $1",
            self.layout.map_columns(),
            self.layout.map_table()
        );
        let row = sqlx::query(&sql)
            .bind(source.ids_hash())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| self.layout.decode_map_row(&r)).transpose()
    }

    async fn rows_by_destination(&self, destination: &DestinationKey) -> IdMapResult<Vec<MapRow>> {
        self.ensure_storage().await?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {}",
            self.layout.map_columns(),
            self.layout.map_table(),
            self.layout.destination_predicate(1),
            self.layout.order_by_source()
        );
        let rows = bind_key(sqlx::query(&sql), destination.values())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| self.layout.decode_map_row(r)).collect()
    }

    async fn rows_with_status(&self, status: MapStatus, limit: usize) -> IdMapResult<Vec<MapRow>> {
        self.ensure_storage().await?;
        let sql = format!(
            "SELECT {} FROM {} WHERE source_row_status = $1 ORDER BY {} LIMIT $2",
            self.layout.map_columns(),
            self.layout.map_table(),
            self.layout.order_by_source()
        );
        let rows = sqlx::query(&sql)
            .bind(status.id())
            .bind(limit_to_i64(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| self.layout.decode_map_row(r)).collect()
    }

    async fn source_keys(&self) -> IdMapResult<Vec<SourceKey>> {
        self.ensure_storage().await?;
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {}",
            self.layout.source_columns().join(", "),
            self.layout.map_table(),
            self.layout.order_by_source()
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(|r| self.layout.decode_source(r)).collect()
    }

    async fn mark_needs_update(&self, source: Option<&SourceKey>) -> IdMapResult<u64> {
        self.ensure_storage().await?;
        let eligible = format!(
            "source_row_status IN ({}, {})",
            MapStatus::Imported.id(),
            MapStatus::Failed.id()
        );
        let result = match source {
            Some(source) => {
                let sql = format!(
                    "UPDATE {} SET source_row_status = $1 \
                     WHERE source_ids_hash = $2 AND {eligible}",
                    self.layout.map_table()
                );
                sqlx::query(&sql)
                    .bind(MapStatus::NeedsUpdate.id())
                    .bind(source.ids_hash())
                    .execute(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "UPDATE {} SET source_row_status = $1 WHERE {eligible}",
                    self.layout.map_table()
                );
                sqlx::query(&sql)
                    .bind(MapStatus::NeedsUpdate.id())
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    async fn counts(&self) -> IdMapResult<StatusCounts> {
        self.ensure_storage().await?;
        let sql = format!(
            "SELECT \
                COUNT(*) AS processed, \
                COUNT(*) FILTER (WHERE source_row_status = $1) AS imported, \
                COUNT(*) FILTER (WHERE source_row_status = $2) AS needs_update, \
                COUNT(*) FILTER (WHERE source_row_status = $3) AS ignored, \
                COUNT(*) FILTER (WHERE source_row_status = $4) AS failed, \
                (SELECT COUNT(*) FROM {}) AS messages \
             FROM {}",
            self.layout.message_table(),
            self.layout.map_table()
        );
        let row = sqlx::query(&sql)
            .bind(MapStatus::Imported.id())
            .bind(MapStatus::NeedsUpdate.id())
            .bind(MapStatus::Ignored.id())
            .bind(MapStatus::Failed.id())
            .fetch_one(&self.pool)
            .await?;
        let count = |column: &str| -> Result<u64, sqlx::Error> {
            Ok(row.try_get::<i64, _>(column)?.max(0) as u64)
        };
        Ok(StatusCounts {
            processed: count("processed")?,
            imported: count("imported")?,
            needs_update: count("needs_update")?,
            ignored: count("ignored")?,
            failed: count("failed")?,
            messages: count("messages")?,
        })
    }

    async fn append_message(
        &self,
        source: &SourceKey,
        level: MessageLevel,
        message: &str,
    ) -> IdMapResult<MessageRecord> {
        self.ensure_storage().await?;
        let sql = self.layout.insert_message_statement();
        let query = bind_key(sqlx::query(&sql).bind(source.ids_hash()), source.values());
        let row = query
            .bind(level.id())
            .bind(message)
            .fetch_one(&self.pool)
            .await?;
        self.layout.decode_message(&row)
    }

    async fn read_messages(
        &self,
        filter: &MessageFilter,
        after: Option<SequenceNo>,
        limit: usize,
    ) -> IdMapResult<Vec<MessageRecord>> {
        self.ensure_storage().await?;
        let sql = format!(
            "SELECT {} FROM {} \
             WHERE ($1::VARCHAR IS NULL OR source_ids_hash = $1) \
               AND ($2::SMALLINT IS NULL OR level = $2) \
               AND msgid > $3 \
             ORDER BY msgid \
             LIMIT $4",
            self.layout.message_columns(),
            self.layout.message_table()
        );
        let rows = sqlx::query(&sql)
            .bind(filter.source.as_ref().map(SourceKey::ids_hash))
            .bind(filter.level.map(MessageLevel::id))
            .bind(after.unwrap_or(0))
            .bind(limit_to_i64(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| self.layout.decode_message(r)).collect()
    }

    async fn clear_messages(&self) -> IdMapResult<u64> {
        self.ensure_storage().await?;
        let sql = format!("DELETE FROM {}", self.layout.message_table());
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, sources: &[SourceKey], messages_only: bool) -> IdMapResult<u64> {
        self.ensure_storage().await?;
        let hashes: Vec<String> = sources.iter().map(SourceKey::ids_hash).collect();

        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "DELETE FROM {} WHERE source_ids_hash = ANY($1)",
            self.layout.message_table()
        );
        sqlx::query(&sql)
            .bind(hashes.as_slice())
            .execute(&mut *tx)
            .await?;

        let mut removed = 0;
        if !messages_only {
            let sql = format!(
                "DELETE FROM {} WHERE source_ids_hash = ANY($1)",
                self.layout.map_table()
            );
            removed = sqlx::query(&sql)
                .bind(hashes.as_slice())
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn delete_destination(&self, destination: &DestinationKey) -> IdMapResult<u64> {
        self.ensure_storage().await?;
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "DELETE FROM {} WHERE {} RETURNING source_ids_hash",
            self.layout.map_table(),
            self.layout.destination_predicate(1)
        );
        let deleted = bind_key(sqlx::query(&sql), destination.values())
            .fetch_all(&mut *tx)
            .await?;
        let hashes = deleted
            .iter()
            .map(|r| r.try_get::<String, _>("source_ids_hash"))
            .collect::<Result<Vec<_>, _>>()?;

        if !hashes.is_empty() {
            let sql = format!(
                "DELETE FROM {} WHERE source_ids_hash = ANY($1)",
                self.layout.message_table()
            );
            sqlx::query(&sql)
                .bind(hashes.as_slice())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(hashes.len() as u64)
    }

    async fn destroy(&self) -> IdMapResult<()> {
        let mut tx = self.pool.begin().await?;
        for table in [self.layout.message_table(), self.layout.map_table()] {
            sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        self.ready.store(false, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
