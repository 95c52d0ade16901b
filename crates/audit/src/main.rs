//! Read-only inspection of one migration's id map in PostgreSQL.
//!
//! ```text
//! idmap-audit summary
//! idmap-audit messages [error|warning|notice|informational]
//! idmap-audit rows
//! ```
//!
//! Output is JSON, one record per line for `messages` and `rows`.

mod config;

use std::io::Write;

use anyhow::{bail, Context};
use idmap_core::status::MessageLevel;
use idmap_db::{IdMap, MessageFilter, PgStore, RelationalStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::AuditConfig;

enum Command {
    Summary,
    Messages(Option<MessageLevel>),
    Rows,
}

impl Command {
    fn parse(args: &[String]) -> anyhow::Result<Self> {
        match args {
            [] => Ok(Self::Summary),
            [cmd] if cmd == "summary" => Ok(Self::Summary),
            [cmd] if cmd == "rows" => Ok(Self::Rows),
            [cmd] if cmd == "messages" => Ok(Self::Messages(None)),
            [cmd, level] if cmd == "messages" => Ok(Self::Messages(Some(
                MessageLevel::from_name(level).context("Unknown message level")?,
            ))),
            _ => bail!("usage: idmap-audit [summary | messages [level] | rows]"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "idmap_audit=info,idmap_db=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = Command::parse(&args)?;

    // --- Configuration ---
    let config = AuditConfig::from_env()?;
    tracing::info!(
        namespace = %config.namespace,
        pg_schema = %config.pg_schema,
        "Loaded audit configuration"
    );

    // --- Database ---
    let pool = idmap_db::create_pool(&config.database_url, config.max_connections)
        .await
        .context("Failed to connect to database")?;
    idmap_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    tracing::info!("Database health check passed");

    let id_map_config = config.id_map_config()?;
    let store = PgStore::new(pool, &id_map_config).with_pg_schema(&config.pg_schema)?;
    tracing::info!(table = %store.qualified_map_table_name(), "Auditing id map");
    let id_map = IdMap::new(id_map_config, store)?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    match command {
        Command::Summary => {
            let summary = id_map.aggregator().summary().await?;
            serde_json::to_writer_pretty(&mut out, &summary)?;
            writeln!(out)?;
        }
        Command::Messages(level) => {
            let filter = match level {
                Some(level) => MessageFilter::all().with_level(level),
                None => MessageFilter::all(),
            };
            let mut stream = id_map.read_all(filter)?;
            while let Some(message) = stream.next().await? {
                serde_json::to_writer(&mut out, &message)?;
                writeln!(out)?;
            }
        }
        Command::Rows => {
            let mut cursor = id_map.cursor().await?;
            while cursor.advance().await? {
                if let Some(row) = cursor.current()? {
                    serde_json::to_writer(&mut out, row)?;
                    writeln!(out)?;
                }
            }
        }
    }

    Ok(())
}
