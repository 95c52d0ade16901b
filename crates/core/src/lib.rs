//! Domain types for the migration id-map ledger.
//!
//! Everything in this crate is storage agnostic: key tuples and their
//! codec, key schemas, the status/rollback/severity enums, configuration
//! values, and the row/message records that backends persist.

pub mod config;
pub mod error;
pub mod hashing;
pub mod key;
pub mod record;
pub mod schema;
pub mod status;
pub mod types;
