/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Monotonically increasing message sequence number (BIGSERIAL in PostgreSQL).
pub type SequenceNo = i64;
