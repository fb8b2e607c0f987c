pub mod sqlite;
pub mod repository;

pub use sqlite::*;
pub use repository::*;

use chrono::{NaiveDateTime, Timelike, Utc};
use thiserror::Error;

/// Storage format for every timestamp column. Millisecond precision, UTC,
/// lexically sortable.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid enum value for {field}: {value}")]
    InvalidEnum { field: String, value: String },

    #[error("Migration failed at version {version}: {reason}")]
    MigrationFailed { version: i64, reason: String },

    #[error("Constraint violated: {0}")]
    ConstraintViolation(String),

    #[error("Invalid {owner_kind} status transition: {from} -> {to}")]
    InvalidTransition {
        owner_kind: String,
        from: String,
        to: String,
    },

    #[error("Status event for {owner_id} reported at {reported} precedes active event at {active}")]
    OutOfOrder {
        owner_id: String,
        reported: String,
        active: String,
    },

    #[error("Controlled substance {treatment_id} cannot enter status {status}")]
    ControlledSubstance { treatment_id: String, status: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Current UTC time truncated to storage precision.
pub fn now() -> NaiveDateTime {
    normalize_timestamp(Utc::now().naive_utc())
}

/// Truncate to millisecond precision so in-memory values compare equal to
/// what a round trip through storage returns.
pub fn normalize_timestamp(ts: NaiveDateTime) -> NaiveDateTime {
    let millis = ts.nanosecond() / 1_000_000;
    ts.with_nanosecond(millis * 1_000_000).unwrap_or(ts)
}

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime, DatabaseError> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .map_err(|e| DatabaseError::ConstraintViolation(format!("bad timestamp {s:?}: {e}")))
}
