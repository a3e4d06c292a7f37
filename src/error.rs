// ⚠️ Error Taxonomy - One error type for the whole reconciliation core
//
// Per-record failures (Validation, NotFound, Persistence, TransientProvider)
// are collected by the coordinator into the run report. Lifecycle and
// integrity failures are returned straight to the caller.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReconError>;

#[derive(Debug, Error)]
pub enum ReconError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {entity} {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("State conflict on {id}: expected {expected}, found {actual}")]
    StateConflict {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Integrity error at event {event_id}: expected {expected}, found {actual}")]
    Integrity {
        event_id: String,
        expected: String,
        actual: String,
    },

    #[error("Transient provider error: {0}")]
    TransientProvider(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReconError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        ReconError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Short machine-readable tag used in run reports and API payloads
    pub fn kind(&self) -> &'static str {
        match self {
            ReconError::Validation(_) => "validation",
            ReconError::NotFound { .. } => "not_found",
            ReconError::StateConflict { .. } => "state_conflict",
            ReconError::Integrity { .. } => "integrity",
            ReconError::TransientProvider(_) => "transient_provider",
            ReconError::Persistence(_) => "persistence",
            ReconError::Serialization(_) => "serialization",
            ReconError::Config(_) => "config",
            ReconError::Io(_) => "io",
        }
    }

    /// Whether a retry with backoff may succeed.
    ///
    /// A busy/locked SQLite database counts as transient: another writer holds
    /// the write lock and the record can be retried once it is released.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconError::TransientProvider(_) => true,
            ReconError::Persistence(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// True when the underlying SQLite error is a UNIQUE/constraint violation
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            ReconError::Persistence(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}

impl From<serde_json::Error> for ReconError {
    fn from(err: serde_json::Error) -> Self {
        ReconError::Serialization(err.to_string())
    }
}

impl From<csv::Error> for ReconError {
    fn from(err: csv::Error) -> Self {
        ReconError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(ReconError::TransientProvider("429 Too Many Requests".to_string()).is_retryable());
        assert!(!ReconError::Validation("bad amount".to_string()).is_retryable());
        assert!(!ReconError::not_found("exception", "exc_1").is_retryable());
    }

    #[test]
    fn test_busy_database_is_retryable() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(ReconError::from(busy).is_retryable());
    }

    #[test]
    fn test_error_kind_tags() {
        let conflict = ReconError::StateConflict {
            id: "exc_1".to_string(),
            expected: "open".to_string(),
            actual: "resolved".to_string(),
        };
        assert_eq!(conflict.kind(), "state_conflict");
        assert_eq!(
            conflict.to_string(),
            "State conflict on exc_1: expected open, found resolved"
        );
    }
}
