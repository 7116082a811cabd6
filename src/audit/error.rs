//! Audit error types.

use std::path::PathBuf;

use super::types::GuardedOperation;

/// Errors that can occur during audit operations.
#[derive(thiserror::Error, Debug)]
pub enum AuditError {
    /// Failed to open or create database.
    #[error("Failed to open database at {path}: {source}")]
    DatabaseOpen {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Failed to execute SQL.
    #[error("Database query failed: {0}")]
    Query(#[from] rusqlite::Error),

    /// Failed to serialize data to JSON.
    #[error("JSON serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Blocking task was cancelled.
    #[error("Blocking task cancelled")]
    TaskCancelled,

    /// Failed to create parent directory.
    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An audit table refused a modification.
    #[error("{operation} on {table} is not supported to maintain audit log integrity")]
    GuardViolation {
        table: String,
        operation: GuardedOperation,
    },

    /// The named table does not exist.
    #[error("Table not found: {0}")]
    UnknownTable(String),

    /// The named table belongs to the audit engine and cannot be monitored.
    #[error("Table cannot be audited: {0}")]
    NotAuditable(String),

    /// The identifier cannot be used as a table or column name.
    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    /// The row payload is not usable for the requested write.
    #[error("Invalid row: {0}")]
    InvalidRow(String),

    /// An earlier statement failed, so the transaction can only roll back.
    #[error("Transaction aborted by an earlier failure; it can only be rolled back")]
    TransactionAborted,

    /// A stored value could not be decoded.
    #[error("Failed to decode {what}: {reason}")]
    Decode { what: &'static str, reason: String },

    /// An exclusion pattern failed to compile.
    #[error("Invalid table exclusion pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// A schema-change batch also changed rows.
    #[error("DDL batch changed {0} rows; data changes must go through the audited write API")]
    DataChangeInDdl(u64),

    /// The native transaction counter could not be turned into a UUID.
    #[error("Invalid transaction id: {0}")]
    InvalidTransactionId(String),
}

impl AuditError {
    /// Create a guard violation for an audit table.
    pub fn guard(table: impl Into<String>, operation: GuardedOperation) -> Self {
        Self::GuardViolation {
            table: table.into(),
            operation,
        }
    }

    /// Check if this is a guard violation.
    #[must_use]
    pub fn is_guard_violation(&self) -> bool {
        matches!(self, Self::GuardViolation { .. })
    }
}

/// Result type alias for audit operations.
pub type AuditResult<T> = Result<T, AuditError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_open_display() {
        let err = AuditError::DatabaseOpen {
            path: PathBuf::from("/tmp/trail.db"),
            source: rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(1),
                Some("test".to_string()),
            ),
        };
        assert!(err.to_string().contains("Failed to open database"));
        assert!(err.to_string().contains("/tmp/trail.db"));
    }

    #[test]
    fn test_task_cancelled_display() {
        let err = AuditError::TaskCancelled;
        assert_eq!(err.to_string(), "Blocking task cancelled");
    }

    #[test]
    fn test_guard_violation_display() {
        let err = AuditError::guard("ZALWidget", GuardedOperation::Update);
        assert_eq!(
            err.to_string(),
            "UPDATE on ZALWidget is not supported to maintain audit log integrity"
        );
        assert!(err.is_guard_violation());
    }

    #[test]
    fn test_data_change_in_ddl_display() {
        let err = AuditError::DataChangeInDdl(2);
        assert!(err.to_string().starts_with("DDL batch changed 2 rows"));
        assert!(!err.is_guard_violation());
    }

    #[test]
    fn test_create_dir_display() {
        let err = AuditError::CreateDir {
            path: PathBuf::from("/root/trail"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.to_string().contains("Failed to create directory"));
        assert!(err.to_string().contains("/root/trail"));
    }

    #[test]
    fn test_transaction_aborted_is_not_guard() {
        assert!(!AuditError::TransactionAborted.is_guard_violation());
    }
}
