//! Audit record types shared by the engine and its read surface.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A row of a monitored table, keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Kind of row mutation captured by a change interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DmlType {
    /// Row was inserted.
    Insert,
    /// Row was updated.
    Update,
    /// Row was deleted.
    Delete,
}

impl DmlType {
    /// Returns the string representation for database storage.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for DmlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DmlType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(format!("unknown dml type {other:?}")),
        }
    }
}

/// Operations the audit tables refuse outside the archival gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GuardedOperation {
    Insert,
    Update,
    Delete,
    Truncate,
    Alter,
    Drop,
}

impl GuardedOperation {
    /// Returns the SQL verb for the operation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Truncate => "TRUNCATE",
            Self::Alter => "ALTER",
            Self::Drop => "DROP",
        }
    }
}

impl fmt::Display for GuardedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of a per-table audit log (`ZAL<table>`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// Position in the table's log; strictly increasing, never reused.
    pub id: i64,
    /// Row id of the mutated row in the monitored table.
    pub data_id: i64,
    /// Kind of mutation.
    pub dml_type: DmlType,
    /// Previous values: the full row for deletes, changed columns for updates.
    pub old_row_data: Option<Row>,
    /// New values: the full row for inserts, changed columns for updates.
    pub new_row_data: Option<Row>,
    /// Start time of the transaction that made the change.
    pub dml_timestamp: DateTime<Utc>,
    /// Acting user, or `-1` when none was supplied.
    pub dml_by: i64,
    /// Impersonating user, or `-1` when none was supplied.
    pub dml_as: i64,
    /// Correlation id shared by everything one logical action touched.
    pub dml_txid: Uuid,
    /// Opaque signature of the session that issued the change.
    pub session_sig: Option<String>,
    /// Interned reason for the change.
    pub descriptor_id: Option<i64>,
}

/// One row of the shared schema-change log (`ZALDDL`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DdlLogEntry {
    pub id: i64,
    /// Command, e.g. `CREATE TABLE`, `TRUNCATE` or `ARCHIVE DATA`.
    pub command_tag: String,
    /// Object type, e.g. `table` or `trigger`.
    pub object_type: String,
    pub schema_name: String,
    /// Qualified name of the affected object.
    pub object_identity: String,
    pub ddl_timestamp: DateTime<Utc>,
    pub ddl_by: i64,
    pub ddl_txid: Uuid,
    pub session_sig: Option<String>,
    pub descriptor_id: Option<i64>,
}

/// An interned reason string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub id: i64,
    pub text: String,
}

/// A column that is not, alone, significant enough to log an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    pub id: i64,
    /// Table the rule applies to; `None` applies it to every table.
    pub table_name: Option<String>,
    pub column_name: String,
}

impl FilterRule {
    /// Check whether the rule applies to the given table.
    #[must_use]
    pub fn applies_to(&self, table: &str) -> bool {
        self.table_name.as_deref().map_or(true, |name| name == table)
    }
}

/// Result of a provisioning request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionOutcome {
    /// At least one audit object was created.
    Provisioned,
    /// Every audit object already existed.
    AlreadyProvisioned,
}

/// Result of a deprovisioning request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeprovisionOutcome {
    /// The change interceptor was removed.
    Deprovisioned,
    /// The table had no change interceptor.
    NotProvisioned,
}
