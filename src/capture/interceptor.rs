//! Change interceptor: turns one row mutation into one audit log row.
//!
//! A [`ChangeInterceptor`] is the handler registered for a monitored table.
//! It is built from the table's audit object names and its filtered column
//! set, and runs inside the transaction that performs the mutation.

use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};

use crate::audit::{AuditResult, DmlType, Row};
use crate::capture::context::ResolvedContext;
use crate::capture::values::quote_ident;
use crate::provision::AuditTableNames;

/// Changed columns of an update with their before and after values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowDiff {
    pub changed: BTreeSet<String>,
    pub old: Row,
    pub new: Row,
}

impl RowDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }
}

/// Compare two images of the same row.
///
/// A column is changed when its JSON values differ; null against a value
/// counts as a change. Columns present on one side only are compared
/// against null.
#[must_use]
pub fn diff_rows(old: &Row, new: &Row) -> RowDiff {
    let mut diff = RowDiff::default();
    let null = serde_json::Value::Null;

    let columns: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    for column in columns {
        let before = old.get(column).unwrap_or(&null);
        let after = new.get(column).unwrap_or(&null);
        if before != after {
            diff.changed.insert(column.clone());
            diff.old.insert(column.clone(), before.clone());
            diff.new.insert(column.clone(), after.clone());
        }
    }
    diff
}

/// A log row waiting to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub dml_type: DmlType,
    pub old_row_data: Option<Row>,
    pub new_row_data: Option<Row>,
}

impl PendingEntry {
    #[must_use]
    pub fn insert(new: Row) -> Self {
        Self {
            dml_type: DmlType::Insert,
            old_row_data: None,
            new_row_data: Some(new),
        }
    }

    #[must_use]
    pub fn delete(old: Row) -> Self {
        Self {
            dml_type: DmlType::Delete,
            old_row_data: Some(old),
            new_row_data: None,
        }
    }

    /// Plan an update entry, or `None` when nothing significant changed.
    ///
    /// Once an update is significant the payload carries every changed
    /// column, filtered ones included.
    #[must_use]
    pub fn update(old: &Row, new: &Row, filtered: &BTreeSet<String>) -> Option<Self> {
        let diff = diff_rows(old, new);
        if !crate::registry::filter::has_significant_change(&diff.changed, filtered) {
            return None;
        }
        Some(Self {
            dml_type: DmlType::Update,
            old_row_data: Some(diff.old),
            new_row_data: Some(diff.new),
        })
    }
}

/// Format a timestamp the way log tables store it.
pub(crate) fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Handler registered for one monitored table.
#[derive(Debug, Clone)]
pub struct ChangeInterceptor {
    names: AuditTableNames,
    filtered: BTreeSet<String>,
}

impl ChangeInterceptor {
    #[must_use]
    pub fn new(names: AuditTableNames, filtered: BTreeSet<String>) -> Self {
        Self { names, filtered }
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.names.table
    }

    #[must_use]
    pub fn log_table(&self) -> &str {
        &self.names.log_table
    }

    #[must_use]
    pub fn filtered_columns(&self) -> &BTreeSet<String> {
        &self.filtered
    }

    /// Plan the entry for an update, applying the table's filter set.
    #[must_use]
    pub fn plan_update(&self, old: &Row, new: &Row) -> Option<PendingEntry> {
        PendingEntry::update(old, new, &self.filtered)
    }

    /// Append one entry to the table's log. Returns the log row id.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized or the insert
    /// fails; either way the surrounding transaction must not commit.
    pub fn append(
        &self,
        conn: &Connection,
        data_id: i64,
        entry: &PendingEntry,
        context: &ResolvedContext,
        at: &DateTime<Utc>,
    ) -> AuditResult<i64> {
        let old = entry
            .old_row_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let new = entry
            .new_row_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let sql = format!(
            "INSERT INTO {} (data_id, dml_type, old_row_data, new_row_data, dml_timestamp,
                             dml_by, dml_as, dml_txid, session_sig, descriptor_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            quote_ident(&self.names.log_table)
        );
        conn.prepare_cached(&sql)?.execute(params![
            data_id,
            entry.dml_type.as_str(),
            old,
            new,
            format_timestamp(at),
            context.actor_id,
            context.impersonator_id,
            context.transaction_id.to_string(),
            context.session_sig,
            context.descriptor_id,
        ])?;
        let id = conn.last_insert_rowid();

        tracing::debug!(
            table = %self.names.table,
            data_id,
            dml_type = %entry.dml_type,
            txid = %context.transaction_id,
            "Captured row change"
        );
        Ok(id)
    }
}
