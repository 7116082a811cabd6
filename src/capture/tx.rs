//! Audited transactions: the data-access layer every write flows through.
//!
//! An [`AuditedTx`] wraps one `BEGIN IMMEDIATE` SQLite transaction together
//! with the [`ActionContext`] of the action it performs. Writes to monitored
//! tables run their change interceptor before returning, so the data change
//! and its log row commit or roll back together.
//!
//! Any failure poisons the transaction: later operations and `commit`
//! return [`AuditError::TransactionAborted`], and dropping the value rolls
//! everything back.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, Transaction};
use uuid::Uuid;

use crate::audit::schema::{ARCHIVE_AUDIT_LOG, DDL_LOG_TABLE};
use crate::audit::{AuditError, AuditResult, FilterRule, GuardedOperation, Row};
use crate::capture::context::{ActionContext, ResolvedContext};
use crate::capture::gate::{GateKind, Gates};
use crate::capture::interceptor::{format_timestamp, ChangeInterceptor, PendingEntry};
use crate::capture::policy::AuditPolicy;
use crate::capture::values::{
    catalog_table_name, fetch_row, matching_rowids, quote_ident, sql_from_json, table_exists,
    validate_identifier,
};
use crate::provision::guard::check_data_write;
use crate::provision::naming::is_audit_log;
use crate::provision::{self, AuditTableNames};
use crate::registry::{descriptor, filter};

/// Command tag and object type recorded for archival deletes.
const ARCHIVE_COMMAND: &str = "ARCHIVE DATA";
const ARCHIVE_OBJECT_TYPE: &str = "AUDIT LOG TABLE";

/// One engine transaction bound to one action context.
pub struct AuditedTx<'conn> {
    pub(crate) tx: Transaction<'conn>,
    pub(crate) policy: &'conn AuditPolicy,
    context: ActionContext,
    resolved: Option<ResolvedContext>,
    started_at: DateTime<Utc>,
    interceptors: HashMap<String, Option<ChangeInterceptor>>,
    gates: Arc<Gates>,
    aborted: bool,
}

impl<'conn> AuditedTx<'conn> {
    /// Begin an immediate transaction on the connection.
    ///
    /// Registers a fresh set of closed gates on the connection, so gates
    /// left by an earlier transaction never carry over.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite cannot start the transaction, for example
    /// when another writer holds the lock past the busy timeout.
    pub fn begin(
        conn: &'conn mut Connection,
        policy: &'conn AuditPolicy,
        context: ActionContext,
    ) -> AuditResult<Self> {
        let gates = Gates::install(conn)?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        Ok(Self {
            tx,
            policy,
            context,
            resolved: None,
            started_at: Utc::now(),
            interceptors: HashMap::new(),
            gates,
            aborted: false,
        })
    }

    /// The context this transaction was started with.
    #[must_use]
    pub fn context(&self) -> &ActionContext {
        &self.context
    }

    /// Start time shared by every log row this transaction writes.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// The underlying connection.
    ///
    /// Statements issued here bypass the change interceptors. Their writes
    /// to monitored tables, audit logs and the descriptor and filter
    /// registries are refused by triggers, and no statement can open a gate.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.tx
    }

    /// Correlation id of this transaction, resolving the context if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the context cannot be resolved.
    pub fn transaction_id(&mut self) -> AuditResult<Uuid> {
        self.ensure_active()?;
        let result = self.resolved_context().map(|ctx| ctx.transaction_id);
        self.track(result)
    }

    /// Commit the transaction.
    ///
    /// # Errors
    ///
    /// Returns `AuditError::TransactionAborted` (after rolling back) if an
    /// earlier operation failed, or the commit error itself.
    pub fn commit(self) -> AuditResult<()> {
        if self.aborted {
            tracing::warn!("Refusing to commit an aborted transaction; rolling back");
            self.tx.rollback()?;
            return Err(AuditError::TransactionAborted);
        }
        self.tx.commit()?;
        Ok(())
    }

    /// Roll back the transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite fails to roll back.
    pub fn rollback(self) -> AuditResult<()> {
        self.tx.rollback()?;
        Ok(())
    }

    /// Insert a row and return its rowid.
    ///
    /// # Errors
    ///
    /// Returns an error if the table is an engine table, the write fails, or
    /// the change cannot be logged.
    pub fn insert(&mut self, table: &str, row: &Row) -> AuditResult<i64> {
        self.ensure_active()?;
        let result = self.catalog_name(table).and_then(|table| self.insert_row(&table, row));
        self.track(result)
    }

    /// Update one row by rowid. Returns `false` if the row does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the table is an engine table, `changes` is empty,
    /// the write fails, or the change cannot be logged.
    pub fn update(&mut self, table: &str, rowid: i64, changes: &Row) -> AuditResult<bool> {
        self.ensure_active()?;
        let result = self
            .catalog_name(table)
            .and_then(|table| self.update_row(&table, rowid, changes));
        self.track(result)
    }

    /// Update every row matching an equality filter. Returns the count.
    ///
    /// # Errors
    ///
    /// Same as [`AuditedTx::update`].
    pub fn update_where(&mut self, table: &str, filter: &Row, changes: &Row) -> AuditResult<usize> {
        self.ensure_active()?;
        let result = self
            .catalog_name(table)
            .and_then(|table| self.update_matching(&table, filter, changes));
        self.track(result)
    }

    /// Delete one row by rowid. Returns `false` if the row does not exist.
    ///
    /// On an audit log table this is an archival delete of one entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete is refused, fails, or cannot be logged.
    pub fn delete(&mut self, table: &str, rowid: i64) -> AuditResult<bool> {
        self.ensure_active()?;
        let result = self.catalog_name(table).and_then(|table| {
            if is_audit_log(&table) {
                self.archive_entries(&table, ArchiveSelection::Range(rowid..=rowid))
                    .map(|count| count > 0)
            } else {
                self.delete_row(&table, rowid)
            }
        });
        self.track(result)
    }

    /// Delete every row matching an equality filter. Returns the count.
    ///
    /// # Errors
    ///
    /// Same as [`AuditedTx::delete`].
    pub fn delete_where(&mut self, table: &str, filter: &Row) -> AuditResult<usize> {
        self.ensure_active()?;
        let result = self.catalog_name(table).and_then(|table| {
            if is_audit_log(&table) {
                self.archive_entries(&table, ArchiveSelection::Filter(filter))
            } else {
                self.delete_matching(&table, filter)
            }
        });
        self.track(result)
    }

    /// Remove every row of a table.
    ///
    /// Truncating a monitored table writes no per-row entries; one
    /// `TRUNCATE` entry goes to the DDL log instead.
    ///
    /// # Errors
    ///
    /// Returns a guard violation for engine tables, or the write error.
    pub fn truncate(&mut self, table: &str) -> AuditResult<usize> {
        self.ensure_active()?;
        let result = self.catalog_name(table).and_then(|table| self.truncate_table(&table));
        self.track(result)
    }

    /// Delete a range of entries from an audit log table.
    ///
    /// Only permitted when the context descriptor is `ARCHIVE AUDIT LOG`.
    /// Writes one `ARCHIVE DATA` entry to the DDL log when rows were removed.
    ///
    /// # Errors
    ///
    /// Returns a guard violation without the archival descriptor, or
    /// `AuditError::UnknownTable` if the log table does not exist.
    pub fn archive(&mut self, log_table: &str, ids: RangeInclusive<i64>) -> AuditResult<usize> {
        self.ensure_active()?;
        let result = self
            .catalog_name(log_table)
            .and_then(|table| self.archive_entries(&table, ArchiveSelection::Range(ids)));
        self.track(result)
    }

    /// Read one row by rowid.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn fetch(&mut self, table: &str, rowid: i64) -> AuditResult<Option<Row>> {
        self.ensure_active()?;
        let result = self
            .catalog_name(table)
            .and_then(|table| fetch_row(&self.tx, &table, rowid));
        self.track(result)
    }

    /// Add a significance filter rule within this transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if a name is invalid or the insert fails.
    pub fn add_filter_rule(&mut self, table: Option<&str>, column: &str) -> AuditResult<FilterRule> {
        self.ensure_active()?;
        let result = filter::add_rule(&self.tx, table, column);
        self.interceptors.clear();
        self.track(result)
    }

    /// Resolve descriptor text to its id, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor cannot be stored.
    pub fn resolve_descriptor(&mut self, text: &str) -> AuditResult<Option<i64>> {
        self.ensure_active()?;
        let result = descriptor::resolve(&self.tx, Some(text));
        self.track(result)
    }

    /// A table name as spelled in the catalog.
    ///
    /// Names of missing tables come back unchanged so the write reports
    /// the SQLite error.
    fn catalog_name(&self, table: &str) -> AuditResult<String> {
        validate_identifier(table)?;
        Ok(catalog_table_name(&self.tx, table)?.unwrap_or_else(|| table.to_string()))
    }

    pub(crate) fn ensure_active(&self) -> AuditResult<()> {
        if self.aborted {
            return Err(AuditError::TransactionAborted);
        }
        Ok(())
    }

    /// Poison the transaction if the operation failed.
    pub(crate) fn track<T>(&mut self, result: AuditResult<T>) -> AuditResult<T> {
        if let Err(e) = &result {
            if e.is_guard_violation() {
                tracing::warn!(error = %e, "Audit guard refused operation");
            } else {
                tracing::debug!(error = %e, "Audited transaction aborted");
            }
            self.aborted = true;
        }
        result
    }

    /// Context values, resolved on first use.
    pub(crate) fn resolved_context(&mut self) -> AuditResult<ResolvedContext> {
        if let Some(resolved) = &self.resolved {
            return Ok(resolved.clone());
        }
        let resolved = ResolvedContext::resolve(&self.tx, &self.context)?;
        self.resolved = Some(resolved.clone());
        Ok(resolved)
    }

    /// Handler registered for a table, if it is monitored.
    pub(crate) fn interceptor_for(&mut self, table: &str) -> AuditResult<Option<ChangeInterceptor>> {
        if let Some(cached) = self.interceptors.get(table) {
            return Ok(cached.clone());
        }
        let handler = if provision::is_monitored(&self.tx, table)? {
            Some(ChangeInterceptor::new(
                AuditTableNames::for_table(table),
                filter::filtered_columns(&self.tx, table)?,
            ))
        } else {
            None
        };
        self.interceptors.insert(table.to_string(), handler.clone());
        Ok(handler)
    }

    /// Forget registered handlers after the catalog changed.
    pub(crate) fn invalidate_interceptors(&mut self) {
        self.interceptors.clear();
    }

    /// Run `f` with one gate open.
    pub(crate) fn with_gate<T>(
        &self,
        kind: GateKind,
        f: impl FnOnce(&Connection) -> AuditResult<T>,
    ) -> AuditResult<T> {
        let _open = self.gates.open(kind);
        f(&self.tx)
    }

    fn append_entry(
        &self,
        interceptor: &ChangeInterceptor,
        data_id: i64,
        entry: &PendingEntry,
        context: &ResolvedContext,
    ) -> AuditResult<i64> {
        self.with_gate(GateKind::Log, |conn| {
            interceptor.append(conn, data_id, entry, context, &self.started_at)
        })
    }

    /// Append one entry to the shared DDL log.
    pub(crate) fn log_ddl(
        &mut self,
        command_tag: &str,
        object_type: &str,
        object_identity: &str,
    ) -> AuditResult<i64> {
        let context = self.resolved_context()?;
        let sql = format!(
            "INSERT INTO {} (command_tag, object_type, schema_name, object_identity,
                             ddl_timestamp, ddl_by, ddl_txid, session_sig, descriptor_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            quote_ident(DDL_LOG_TABLE)
        );
        let id = self.with_gate(GateKind::Log, |conn| {
            conn.prepare_cached(&sql)?.execute(params![
                command_tag,
                object_type,
                self.policy.schema_name(),
                object_identity,
                format_timestamp(&self.started_at),
                context.actor_id,
                context.transaction_id.to_string(),
                context.session_sig,
                context.descriptor_id,
            ])?;
            Ok(conn.last_insert_rowid())
        })?;

        tracing::info!(
            command_tag,
            object_type,
            object_identity,
            txid = %context.transaction_id,
            "Logged schema change"
        );
        Ok(id)
    }

    /// Qualified identity of a table in the DDL log.
    pub(crate) fn table_identity(&self, table: &str) -> String {
        format!("{}.{table}", self.policy.schema_name())
    }

    fn insert_row(&mut self, table: &str, row: &Row) -> AuditResult<i64> {
        check_data_write(table, GuardedOperation::Insert)?;
        let interceptor = self.interceptor_for(table)?;

        let table_sql = quote_ident(table);
        let (sql, values) = if row.is_empty() {
            (format!("INSERT INTO {table_sql} DEFAULT VALUES"), Vec::new())
        } else {
            let mut columns = Vec::with_capacity(row.len());
            let mut placeholders = Vec::with_capacity(row.len());
            let mut values = Vec::with_capacity(row.len());
            for (idx, (column, value)) in row.iter().enumerate() {
                validate_identifier(column)?;
                columns.push(quote_ident(column));
                placeholders.push(format!("?{}", idx + 1));
                values.push(sql_from_json(value));
            }
            (
                format!(
                    "INSERT INTO {table_sql} ({}) VALUES ({})",
                    columns.join(", "),
                    placeholders.join(", ")
                ),
                values,
            )
        };

        let Some(interceptor) = interceptor else {
            self.tx.execute(&sql, params_from_iter(values.iter()))?;
            return Ok(self.tx.last_insert_rowid());
        };

        let rowid = self.with_gate(GateKind::Write, |conn| {
            conn.execute(&sql, params_from_iter(values.iter()))?;
            Ok(conn.last_insert_rowid())
        })?;
        let stored = fetch_row(&self.tx, table, rowid)?.ok_or_else(|| {
            AuditError::InvalidRow(format!("inserted row {rowid} of {table} is not readable by rowid"))
        })?;
        let context = self.resolved_context()?;
        self.append_entry(&interceptor, rowid, &PendingEntry::insert(stored), &context)?;
        Ok(rowid)
    }

    fn update_row(&mut self, table: &str, rowid: i64, changes: &Row) -> AuditResult<bool> {
        check_data_write(table, GuardedOperation::Update)?;
        if changes.is_empty() {
            return Err(AuditError::InvalidRow("update has no columns".to_string()));
        }
        let interceptor = self.interceptor_for(table)?;

        let Some(old) = fetch_row(&self.tx, table, rowid)? else {
            return Ok(false);
        };

        let mut assignments = Vec::with_capacity(changes.len());
        let mut values: Vec<SqlValue> = Vec::with_capacity(changes.len() + 1);
        for (column, value) in changes {
            validate_identifier(column)?;
            values.push(sql_from_json(value));
            assignments.push(format!("{} = ?{}", quote_ident(column), values.len()));
        }
        values.push(SqlValue::Integer(rowid));
        let sql = format!(
            "UPDATE {} SET {} WHERE rowid = ?{} RETURNING rowid",
            quote_ident(table),
            assignments.join(", "),
            values.len()
        );
        let run = |conn: &Connection| -> AuditResult<i64> {
            let new_rowid = conn.query_row(&sql, params_from_iter(values.iter()), |r| r.get(0))?;
            Ok(new_rowid)
        };

        let Some(interceptor) = interceptor else {
            run(&*self.tx)?;
            return Ok(true);
        };

        let new_rowid = self.with_gate(GateKind::Write, run)?;
        let new = fetch_row(&self.tx, table, new_rowid)?.ok_or_else(|| {
            AuditError::InvalidRow(format!("updated row {new_rowid} of {table} is not readable by rowid"))
        })?;

        match interceptor.plan_update(&old, &new) {
            Some(entry) => {
                let context = self.resolved_context()?;
                self.append_entry(&interceptor, new_rowid, &entry, &context)?;
            }
            None => {
                tracing::debug!(
                    table = %table,
                    data_id = new_rowid,
                    "Skipped update with no significant change"
                );
            }
        }
        Ok(true)
    }

    fn update_matching(&mut self, table: &str, filter: &Row, changes: &Row) -> AuditResult<usize> {
        check_data_write(table, GuardedOperation::Update)?;
        let mut count = 0;
        for rowid in matching_rowids(&self.tx, table, filter)? {
            if self.update_row(table, rowid, changes)? {
                count += 1;
            }
        }
        Ok(count)
    }

    fn delete_row(&mut self, table: &str, rowid: i64) -> AuditResult<bool> {
        check_data_write(table, GuardedOperation::Delete)?;
        let interceptor = self.interceptor_for(table)?;
        let sql = format!("DELETE FROM {} WHERE rowid = ?1", quote_ident(table));

        let Some(interceptor) = interceptor else {
            return Ok(self.tx.execute(&sql, params![rowid])? > 0);
        };

        let Some(old) = fetch_row(&self.tx, table, rowid)? else {
            return Ok(false);
        };
        self.with_gate(GateKind::Write, |conn| Ok(conn.execute(&sql, params![rowid])?))?;
        let context = self.resolved_context()?;
        self.append_entry(&interceptor, rowid, &PendingEntry::delete(old), &context)?;
        Ok(true)
    }

    fn delete_matching(&mut self, table: &str, filter: &Row) -> AuditResult<usize> {
        check_data_write(table, GuardedOperation::Delete)?;
        let mut count = 0;
        for rowid in matching_rowids(&self.tx, table, filter)? {
            if self.delete_row(table, rowid)? {
                count += 1;
            }
        }
        Ok(count)
    }

    fn truncate_table(&mut self, table: &str) -> AuditResult<usize> {
        check_data_write(table, GuardedOperation::Truncate)?;
        if !table_exists(&self.tx, table)? {
            return Err(AuditError::UnknownTable(table.to_string()));
        }
        let sql = format!("DELETE FROM {}", quote_ident(table));

        if self.interceptor_for(table)?.is_none() {
            return Ok(self.tx.execute(&sql, [])?);
        }

        let removed = self.with_gate(GateKind::Write, |conn| Ok(conn.execute(&sql, [])?))?;
        let identity = self.table_identity(table);
        self.log_ddl("TRUNCATE", "table", &identity)?;
        tracing::info!(table = %table, rows = removed, "Truncated monitored table");
        Ok(removed)
    }

    fn archive_entries(&mut self, log_table: &str, selection: ArchiveSelection<'_>) -> AuditResult<usize> {
        validate_identifier(log_table)?;
        if !is_audit_log(log_table) || !table_exists(&self.tx, log_table)? {
            return Err(AuditError::UnknownTable(log_table.to_string()));
        }
        if !self.is_archival()? {
            return Err(AuditError::guard(log_table, GuardedOperation::Delete));
        }

        let log = quote_ident(log_table);
        let removed = match selection {
            ArchiveSelection::Range(ids) => {
                let sql = format!("DELETE FROM {log} WHERE id BETWEEN ?1 AND ?2");
                self.with_gate(GateKind::Archive, |conn| {
                    Ok(conn.execute(&sql, params![ids.start(), ids.end()])?)
                })?
            }
            ArchiveSelection::Filter(filter) => {
                let ids = matching_rowids(&self.tx, log_table, filter)?;
                let sql = format!("DELETE FROM {log} WHERE rowid = ?1");
                self.with_gate(GateKind::Archive, |conn| {
                    let mut removed = 0;
                    for id in ids {
                        removed += conn.execute(&sql, params![id])?;
                    }
                    Ok(removed)
                })?
            }
        };

        if removed > 0 {
            let identity = self.table_identity(log_table);
            self.log_ddl(ARCHIVE_COMMAND, ARCHIVE_OBJECT_TYPE, &identity)?;
        }
        tracing::info!(table = %log_table, rows = removed, "Archived audit log entries");
        Ok(removed)
    }

    /// Whether the context descriptor is the reserved archival descriptor.
    fn is_archival(&mut self) -> AuditResult<bool> {
        let context = self.resolved_context()?;
        let Some(descriptor_id) = context.descriptor_id else {
            return Ok(false);
        };
        Ok(descriptor::lookup(&self.tx, ARCHIVE_AUDIT_LOG)? == Some(descriptor_id))
    }
}

/// Which log entries an archival delete removes.
enum ArchiveSelection<'a> {
    Range(RangeInclusive<i64>),
    Filter(&'a Row),
}
