//! The audited store: an SQLite database with the audit engine installed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, TransactionBehavior};
use uuid::Uuid;

use super::error::{AuditError, AuditResult};
use super::query;
use super::schema::{ARCHIVE_AUDIT_LOG, DDL_LOG_TABLE, PRAGMAS, SCHEMA};
use super::types::{AuditLogEntry, DdlLogEntry, Descriptor, DeprovisionOutcome, FilterRule, ProvisionOutcome};
use crate::capture::gate::Gates;
use crate::capture::{ActionContext, AuditPolicy, AuditedTx};
use crate::config::TrailConfig;
use crate::ddl::SchemaChange;
use crate::provision::{self, GuardNames};
use crate::registry::{descriptor, filter};

/// Returns the default path for the audit database.
///
/// This is `~/.local/share/rowtrail/audit.db` on Unix systems.
#[must_use]
pub fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rowtrail")
        .join("audit.db")
}

/// A database connection with the audit engine bootstrapped.
///
/// All audited writes go through [`Store::begin`] or [`Store::run`].
#[derive(Debug)]
pub struct Store {
    conn: Connection,
    policy: AuditPolicy,
    path: Option<PathBuf>,
}

impl Store {
    /// Open a store at the specified path with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or bootstrapped.
    pub fn open(path: impl AsRef<Path>) -> AuditResult<Self> {
        Self::open_with_config(path, &TrailConfig::default())
    }

    /// Open the store named by a configuration.
    ///
    /// Uses [`default_database_path`] when the configuration names none.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or bootstrapped.
    pub fn from_config(config: &TrailConfig) -> AuditResult<Self> {
        let path = config
            .database
            .path
            .clone()
            .unwrap_or_else(default_database_path);
        Self::open_with_config(path, config)
    }

    /// Open a store at the specified path.
    ///
    /// Creates parent directories if they don't exist, installs the engine
    /// schema and, when configured, provisions every existing user table.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or bootstrapped.
    pub fn open_with_config(path: impl AsRef<Path>, config: &TrailConfig) -> AuditResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| AuditError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let conn = Connection::open(&path).map_err(|source| AuditError::DatabaseOpen {
            path: path.clone(),
            source,
        })?;
        Self::bootstrap(conn, Some(path), config)
    }

    /// Open an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub fn open_in_memory() -> AuditResult<Self> {
        Self::open_in_memory_with_config(&TrailConfig::default())
    }

    /// Open an in-memory store with explicit settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub fn open_in_memory_with_config(config: &TrailConfig) -> AuditResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::bootstrap(conn, None, config)
    }

    fn bootstrap(mut conn: Connection, path: Option<PathBuf>, config: &TrailConfig) -> AuditResult<Self> {
        let policy = AuditPolicy::from_settings(&config.audit)?;
        conn.busy_timeout(Duration::from_millis(config.database.busy_timeout_ms))?;
        conn.execute_batch(PRAGMAS)?;
        Gates::install(&conn)?;

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(SCHEMA)?;
        tx.execute_batch(&GuardNames::for_log_table(DDL_LOG_TABLE).create_sql())?;
        descriptor::resolve(&tx, Some(ARCHIVE_AUDIT_LOG))?;
        for column in &config.audit.global_filters {
            filter::add_rule(&tx, None, column)?;
        }
        for (table, columns) in &config.audit.table_filters {
            for column in columns {
                filter::add_rule(&tx, Some(table), column)?;
            }
        }
        tx.commit()?;

        let mut store = Self { conn, policy, path };
        if config.audit.backfill_on_open {
            let provisioned = store.run(ActionContext::migration(), |tx| tx.provision_all())?;
            if !provisioned.is_empty() {
                tracing::info!(tables = ?provisioned, "Provisioned existing tables");
            }
        }

        tracing::debug!(path = ?store.path, "Opened audited store");
        Ok(store)
    }

    /// Returns the path to the database, if opened from a file.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn policy(&self) -> &AuditPolicy {
        &self.policy
    }

    /// The underlying connection.
    ///
    /// Statements issued here are not audited. The engine's triggers refuse
    /// their writes to monitored tables, audit logs and the descriptor and
    /// filter registries, and SQL has no way to open a gate.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Begin an audited transaction for one action.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction cannot start.
    pub fn begin(&mut self, context: ActionContext) -> AuditResult<AuditedTx<'_>> {
        AuditedTx::begin(&mut self.conn, &self.policy, context)
    }

    /// Run `f` in an audited transaction, committing on success and rolling
    /// back on error.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`, or from beginning or committing.
    pub fn run<T, F>(&mut self, context: ActionContext, f: F) -> AuditResult<T>
    where
        F: FnOnce(&mut AuditedTx<'_>) -> AuditResult<T>,
    {
        let mut tx = self.begin(context)?;
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                tx.rollback()?;
                Err(e)
            }
        }
    }

    /// Provision a table under the migration context.
    ///
    /// # Errors
    ///
    /// See [`AuditedTx::provision`].
    pub fn provision(&mut self, table: &str) -> AuditResult<ProvisionOutcome> {
        self.run(ActionContext::migration(), |tx| tx.provision(table))
    }

    /// Deprovision a table under the migration context.
    ///
    /// # Errors
    ///
    /// See [`AuditedTx::deprovision`].
    pub fn deprovision(&mut self, table: &str) -> AuditResult<DeprovisionOutcome> {
        self.run(ActionContext::migration(), |tx| tx.deprovision(table))
    }

    /// Execute a DDL batch in its own audited transaction.
    ///
    /// # Errors
    ///
    /// See [`AuditedTx::execute_ddl`].
    pub fn execute_ddl(&mut self, context: ActionContext, sql: &str) -> AuditResult<Vec<SchemaChange>> {
        self.run(context, |tx| tx.execute_ddl(sql))
    }

    /// Add a significance filter rule.
    ///
    /// # Errors
    ///
    /// Returns an error if a name is invalid or the insert fails.
    pub fn add_filter_rule(&self, table: Option<&str>, column: &str) -> AuditResult<FilterRule> {
        filter::add_rule(&self.conn, table, column)
    }

    /// All filter rules.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn filter_rules(&self) -> AuditResult<Vec<FilterRule>> {
        filter::rules(&self.conn)
    }

    /// Text of a descriptor id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn descriptor_text(&self, id: i64) -> AuditResult<Option<String>> {
        descriptor::text_of(&self.conn, id)
    }

    /// All descriptors.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn descriptors(&self) -> AuditResult<Vec<Descriptor>> {
        descriptor::all(&self.conn)
    }

    /// Tables with an attached change interceptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be read.
    pub fn monitored_tables(&self) -> AuditResult<Vec<String>> {
        provision::monitored_tables(&self.conn)
    }

    /// A table's audit log.
    ///
    /// # Errors
    ///
    /// See [`query::audit_log`].
    pub fn audit_log(&self, table: &str) -> AuditResult<Vec<AuditLogEntry>> {
        query::audit_log(&self.conn, table)
    }

    /// A table's audit log entries for one correlation id.
    ///
    /// # Errors
    ///
    /// See [`query::audit_log_for_transaction`].
    pub fn audit_log_for_transaction(&self, table: &str, txid: Uuid) -> AuditResult<Vec<AuditLogEntry>> {
        query::audit_log_for_transaction(&self.conn, table, txid)
    }

    /// Number of entries in a table's audit log.
    ///
    /// # Errors
    ///
    /// See [`query::count_entries`].
    pub fn count_entries(&self, table: &str) -> AuditResult<u64> {
        query::count_entries(&self.conn, table)
    }

    /// The schema-change log.
    ///
    /// # Errors
    ///
    /// See [`query::ddl_log`].
    pub fn ddl_log(&self) -> AuditResult<Vec<DdlLogEntry>> {
        query::ddl_log(&self.conn)
    }

    /// Schema-change entries for one correlation id.
    ///
    /// # Errors
    ///
    /// See [`query::ddl_log_for_transaction`].
    pub fn ddl_log_for_transaction(&self, txid: Uuid) -> AuditResult<Vec<DdlLogEntry>> {
        query::ddl_log_for_transaction(&self.conn, txid)
    }
}
