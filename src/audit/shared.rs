//! Async access to an audited store with `SQLite` work on blocking threads.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use super::error::{AuditError, AuditResult};
use super::store::Store;
use super::types::{AuditLogEntry, DdlLogEntry, DeprovisionOutcome, ProvisionOutcome};
use crate::capture::{ActionContext, AuditedTx};
use crate::config::TrailConfig;

/// A [`Store`] shared between tasks.
///
/// One engine transaction runs at a time; each runs on the blocking pool via
/// `spawn_blocking`.
#[derive(Debug, Clone)]
pub struct SharedStore {
    store: Arc<Mutex<Store>>,
    path: Option<PathBuf>,
}

impl SharedStore {
    /// Wrap an open store.
    #[must_use]
    pub fn new(store: Store) -> Self {
        let path = store.path().map(Path::to_path_buf);
        Self {
            store: Arc::new(Mutex::new(store)),
            path,
        }
    }

    /// Open a store at the specified path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or bootstrapped.
    pub async fn open(path: impl AsRef<Path>, config: TrailConfig) -> AuditResult<Self> {
        let path = path.as_ref().to_path_buf();

        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent).await.map_err(|source| {
                    AuditError::CreateDir {
                        path: parent.to_path_buf(),
                        source,
                    }
                })?;
            }
        }

        let store = tokio::task::spawn_blocking(move || Store::open_with_config(&path, &config))
            .await
            .map_err(|_| AuditError::TaskCancelled)??;
        Ok(Self::new(store))
    }

    /// Open an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub async fn open_in_memory() -> AuditResult<Self> {
        let store = tokio::task::spawn_blocking(Store::open_in_memory)
            .await
            .map_err(|_| AuditError::TaskCancelled)??;
        Ok(Self::new(store))
    }

    /// Returns the path to the database, if opened from a file.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` in an audited transaction on the blocking pool.
    ///
    /// Commits when `f` succeeds and rolls back when it fails.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`, from the transaction itself, or
    /// `AuditError::TaskCancelled` if the blocking task was cancelled.
    pub async fn transaction<T, F>(&self, context: ActionContext, f: F) -> AuditResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut AuditedTx<'_>) -> AuditResult<T> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> AuditResult<T> {
            let mut store = store.blocking_lock();
            store.run(context, f)
        })
        .await
        .map_err(|_| AuditError::TaskCancelled)?
    }

    /// Run `f` with shared access to the store, for reads.
    ///
    /// # Errors
    ///
    /// Returns the error from `f` or `AuditError::TaskCancelled`.
    pub async fn read<T, F>(&self, f: F) -> AuditResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Store) -> AuditResult<T> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> AuditResult<T> {
            let store = store.blocking_lock();
            f(&store)
        })
        .await
        .map_err(|_| AuditError::TaskCancelled)?
    }

    /// Provision a table under the migration context.
    ///
    /// # Errors
    ///
    /// See [`AuditedTx::provision`].
    pub async fn provision(&self, table: impl Into<String>) -> AuditResult<ProvisionOutcome> {
        let table = table.into();
        self.transaction(ActionContext::migration(), move |tx| tx.provision(&table))
            .await
    }

    /// Deprovision a table under the migration context.
    ///
    /// # Errors
    ///
    /// See [`AuditedTx::deprovision`].
    pub async fn deprovision(&self, table: impl Into<String>) -> AuditResult<DeprovisionOutcome> {
        let table = table.into();
        self.transaction(ActionContext::migration(), move |tx| tx.deprovision(&table))
            .await
    }

    /// A table's audit log.
    ///
    /// # Errors
    ///
    /// See [`Store::audit_log`].
    pub async fn audit_log(&self, table: impl Into<String>) -> AuditResult<Vec<AuditLogEntry>> {
        let table = table.into();
        self.read(move |store| store.audit_log(&table)).await
    }

    /// A table's audit log entries for one correlation id.
    ///
    /// # Errors
    ///
    /// See [`Store::audit_log_for_transaction`].
    pub async fn audit_log_for_transaction(
        &self,
        table: impl Into<String>,
        txid: Uuid,
    ) -> AuditResult<Vec<AuditLogEntry>> {
        let table = table.into();
        self.read(move |store| store.audit_log_for_transaction(&table, txid))
            .await
    }

    /// The schema-change log.
    ///
    /// # Errors
    ///
    /// See [`Store::ddl_log`].
    pub async fn ddl_log(&self) -> AuditResult<Vec<DdlLogEntry>> {
        self.read(Store::ddl_log).await
    }

    /// Tables with an attached change interceptor.
    ///
    /// # Errors
    ///
    /// See [`Store::monitored_tables`].
    pub async fn monitored_tables(&self) -> AuditResult<Vec<String>> {
        self.read(Store::monitored_tables).await
    }
}
