//! Per-table audit store provisioning.
//!
//! Provisioning runs the generated SQL through the schema observer, so the
//! log table and triggers it creates are recorded in the DDL log like any
//! other schema change. An empty catalog diff means there was nothing to
//! do, which is how both operations report idempotent no-ops.

use rusqlite::{params, Connection};

use crate::audit::{AuditError, AuditResult, DeprovisionOutcome, ProvisionOutcome};
use crate::capture::values::{catalog_table_name, has_rowid, validate_identifier};
use crate::capture::AuditedTx;

use super::naming::{is_engine_table, AuditTableNames};

/// Whether a table currently has its change interceptor attached.
///
/// # Errors
///
/// Returns an error if the catalog cannot be read.
pub fn is_monitored(conn: &Connection, table: &str) -> AuditResult<bool> {
    let names = AuditTableNames::for_table(table);
    let monitored = conn.query_row(
        "SELECT EXISTS(
             SELECT 1 FROM sqlite_master
             WHERE type = 'trigger' AND name = ?1 AND tbl_name = ?2
         )",
        params![names.insert_trigger, table],
        |row| row.get(0),
    )?;
    Ok(monitored)
}

/// Every monitored table, by name.
///
/// # Errors
///
/// Returns an error if the catalog cannot be read.
pub fn monitored_tables(conn: &Connection) -> AuditResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT tbl_name FROM sqlite_master
         WHERE type = 'trigger' AND name = 'ZALTI' || tbl_name
         ORDER BY tbl_name",
    )?;
    let tables = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(tables)
}

/// User tables, excluding SQLite's own.
fn user_tables(conn: &Connection) -> AuditResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\'
         ORDER BY name",
    )?;
    let tables = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(tables)
}

impl AuditedTx<'_> {
    /// Attach the audit bundle to a table.
    ///
    /// Creates the log table, its guards and the write gates that route the
    /// table's writes through its change interceptor.
    ///
    /// # Errors
    ///
    /// Returns `AuditError::NotAuditable` for engine tables, `WITHOUT ROWID`
    /// tables and tables whose log name is taken by another table,
    /// `AuditError::UnknownTable` if the table does not exist, or the SQL
    /// error that stopped provisioning.
    pub fn provision(&mut self, table: &str) -> AuditResult<ProvisionOutcome> {
        self.ensure_active()?;
        let result = self.provision_table(table);
        self.track(result)
    }

    /// Detach a table's change interceptor. Its log table and guards stay.
    ///
    /// # Errors
    ///
    /// Returns `AuditError::NotAuditable` for engine tables or the SQL error.
    pub fn deprovision(&mut self, table: &str) -> AuditResult<DeprovisionOutcome> {
        self.ensure_active()?;
        let result = self.deprovision_table(table);
        self.track(result)
    }

    /// Provision every user table the policy allows. Returns the tables
    /// that were newly provisioned.
    ///
    /// Tables that cannot be audited are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Stops at the first other failure.
    pub fn provision_all(&mut self) -> AuditResult<Vec<String>> {
        self.ensure_active()?;
        let result = self.provision_candidates();
        self.track(result)
    }

    /// Tables with an attached change interceptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be read.
    pub fn monitored_tables(&self) -> AuditResult<Vec<String>> {
        monitored_tables(&self.tx)
    }

    pub(crate) fn provision_table(&mut self, table: &str) -> AuditResult<ProvisionOutcome> {
        validate_identifier(table)?;
        if is_engine_table(table) || AuditTableNames::for_table(table).collides_with_engine() {
            return Err(AuditError::NotAuditable(table.to_string()));
        }
        let Some(table) = catalog_table_name(&self.tx, table)? else {
            return Err(AuditError::UnknownTable(table.to_string()));
        };
        let table = table.as_str();
        let names = AuditTableNames::for_table(table);
        if is_engine_table(table) || names.collides_with_engine() {
            return Err(AuditError::NotAuditable(table.to_string()));
        }
        if !has_rowid(&self.tx, table)? {
            return Err(AuditError::NotAuditable(table.to_string()));
        }
        if let Some(existing) = catalog_table_name(&self.tx, &names.log_table)? {
            if existing != names.log_table {
                tracing::warn!(table = %table, existing = %existing, "Log table name is taken");
                return Err(AuditError::NotAuditable(table.to_string()));
            }
        }

        let (_, changes) = self.apply_ddl(&names.provision_sql())?;
        if changes.is_empty() {
            tracing::debug!(table = %table, "Table already provisioned");
            return Ok(ProvisionOutcome::AlreadyProvisioned);
        }
        tracing::info!(table = %table, log_table = %names.log_table, "Provisioned audit log");
        Ok(ProvisionOutcome::Provisioned)
    }

    pub(crate) fn deprovision_table(&mut self, table: &str) -> AuditResult<DeprovisionOutcome> {
        validate_identifier(table)?;
        let table = catalog_table_name(&self.tx, table)?.unwrap_or_else(|| table.to_string());
        let table = table.as_str();
        if is_engine_table(table) {
            return Err(AuditError::NotAuditable(table.to_string()));
        }

        let names = AuditTableNames::for_table(table);
        let (_, changes) = self.apply_ddl(&names.deprovision_sql())?;
        if changes.is_empty() {
            tracing::debug!(table = %table, "Table was not provisioned");
            return Ok(DeprovisionOutcome::NotProvisioned);
        }
        tracing::info!(table = %table, "Deprovisioned change interceptor");
        Ok(DeprovisionOutcome::Deprovisioned)
    }

    fn provision_candidates(&mut self) -> AuditResult<Vec<String>> {
        let mut provisioned = Vec::new();
        for table in user_tables(&self.tx)? {
            if !self.policy.is_candidate(&table) {
                continue;
            }
            match self.provision_table(&table) {
                Ok(ProvisionOutcome::Provisioned) => provisioned.push(table),
                Ok(ProvisionOutcome::AlreadyProvisioned) => {}
                Err(AuditError::NotAuditable(_)) => {
                    tracing::warn!(table = %table, "Skipping table that cannot be audited");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(provisioned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::schema::SCHEMA;
    use crate::capture::values::table_exists;
    use crate::capture::{ActionContext, AuditPolicy};

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        conn.execute_batch(
            "CREATE TABLE Widget (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE Gadget (id INTEGER PRIMARY KEY, label TEXT);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_provision_then_already_provisioned() {
        let mut conn = setup();
        let policy = AuditPolicy::default();
        let mut tx = AuditedTx::begin(&mut conn, &policy, ActionContext::migration()).unwrap();
        assert_eq!(tx.provision("Widget").unwrap(), ProvisionOutcome::Provisioned);
        assert_eq!(
            tx.provision("Widget").unwrap(),
            ProvisionOutcome::AlreadyProvisioned
        );
        assert_eq!(tx.monitored_tables().unwrap(), vec!["Widget".to_string()]);
        tx.commit().unwrap();
    }

    #[test]
    fn test_provision_refuses_engine_and_missing_tables() {
        let mut conn = setup();
        let policy = AuditPolicy::default();

        let mut tx = AuditedTx::begin(&mut conn, &policy, ActionContext::new()).unwrap();
        assert!(matches!(
            tx.provision("ZADescriptor"),
            Err(AuditError::NotAuditable(_))
        ));
        drop(tx);

        let mut tx = AuditedTx::begin(&mut conn, &policy, ActionContext::new()).unwrap();
        assert!(matches!(
            tx.provision("Missing"),
            Err(AuditError::UnknownTable(_))
        ));
        drop(tx);

        conn.execute_batch("CREATE TABLE DDL (id INTEGER PRIMARY KEY)").unwrap();
        let mut tx = AuditedTx::begin(&mut conn, &policy, ActionContext::new()).unwrap();
        assert!(matches!(tx.provision("DDL"), Err(AuditError::NotAuditable(_))));
    }

    #[test]
    fn test_provision_refuses_without_rowid_tables() {
        let mut conn = setup();
        conn.execute_batch("CREATE TABLE Tag (name TEXT PRIMARY KEY) WITHOUT ROWID")
            .unwrap();
        let policy = AuditPolicy::default();

        let mut tx = AuditedTx::begin(&mut conn, &policy, ActionContext::new()).unwrap();
        assert!(matches!(tx.provision("Tag"), Err(AuditError::NotAuditable(name)) if name == "Tag"));
        drop(tx);

        let mut tx = AuditedTx::begin(&mut conn, &policy, ActionContext::new()).unwrap();
        let provisioned = tx.provision_all().unwrap();
        assert!(!provisioned.contains(&"Tag".to_string()));
        tx.commit().unwrap();
        assert!(!is_monitored(&conn, "Tag").unwrap());
    }

    #[test]
    fn test_provision_resolves_catalog_spelling() {
        let mut conn = setup();
        let policy = AuditPolicy::default();
        let mut tx = AuditedTx::begin(&mut conn, &policy, ActionContext::new()).unwrap();
        assert_eq!(tx.provision("widget").unwrap(), ProvisionOutcome::Provisioned);
        assert_eq!(tx.monitored_tables().unwrap(), vec!["Widget".to_string()]);
        tx.commit().unwrap();
    }

    #[test]
    fn test_provision_refuses_taken_log_name() {
        let mut conn = setup();
        conn.execute_batch("CREATE TABLE zalGadget (id INTEGER PRIMARY KEY)")
            .unwrap();
        let policy = AuditPolicy::default();
        let mut tx = AuditedTx::begin(&mut conn, &policy, ActionContext::new()).unwrap();
        assert!(matches!(
            tx.provision("Gadget"),
            Err(AuditError::NotAuditable(name)) if name == "Gadget"
        ));
    }

    #[test]
    fn test_deprovision_keeps_log_table() {
        let mut conn = setup();
        let policy = AuditPolicy::default();
        let mut tx = AuditedTx::begin(&mut conn, &policy, ActionContext::new()).unwrap();
        tx.provision("Widget").unwrap();
        assert_eq!(
            tx.deprovision("Widget").unwrap(),
            DeprovisionOutcome::Deprovisioned
        );
        assert_eq!(
            tx.deprovision("Widget").unwrap(),
            DeprovisionOutcome::NotProvisioned
        );
        tx.commit().unwrap();

        assert!(!is_monitored(&conn, "Widget").unwrap());
        assert!(table_exists(&conn, "ZALWidget").unwrap());
    }

    #[test]
    fn test_provision_all_skips_engine_tables() {
        let mut conn = setup();
        let policy = AuditPolicy::default();
        let mut tx = AuditedTx::begin(&mut conn, &policy, ActionContext::migration()).unwrap();
        let provisioned = tx.provision_all().unwrap();
        assert_eq!(provisioned, vec!["Gadget".to_string(), "Widget".to_string()]);
        assert!(tx.provision_all().unwrap().is_empty());
        tx.commit().unwrap();

        assert_eq!(
            monitored_tables(&conn).unwrap(),
            vec!["Gadget".to_string(), "Widget".to_string()]
        );
    }

    #[test]
    fn test_provisioning_is_recorded_in_ddl_log() {
        let mut conn = setup();
        let policy = AuditPolicy::default();
        let mut tx = AuditedTx::begin(&mut conn, &policy, ActionContext::migration()).unwrap();
        tx.provision("Widget").unwrap();
        tx.commit().unwrap();

        let tags: Vec<String> = conn
            .prepare("SELECT command_tag || ' ' || object_identity FROM ZALDDL ORDER BY id")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert!(tags.contains(&"CREATE TABLE main.ZALWidget".to_string()));
        assert!(tags.contains(&"CREATE TRIGGER ZALTIWidget on main.Widget".to_string()));
        assert!(tags.contains(&"CREATE TRIGGER ZALNoDeleteTWidget on main.ZALWidget".to_string()));
    }
}
