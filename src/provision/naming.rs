//! Names and generated SQL for a monitored table's audit objects.
//!
//! Every engine object starts with `ZA` so it sorts after application
//! objects; audit log tables start with `ZAL`:
//!
//! - `ZAL<table>`: the append-only log
//! - `ZALTI<table>`, `ZALTU<table>`, `ZALTD<table>`: write gates on the
//!   monitored table; their presence is what makes a table monitored
//! - `ZALNoInsertT<table>`, `ZALNoUpdateT<table>`, `ZALNoDeleteT<table>`:
//!   guards on the log

use crate::audit::schema::{DDL_LOG_TABLE, DESCRIPTOR_TABLE, ENGINE_PREFIX, LOG_PREFIX};
use crate::capture::gate::{gate_open_sql, GateKind};
use crate::capture::values::{quote_ident, sql_literal};

/// Prefix of the guard triggers; they may never be dropped.
pub const GUARD_TRIGGER_PREFIX: &str = "ZALNo";

/// Check whether a table belongs to the audit engine.
///
/// Compares the name as spelled in the catalog; resolve caller-supplied
/// names with their stored spelling first.
#[must_use]
pub fn is_engine_table(name: &str) -> bool {
    name.starts_with(ENGINE_PREFIX)
}

/// Check whether a table follows the audit log naming convention.
#[must_use]
pub fn is_audit_log(name: &str) -> bool {
    name.starts_with(LOG_PREFIX)
}

/// Guard trigger names for one audit log table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardNames {
    pub log_table: String,
    pub no_insert_trigger: String,
    pub no_update_trigger: String,
    pub no_delete_trigger: String,
}

impl GuardNames {
    /// Derive guard names from a log table name (`ZAL<suffix>`).
    #[must_use]
    pub fn for_log_table(log_table: &str) -> Self {
        let suffix = log_table.strip_prefix(LOG_PREFIX).unwrap_or(log_table);
        Self {
            log_table: log_table.to_string(),
            no_insert_trigger: format!("{GUARD_TRIGGER_PREFIX}InsertT{suffix}"),
            no_update_trigger: format!("{GUARD_TRIGGER_PREFIX}UpdateT{suffix}"),
            no_delete_trigger: format!("{GUARD_TRIGGER_PREFIX}DeleteT{suffix}"),
        }
    }

    /// SQL creating the insert-only-by-engine, no-update and
    /// no-delete-except-archive guards.
    #[must_use]
    pub fn create_sql(&self) -> String {
        let log = quote_ident(&self.log_table);
        let insert_message = sql_literal(&format!(
            "Insert into {} is only permitted for the audit engine.",
            self.log_table
        ));
        let update_message = sql_literal(&format!(
            "Update of {} is not supported to maintain audit log integrity.",
            self.log_table
        ));
        let delete_message = sql_literal(&format!(
            "Delete from {} is not supported to maintain audit log integrity.",
            self.log_table
        ));
        format!(
            "CREATE TRIGGER IF NOT EXISTS {no_insert} BEFORE INSERT ON {log}
             BEGIN
                 SELECT RAISE(ABORT, {insert_message})
                 WHERE NOT {log_gate};
             END;
             CREATE TRIGGER IF NOT EXISTS {no_update} BEFORE UPDATE ON {log}
             BEGIN
                 SELECT RAISE(ABORT, {update_message});
             END;
             CREATE TRIGGER IF NOT EXISTS {no_delete} BEFORE DELETE ON {log}
             BEGIN
                 SELECT RAISE(ABORT, {delete_message})
                 WHERE NOT {archive_gate};
             END;",
            no_insert = quote_ident(&self.no_insert_trigger),
            no_update = quote_ident(&self.no_update_trigger),
            no_delete = quote_ident(&self.no_delete_trigger),
            log_gate = gate_open_sql(GateKind::Log),
            archive_gate = gate_open_sql(GateKind::Archive),
        )
    }
}

/// Names of every audit object belonging to one monitored table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditTableNames {
    pub table: String,
    pub log_table: String,
    pub insert_trigger: String,
    pub update_trigger: String,
    pub delete_trigger: String,
    pub txid_index: String,
    pub guards: GuardNames,
}

impl AuditTableNames {
    #[must_use]
    pub fn for_table(table: &str) -> Self {
        let log_table = format!("{LOG_PREFIX}{table}");
        Self {
            table: table.to_string(),
            insert_trigger: format!("{LOG_PREFIX}TI{table}"),
            update_trigger: format!("{LOG_PREFIX}TU{table}"),
            delete_trigger: format!("{LOG_PREFIX}TD{table}"),
            txid_index: format!("{LOG_PREFIX}Idx{table}Txid"),
            guards: GuardNames::for_log_table(&log_table),
            log_table,
        }
    }

    /// Whether the derived log table would collide with an engine table.
    #[must_use]
    pub fn collides_with_engine(&self) -> bool {
        self.log_table == DDL_LOG_TABLE
    }

    /// SQL creating the log table and its correlation index.
    #[must_use]
    pub fn log_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {log} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                data_id INTEGER NOT NULL,
                dml_type TEXT NOT NULL CHECK (dml_type IN ('INSERT', 'UPDATE', 'DELETE')),
                old_row_data TEXT,
                new_row_data TEXT,
                dml_timestamp TEXT NOT NULL,
                dml_by INTEGER NOT NULL,
                dml_as INTEGER NOT NULL,
                dml_txid TEXT NOT NULL,
                session_sig TEXT,
                descriptor_id INTEGER REFERENCES {descriptors}(id)
             );
             CREATE INDEX IF NOT EXISTS {index} ON {log}(dml_txid);",
            log = quote_ident(&self.log_table),
            index = quote_ident(&self.txid_index),
            descriptors = quote_ident(DESCRIPTOR_TABLE),
        )
    }

    /// SQL attaching the write gates to the monitored table.
    ///
    /// A write passes only while the engine holds the write gate, so
    /// statements that bypass the change interceptor are refused.
    #[must_use]
    pub fn interceptor_sql(&self) -> String {
        let table = quote_ident(&self.table);
        let write_gate = gate_open_sql(GateKind::Write);
        [
            ("INSERT", &self.insert_trigger, "insert into"),
            ("UPDATE", &self.update_trigger, "update of"),
            ("DELETE", &self.delete_trigger, "delete from"),
        ]
        .iter()
        .map(|(event, trigger, verb)| {
            let message = sql_literal(&format!(
                "Unaudited {verb} {} is not permitted.",
                self.table
            ));
            format!(
                "CREATE TRIGGER IF NOT EXISTS {trigger} BEFORE {event} ON {table}
                 BEGIN
                     SELECT RAISE(ABORT, {message})
                     WHERE NOT {write_gate};
                 END;",
                trigger = quote_ident(trigger),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
    }

    /// SQL for the whole audit bundle; every statement is idempotent.
    #[must_use]
    pub fn provision_sql(&self) -> String {
        format!(
            "{}\n{}\n{}",
            self.log_table_sql(),
            self.guards.create_sql(),
            self.interceptor_sql()
        )
    }

    /// SQL detaching the write gates. The log table and its guards stay.
    #[must_use]
    pub fn deprovision_sql(&self) -> String {
        [&self.insert_trigger, &self.update_trigger, &self.delete_trigger]
            .iter()
            .map(|trigger| format!("DROP TRIGGER IF EXISTS {};", quote_ident(trigger)))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::gate::Gates;

    #[test]
    fn test_names_for_table() {
        let names = AuditTableNames::for_table("Widget");
        assert_eq!(names.log_table, "ZALWidget");
        assert_eq!(names.insert_trigger, "ZALTIWidget");
        assert_eq!(names.update_trigger, "ZALTUWidget");
        assert_eq!(names.delete_trigger, "ZALTDWidget");
        assert_eq!(names.guards.no_insert_trigger, "ZALNoInsertTWidget");
        assert_eq!(names.guards.no_update_trigger, "ZALNoUpdateTWidget");
        assert_eq!(names.guards.no_delete_trigger, "ZALNoDeleteTWidget");
    }

    #[test]
    fn test_guard_names_for_ddl_log() {
        let guards = GuardNames::for_log_table("ZALDDL");
        assert_eq!(guards.no_update_trigger, "ZALNoUpdateTDDL");
        assert_eq!(guards.no_delete_trigger, "ZALNoDeleteTDDL");
    }

    #[test]
    fn test_naming_convention_checks() {
        assert!(is_engine_table("ZADescriptor"));
        assert!(is_engine_table("ZALWidget"));
        assert!(is_audit_log("ZALWidget"));
        assert!(!is_audit_log("ZADescriptor"));
        assert!(!is_engine_table("Widget"));
    }

    #[test]
    fn test_collision_with_ddl_log() {
        assert!(AuditTableNames::for_table("DDL").collides_with_engine());
        assert!(!AuditTableNames::for_table("Widget").collides_with_engine());
    }

    #[test]
    fn test_deprovision_sql_keeps_log() {
        let sql = AuditTableNames::for_table("Widget").deprovision_sql();
        assert!(sql.contains("DROP TRIGGER IF EXISTS \"ZALTIWidget\""));
        assert!(!sql.contains("DROP TABLE"));
        assert!(!sql.contains("ZALNo"));
    }

    #[test]
    fn test_provision_sql_is_valid_and_idempotent() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch(crate::audit::schema::SCHEMA).unwrap();
        conn.execute_batch("CREATE TABLE Widget (id INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();

        let sql = AuditTableNames::for_table("Widget").provision_sql();
        conn.execute_batch(&sql).unwrap();
        conn.execute_batch(&sql).unwrap();

        let triggers: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'trigger'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(triggers, 6);
    }

    #[test]
    fn test_write_gate_refuses_raw_writes() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let gates = Gates::install(&conn).unwrap();
        conn.execute_batch(crate::audit::schema::SCHEMA).unwrap();
        conn.execute_batch("CREATE TABLE Widget (id INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();
        conn.execute_batch(&AuditTableNames::for_table("Widget").provision_sql())
            .unwrap();

        let err = conn
            .execute("INSERT INTO Widget (id, name) VALUES (1, 'a')", [])
            .unwrap_err();
        assert!(err.to_string().contains("Unaudited insert into Widget"));

        // Other gates do not unlock data writes
        {
            let _open = gates.open(GateKind::Archive);
            assert!(conn
                .execute("INSERT INTO Widget (id, name) VALUES (1, 'a')", [])
                .is_err());
        }

        let _open = gates.open(GateKind::Write);
        conn.execute("INSERT INTO Widget (id, name) VALUES (1, 'a')", [])
            .unwrap();
    }

    #[test]
    fn test_log_insert_needs_log_gate() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let gates = Gates::install(&conn).unwrap();
        conn.execute_batch(crate::audit::schema::SCHEMA).unwrap();
        conn.execute_batch("CREATE TABLE Widget (id INTEGER PRIMARY KEY)")
            .unwrap();
        conn.execute_batch(&AuditTableNames::for_table("Widget").provision_sql())
            .unwrap();

        let insert = "INSERT INTO ZALWidget (data_id, dml_type, dml_timestamp, dml_by, dml_as, dml_txid)
                      VALUES (1, 'INSERT', '2026-01-01T00:00:00Z', -1, -1, 'tx')";
        let err = conn.execute(insert, []).unwrap_err();
        assert!(err
            .to_string()
            .contains("Insert into ZALWidget is only permitted for the audit engine."));

        let _open = gates.open(GateKind::Log);
        conn.execute(insert, []).unwrap();
    }

    #[test]
    fn test_triggers_fail_closed_without_gate_function() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch(crate::audit::schema::SCHEMA).unwrap();
        conn.execute_batch("CREATE TABLE Widget (id INTEGER PRIMARY KEY)")
            .unwrap();
        conn.execute_batch(&AuditTableNames::for_table("Widget").provision_sql())
            .unwrap();

        assert!(conn.execute("INSERT INTO Widget (id) VALUES (1)", []).is_err());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM Widget", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
