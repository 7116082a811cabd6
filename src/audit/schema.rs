//! Database schema for the audit engine.

/// Current schema version for migrations.
pub const SCHEMA_VERSION: u32 = 1;

/// Prefix shared by every engine table, trigger and index.
pub const ENGINE_PREFIX: &str = "ZA";
/// Prefix of audit log tables.
pub const LOG_PREFIX: &str = "ZAL";

pub const DESCRIPTOR_TABLE: &str = "ZADescriptor";
pub const FILTER_TABLE: &str = "ZAFilter";
pub const DDL_LOG_TABLE: &str = "ZALDDL";
pub const TX_SEQUENCE_TABLE: &str = "ZATxSequence";

/// Reserved descriptor that unlocks deletes from audit log tables.
pub const ARCHIVE_AUDIT_LOG: &str = "ARCHIVE AUDIT LOG";
/// Descriptor used for engine bootstrap and migration work.
pub const RUN_MIGRATIONS: &str = "RUN MIGRATIONS";

/// Connection settings applied before the schema.
pub const PRAGMAS: &str = r"
-- Enable WAL mode for better concurrent read/write performance
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
";

/// SQL schema for the audit engine tables.
pub const SCHEMA: &str = r#"
-- Interned reasons attached to audit rows
CREATE TABLE IF NOT EXISTS "ZADescriptor" (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    descriptor TEXT NOT NULL UNIQUE
);

-- Columns that are not, alone, significant enough to log an update
CREATE TABLE IF NOT EXISTS "ZAFilter" (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT,
    column_name TEXT NOT NULL
);

-- Shared log of schema changes, truncates and archival deletes
CREATE TABLE IF NOT EXISTS "ZALDDL" (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    command_tag TEXT,
    object_type TEXT,
    schema_name TEXT,
    object_identity TEXT,
    ddl_timestamp TEXT NOT NULL,
    ddl_by INTEGER NOT NULL,
    ddl_txid TEXT NOT NULL,
    session_sig TEXT,
    descriptor_id INTEGER REFERENCES "ZADescriptor"(id)
);

-- Native transaction counter used to derive correlation ids
CREATE TABLE IF NOT EXISTS "ZATxSequence" (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    value INTEGER NOT NULL
);
INSERT OR IGNORE INTO "ZATxSequence" (id, value) VALUES (1, 0);

-- Schema version table for migrations
CREATE TABLE IF NOT EXISTS "ZASchemaVersion" (
    version INTEGER PRIMARY KEY NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);
INSERT OR IGNORE INTO "ZASchemaVersion" (version) VALUES (1);

-- Descriptors are never changed or removed; filter rules only accumulate
CREATE TRIGGER IF NOT EXISTS "ZANoUpdateDescriptor" BEFORE UPDATE ON "ZADescriptor"
BEGIN
    SELECT RAISE(ABORT, 'Update of ZADescriptor is not supported to maintain audit log integrity.');
END;
CREATE TRIGGER IF NOT EXISTS "ZANoDeleteDescriptor" BEFORE DELETE ON "ZADescriptor"
BEGIN
    SELECT RAISE(ABORT, 'Delete from ZADescriptor is not supported to maintain audit log integrity.');
END;
CREATE TRIGGER IF NOT EXISTS "ZANoUpdateFilter" BEFORE UPDATE ON "ZAFilter"
BEGIN
    SELECT RAISE(ABORT, 'Update of ZAFilter is not supported to maintain audit log integrity.');
END;
CREATE TRIGGER IF NOT EXISTS "ZANoDeleteFilter" BEFORE DELETE ON "ZAFilter"
BEGIN
    SELECT RAISE(ABORT, 'Delete from ZAFilter is not supported to maintain audit log integrity.');
END;

-- Indexes for efficient queries
CREATE INDEX IF NOT EXISTS "ZAFilterIdxTable" ON "ZAFilter"(table_name);
CREATE INDEX IF NOT EXISTS "ZALDDLIdxTxid" ON "ZALDDL"(ddl_txid);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::gate::{GateKind, Gates};
    use crate::provision::GuardNames;
    use rusqlite::Connection;

    fn table_count(conn: &Connection, name: &str) -> i64 {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
            [name],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_schema_version() {
        assert_eq!(SCHEMA_VERSION, 1);
    }

    #[test]
    fn test_schema_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();

        for table in [
            DESCRIPTOR_TABLE,
            FILTER_TABLE,
            DDL_LOG_TABLE,
            TX_SEQUENCE_TABLE,
            "ZASchemaVersion",
        ] {
            assert_eq!(table_count(&conn, table), 1, "Table {table} should exist");
        }
    }

    #[test]
    fn test_schema_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        conn.execute_batch(SCHEMA).unwrap();
        conn.execute_batch(SCHEMA).unwrap();

        let seq_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM ZATxSequence", [], |row| row.get(0))
            .unwrap();
        assert_eq!(seq_rows, 1);
    }

    #[test]
    fn test_pragmas_apply() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(PRAGMAS).unwrap();

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        // In-memory uses "memory", file-based would use "wal"
        assert!(!mode.is_empty());
    }

    #[test]
    fn test_descriptor_text_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();

        conn.execute(
            "INSERT INTO ZADescriptor (descriptor) VALUES (?1)",
            [ARCHIVE_AUDIT_LOG],
        )
        .unwrap();
        let result = conn.execute(
            "INSERT INTO ZADescriptor (descriptor) VALUES (?1)",
            [ARCHIVE_AUDIT_LOG],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_ddl_log_guards() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        conn.execute_batch(&GuardNames::for_log_table(DDL_LOG_TABLE).create_sql())
            .unwrap();

        let gates = Gates::install(&conn).unwrap();

        let insert = "INSERT INTO ZALDDL (command_tag, ddl_timestamp, ddl_by, ddl_txid)
                      VALUES ('CREATE TABLE', datetime('now'), -1, 'tx')";
        let forged = conn.execute(insert, []);
        assert!(forged.unwrap_err().to_string().contains("Insert into ZALDDL"));
        {
            let _open = gates.open(GateKind::Log);
            conn.execute(insert, []).unwrap();
        }

        let update = conn.execute("UPDATE ZALDDL SET command_tag = 'x'", []);
        assert!(update.unwrap_err().to_string().contains("Update of ZALDDL"));

        let delete = conn.execute("DELETE FROM ZALDDL", []);
        assert!(delete.unwrap_err().to_string().contains("Delete from ZALDDL"));

        let _open = gates.open(GateKind::Archive);
        assert_eq!(conn.execute("DELETE FROM ZALDDL", []).unwrap(), 1);
    }

    #[test]
    fn test_descriptors_and_filters_are_append_only() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        conn.execute(
            "INSERT INTO ZADescriptor (descriptor) VALUES (?1)",
            [ARCHIVE_AUDIT_LOG],
        )
        .unwrap();
        conn.execute("INSERT INTO ZAFilter (column_name) VALUES ('updatedAt')", [])
            .unwrap();

        for (sql, message) in [
            ("UPDATE ZADescriptor SET descriptor = 'x'", "Update of ZADescriptor"),
            ("DELETE FROM ZADescriptor", "Delete from ZADescriptor"),
            ("UPDATE ZAFilter SET column_name = 'x'", "Update of ZAFilter"),
            ("DELETE FROM ZAFilter", "Delete from ZAFilter"),
        ] {
            let err = conn.execute(sql, []).unwrap_err();
            assert!(err.to_string().contains(message), "{sql}: {err}");
        }
    }
}
