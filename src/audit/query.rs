//! Typed reads of the audit tables.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row as SqlRow};
use uuid::Uuid;

use super::error::{AuditError, AuditResult};
use super::schema::LOG_PREFIX;
use super::types::{AuditLogEntry, DdlLogEntry, DmlType, Row};
use crate::capture::values::{quote_ident, table_exists, validate_identifier};

const AUDIT_COLUMNS: &str = "id, data_id, dml_type, old_row_data, new_row_data, dml_timestamp,
     dml_by, dml_as, dml_txid, session_sig, descriptor_id";

const DDL_COLUMNS: &str = "id, command_tag, object_type, schema_name, object_identity,
     ddl_timestamp, ddl_by, ddl_txid, session_sig, descriptor_id";

/// Log table for a monitored table; log table names pass through.
fn log_table_for(table: &str) -> AuditResult<String> {
    validate_identifier(table)?;
    if table.starts_with(LOG_PREFIX) {
        Ok(table.to_string())
    } else {
        Ok(format!("{LOG_PREFIX}{table}"))
    }
}

fn existing_log_table(conn: &Connection, table: &str) -> AuditResult<String> {
    let log = log_table_for(table)?;
    if !table_exists(conn, &log)? {
        return Err(AuditError::UnknownTable(log));
    }
    Ok(log)
}

/// Every entry of a table's audit log, oldest first.
///
/// Accepts either the monitored table's name or its log table's name.
///
/// # Errors
///
/// Returns `AuditError::UnknownTable` if no log exists, or a decode error
/// for a malformed stored value.
pub fn audit_log(conn: &Connection, table: &str) -> AuditResult<Vec<AuditLogEntry>> {
    let log = existing_log_table(conn, table)?;
    let sql = format!("SELECT {AUDIT_COLUMNS} FROM {} ORDER BY id", quote_ident(&log));
    let mut stmt = conn.prepare(&sql)?;
    let raw = stmt
        .query_map([], RawAuditRow::read)?
        .collect::<Result<Vec<_>, _>>()?;
    raw.into_iter().map(RawAuditRow::decode).collect()
}

/// Entries of a table's audit log written under one correlation id.
///
/// # Errors
///
/// Same as [`audit_log`].
pub fn audit_log_for_transaction(
    conn: &Connection,
    table: &str,
    txid: Uuid,
) -> AuditResult<Vec<AuditLogEntry>> {
    let log = existing_log_table(conn, table)?;
    let sql = format!(
        "SELECT {AUDIT_COLUMNS} FROM {} WHERE dml_txid = ?1 ORDER BY id",
        quote_ident(&log)
    );
    let mut stmt = conn.prepare(&sql)?;
    let raw = stmt
        .query_map(params![txid.to_string()], RawAuditRow::read)?
        .collect::<Result<Vec<_>, _>>()?;
    raw.into_iter().map(RawAuditRow::decode).collect()
}

/// Number of entries in a table's audit log.
///
/// # Errors
///
/// Returns `AuditError::UnknownTable` if no log exists.
pub fn count_entries(conn: &Connection, table: &str) -> AuditResult<u64> {
    let log = existing_log_table(conn, table)?;
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote_ident(&log)),
        [],
        |row| row.get(0),
    )?;
    Ok(count.unsigned_abs())
}

/// Every schema-change entry, oldest first.
///
/// # Errors
///
/// Returns an error if the query fails or a stored value is malformed.
pub fn ddl_log(conn: &Connection) -> AuditResult<Vec<DdlLogEntry>> {
    let mut stmt = conn.prepare(&format!("SELECT {DDL_COLUMNS} FROM ZALDDL ORDER BY id"))?;
    let raw = stmt
        .query_map([], RawDdlRow::read)?
        .collect::<Result<Vec<_>, _>>()?;
    raw.into_iter().map(RawDdlRow::decode).collect()
}

/// Schema-change entries written under one correlation id.
///
/// # Errors
///
/// Returns an error if the query fails or a stored value is malformed.
pub fn ddl_log_for_transaction(conn: &Connection, txid: Uuid) -> AuditResult<Vec<DdlLogEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DDL_COLUMNS} FROM ZALDDL WHERE ddl_txid = ?1 ORDER BY id"
    ))?;
    let raw = stmt
        .query_map(params![txid.to_string()], RawDdlRow::read)?
        .collect::<Result<Vec<_>, _>>()?;
    raw.into_iter().map(RawDdlRow::decode).collect()
}

fn parse_timestamp(text: &str) -> AuditResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AuditError::Decode {
            what: "timestamp",
            reason: e.to_string(),
        })
}

fn parse_txid(text: &str) -> AuditResult<Uuid> {
    Uuid::parse_str(text).map_err(|e| AuditError::Decode {
        what: "transaction id",
        reason: e.to_string(),
    })
}

fn parse_payload(text: Option<String>) -> AuditResult<Option<Row>> {
    text.map(|t| {
        serde_json::from_str(&t).map_err(|e| AuditError::Decode {
            what: "row data",
            reason: e.to_string(),
        })
    })
    .transpose()
}

/// Audit log row as stored, before decoding.
struct RawAuditRow {
    id: i64,
    data_id: i64,
    dml_type: String,
    old_row_data: Option<String>,
    new_row_data: Option<String>,
    dml_timestamp: String,
    dml_by: i64,
    dml_as: i64,
    dml_txid: String,
    session_sig: Option<String>,
    descriptor_id: Option<i64>,
}

impl RawAuditRow {
    fn read(row: &SqlRow<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            data_id: row.get(1)?,
            dml_type: row.get(2)?,
            old_row_data: row.get(3)?,
            new_row_data: row.get(4)?,
            dml_timestamp: row.get(5)?,
            dml_by: row.get(6)?,
            dml_as: row.get(7)?,
            dml_txid: row.get(8)?,
            session_sig: row.get(9)?,
            descriptor_id: row.get(10)?,
        })
    }

    fn decode(self) -> AuditResult<AuditLogEntry> {
        let dml_type = self
            .dml_type
            .parse::<DmlType>()
            .map_err(|reason| AuditError::Decode {
                what: "dml type",
                reason,
            })?;
        Ok(AuditLogEntry {
            id: self.id,
            data_id: self.data_id,
            dml_type,
            old_row_data: parse_payload(self.old_row_data)?,
            new_row_data: parse_payload(self.new_row_data)?,
            dml_timestamp: parse_timestamp(&self.dml_timestamp)?,
            dml_by: self.dml_by,
            dml_as: self.dml_as,
            dml_txid: parse_txid(&self.dml_txid)?,
            session_sig: self.session_sig,
            descriptor_id: self.descriptor_id,
        })
    }
}

/// DDL log row as stored, before decoding.
struct RawDdlRow {
    id: i64,
    command_tag: Option<String>,
    object_type: Option<String>,
    schema_name: Option<String>,
    object_identity: Option<String>,
    ddl_timestamp: String,
    ddl_by: i64,
    ddl_txid: String,
    session_sig: Option<String>,
    descriptor_id: Option<i64>,
}

impl RawDdlRow {
    fn read(row: &SqlRow<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            command_tag: row.get(1)?,
            object_type: row.get(2)?,
            schema_name: row.get(3)?,
            object_identity: row.get(4)?,
            ddl_timestamp: row.get(5)?,
            ddl_by: row.get(6)?,
            ddl_txid: row.get(7)?,
            session_sig: row.get(8)?,
            descriptor_id: row.get(9)?,
        })
    }

    fn decode(self) -> AuditResult<DdlLogEntry> {
        Ok(DdlLogEntry {
            id: self.id,
            command_tag: self.command_tag.unwrap_or_default(),
            object_type: self.object_type.unwrap_or_default(),
            schema_name: self.schema_name.unwrap_or_default(),
            object_identity: self.object_identity.unwrap_or_default(),
            ddl_timestamp: parse_timestamp(&self.ddl_timestamp)?,
            ddl_by: self.ddl_by,
            ddl_txid: parse_txid(&self.ddl_txid)?,
            session_sig: self.session_sig,
            descriptor_id: self.descriptor_id,
        })
    }
}
