//! Conversion between JSON rows and SQLite values, and identifier quoting.

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Number, Value};

use crate::audit::{AuditError, AuditResult, Row};

/// Reject identifiers SQLite cannot store in the catalog.
pub(crate) fn validate_identifier(name: &str) -> AuditResult<()> {
    if name.is_empty() || name.contains('\0') {
        return Err(AuditError::InvalidIdentifier(name.to_string()));
    }
    Ok(())
}

/// Quote an identifier for use in generated SQL.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for use in generated SQL.
pub(crate) fn sql_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Convert a stored SQLite value into JSON.
pub(crate) fn json_from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
    }
}

/// Convert a JSON value into a bindable SQLite value.
///
/// Nested arrays and objects are stored as their JSON text.
pub(crate) fn sql_from_json(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                n.as_f64().map_or(SqlValue::Null, SqlValue::Real)
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

/// Read one row of a table by rowid.
pub(crate) fn fetch_row(conn: &Connection, table: &str, rowid: i64) -> AuditResult<Option<Row>> {
    let sql = format!("SELECT * FROM {} WHERE rowid = ?1", quote_ident(table));
    let mut stmt = conn.prepare(&sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let row = stmt
        .query_row(params![rowid], |row| {
            let mut map = Row::new();
            for (idx, name) in names.iter().enumerate() {
                map.insert(name.clone(), json_from_sql(row.get_ref(idx)?));
            }
            Ok(map)
        })
        .optional()?;
    Ok(row)
}

/// Collect the rowids matching an equality filter, in rowid order.
pub(crate) fn matching_rowids(conn: &Connection, table: &str, filter: &Row) -> AuditResult<Vec<i64>> {
    let mut sql = format!("SELECT rowid FROM {}", quote_ident(table));
    let mut values = Vec::with_capacity(filter.len());
    for (idx, (column, value)) in filter.iter().enumerate() {
        validate_identifier(column)?;
        sql.push_str(if idx == 0 { " WHERE " } else { " AND " });
        if value.is_null() {
            sql.push_str(&format!("{} IS NULL", quote_ident(column)));
        } else {
            values.push(sql_from_json(value));
            sql.push_str(&format!("{} = ?{}", quote_ident(column), values.len()));
        }
    }
    sql.push_str(" ORDER BY rowid");

    let mut stmt = conn.prepare(&sql)?;
    let rowids = stmt
        .query_map(rusqlite::params_from_iter(values.iter()), |row| row.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(rowids)
}

/// Check whether a table exists in the main schema.
pub(crate) fn table_exists(conn: &Connection, table: &str) -> AuditResult<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![table],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// The name of a table as stored in the catalog.
///
/// SQLite matches table names without regard to ASCII case, so `widget`
/// and `Widget` name the same table. Returns `None` if no table matches.
pub(crate) fn catalog_table_name(conn: &Connection, table: &str) -> AuditResult<Option<String>> {
    let name = conn
        .query_row(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
            params![table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(name)
}

/// Check whether a table has rowids (is not declared `WITHOUT ROWID`).
pub(crate) fn has_rowid(conn: &Connection, table: &str) -> AuditResult<bool> {
    let without_rowid: Option<bool> = conn
        .query_row(
            "SELECT wr FROM pragma_table_list WHERE schema = 'main' AND name = ?1",
            params![table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(!without_rowid.unwrap_or(false))
}
