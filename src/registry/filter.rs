//! Significance filter registry.
//!
//! A filter rule names a column whose change is not, on its own, reason
//! enough to write an update entry. Rules are global (no table) or scoped
//! to one table, and they only ever add to the filtered set: a table rule
//! cannot re-enable a globally filtered column.

use std::collections::BTreeSet;

use rusqlite::{params, Connection};

use crate::audit::{AuditResult, FilterRule};
use crate::capture::values::validate_identifier;

/// Add a filter rule if an identical one does not already exist.
///
/// # Errors
///
/// Returns an error if a name is not a valid identifier or the insert fails.
pub fn add_rule(conn: &Connection, table: Option<&str>, column: &str) -> AuditResult<FilterRule> {
    if let Some(table) = table {
        validate_identifier(table)?;
    }
    validate_identifier(column)?;

    conn.execute(
        "INSERT INTO ZAFilter (table_name, column_name)
         SELECT ?1, ?2
         WHERE NOT EXISTS (
             SELECT 1 FROM ZAFilter WHERE table_name IS ?1 AND column_name = ?2
         )",
        params![table, column],
    )?;
    let rule = conn.query_row(
        "SELECT id, table_name, column_name FROM ZAFilter
         WHERE table_name IS ?1 AND column_name = ?2
         ORDER BY id LIMIT 1",
        params![table, column],
        |row| {
            Ok(FilterRule {
                id: row.get(0)?,
                table_name: row.get(1)?,
                column_name: row.get(2)?,
            })
        },
    )?;
    Ok(rule)
}

/// List all filter rules.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn rules(conn: &Connection) -> AuditResult<Vec<FilterRule>> {
    let mut stmt = conn.prepare("SELECT id, table_name, column_name FROM ZAFilter ORDER BY id")?;
    let rules = stmt
        .query_map([], |row| {
            Ok(FilterRule {
                id: row.get(0)?,
                table_name: row.get(1)?,
                column_name: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rules)
}

/// Columns filtered for a table: global rules plus the table's own.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn filtered_columns(conn: &Connection, table: &str) -> AuditResult<BTreeSet<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT column_name FROM ZAFilter WHERE table_name IS NULL OR table_name = ?1",
    )?;
    let columns = stmt
        .query_map(params![table], |row| row.get(0))?
        .collect::<Result<BTreeSet<String>, _>>()?;
    Ok(columns)
}

/// Check whether a set of changed columns warrants an update entry.
///
/// True iff at least one changed column is not filtered.
///
/// # Errors
///
/// Returns an error if the filter rules cannot be read.
pub fn is_significant(
    conn: &Connection,
    table: &str,
    changed: &BTreeSet<String>,
) -> AuditResult<bool> {
    let filtered = filtered_columns(conn, table)?;
    Ok(has_significant_change(changed, &filtered))
}

pub(crate) fn has_significant_change(changed: &BTreeSet<String>, filtered: &BTreeSet<String>) -> bool {
    changed.iter().any(|column| !filtered.contains(column))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::schema::SCHEMA;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        conn
    }

    fn set(columns: &[&str]) -> BTreeSet<String> {
        columns.iter().map(|c| (*c).to_string()).collect()
    }

    #[test]
    fn test_add_rule_is_idempotent() {
        let conn = conn();
        let first = add_rule(&conn, None, "updatedAt").unwrap();
        let second = add_rule(&conn, None, "updatedAt").unwrap();
        assert_eq!(first, second);
        assert_eq!(rules(&conn).unwrap().len(), 1);

        let scoped = add_rule(&conn, Some("Widget"), "updatedAt").unwrap();
        assert_ne!(scoped.id, first.id);
        assert_eq!(rules(&conn).unwrap().len(), 2);
    }

    #[test]
    fn test_filtered_columns_merges_global_and_table() {
        let conn = conn();
        add_rule(&conn, None, "updatedAt").unwrap();
        add_rule(&conn, Some("Widget"), "cachedTotal").unwrap();
        add_rule(&conn, Some("Gadget"), "lastSeen").unwrap();

        assert_eq!(
            filtered_columns(&conn, "Widget").unwrap(),
            set(&["cachedTotal", "updatedAt"])
        );
        assert_eq!(filtered_columns(&conn, "Other").unwrap(), set(&["updatedAt"]));
    }

    #[test]
    fn test_only_filtered_columns_are_not_significant() {
        let conn = conn();
        add_rule(&conn, None, "updatedAt").unwrap();

        assert!(!is_significant(&conn, "Widget", &set(&["updatedAt"])).unwrap());
        assert!(is_significant(&conn, "Widget", &set(&["updatedAt", "name"])).unwrap());
        assert!(is_significant(&conn, "Widget", &set(&["name"])).unwrap());
    }

    #[test]
    fn test_empty_change_set_is_not_significant() {
        assert!(!has_significant_change(&BTreeSet::new(), &BTreeSet::new()));
    }

    #[test]
    fn test_add_rule_rejects_empty_column() {
        let conn = conn();
        assert!(add_rule(&conn, None, "").is_err());
    }
}
