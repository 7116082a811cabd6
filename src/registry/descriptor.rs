//! Descriptor registry: interns free-text reasons to integer ids.
//!
//! Descriptors are created on first use and never updated or deleted.
//! Creation is insert-or-ignore against the unique `descriptor` column
//! followed by a lookup, so concurrent first use of the same text
//! converges on a single row instead of failing.

use rusqlite::{params, Connection, OptionalExtension};

use crate::audit::{AuditResult, Descriptor};

/// Resolve descriptor text to its id, creating it if needed.
///
/// Returns `None` for absent or empty text.
///
/// # Errors
///
/// Returns an error if the descriptor cannot be inserted or read back.
pub fn resolve(conn: &Connection, text: Option<&str>) -> AuditResult<Option<i64>> {
    let Some(text) = text.filter(|t| !t.is_empty()) else {
        return Ok(None);
    };

    conn.execute(
        "INSERT OR IGNORE INTO ZADescriptor (descriptor) VALUES (?1)",
        params![text],
    )?;
    let id: i64 = conn.query_row(
        "SELECT id FROM ZADescriptor WHERE descriptor = ?1",
        params![text],
        |row| row.get(0),
    )?;

    tracing::trace!(descriptor = text, id, "Resolved descriptor");
    Ok(Some(id))
}

/// Look up descriptor text without creating it.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn lookup(conn: &Connection, text: &str) -> AuditResult<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM ZADescriptor WHERE descriptor = ?1",
            params![text],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Get the text of a descriptor id.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn text_of(conn: &Connection, id: i64) -> AuditResult<Option<String>> {
    let text = conn
        .query_row(
            "SELECT descriptor FROM ZADescriptor WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(text)
}

/// List every descriptor, oldest first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn all(conn: &Connection) -> AuditResult<Vec<Descriptor>> {
    let mut stmt = conn.prepare("SELECT id, descriptor FROM ZADescriptor ORDER BY id")?;
    let descriptors = stmt
        .query_map([], |row| {
            Ok(Descriptor {
                id: row.get(0)?,
                text: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(descriptors)
}
