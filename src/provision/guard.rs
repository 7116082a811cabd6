//! Engine-side guards for audit tables.
//!
//! The guard triggers on each log table stop raw SQL. These checks stop
//! the same operations earlier, when they go through the data-access layer
//! or the schema observer, and cover what SQLite triggers cannot see
//! (schema changes).

use crate::audit::{AuditError, AuditResult, GuardedOperation};
use crate::capture::values::validate_identifier;
use crate::ddl::{ChangeKind, ObjectKind, SchemaChange};

use super::naming::{is_engine_table, GUARD_TRIGGER_PREFIX};

/// Refuse data-access writes to engine tables.
///
/// Log rows come only from change interceptors, and log deletes go through
/// the archival path instead.
pub(crate) fn check_data_write(table: &str, operation: GuardedOperation) -> AuditResult<()> {
    validate_identifier(table)?;
    if is_engine_table(table) {
        return Err(AuditError::guard(table, operation));
    }
    Ok(())
}

/// Refuse a caller-issued trigger on an engine table.
///
/// `table` is the catalog spelling of the table the trigger was created on.
/// Such a trigger would run while the engine holds a gate open.
pub(crate) fn check_trigger_target(table: &str) -> AuditResult<()> {
    if is_engine_table(table) {
        return Err(AuditError::guard(table, GuardedOperation::Alter));
    }
    Ok(())
}

/// Refuse catalog changes that would alter or remove engine objects.
pub(crate) fn check_schema_change(change: &SchemaChange) -> AuditResult<()> {
    let operation = match change.kind {
        ChangeKind::Create => return Ok(()),
        ChangeKind::Alter => GuardedOperation::Alter,
        ChangeKind::Drop => GuardedOperation::Drop,
    };

    match change.object {
        ObjectKind::Table => {
            if is_engine_table(&change.name) {
                return Err(AuditError::guard(&change.name, operation));
            }
            if let Some(previous) = change.previous_name.as_deref() {
                if is_engine_table(previous) {
                    return Err(AuditError::guard(previous, operation));
                }
            }
        }
        ObjectKind::Trigger if change.kind == ChangeKind::Drop => {
            if change.name.starts_with(GUARD_TRIGGER_PREFIX) || is_engine_table(&change.table) {
                return Err(AuditError::guard(&change.table, operation));
            }
        }
        _ => {}
    }
    Ok(())
}
