//! Schema-change interceptor.
//!
//! DDL runs through [`AuditedTx::execute_ddl`], which brackets the batch
//! with catalog snapshots, refuses changes to engine objects, writes one
//! `ZALDDL` row per change and then reacts: new tables are provisioned,
//! dropped tables deprovisioned, and renamed monitored tables moved to a
//! log under their new name.

use crate::audit::{AuditError, AuditResult};
use crate::capture::values::{catalog_table_name, has_rowid};
use crate::capture::AuditedTx;
use crate::provision::guard::{check_schema_change, check_trigger_target};
use crate::provision::naming::is_engine_table;
use crate::provision::AuditTableNames;

use super::catalog::{CatalogSnapshot, ChangeKind, ObjectKind, SchemaChange};

impl AuditedTx<'_> {
    /// Execute a batch of DDL and record every catalog change it made.
    ///
    /// The batch may only change the schema. A batch that changes rows, or
    /// creates a trigger on an engine table, is refused.
    ///
    /// # Errors
    ///
    /// Returns the SQL error of the batch, `AuditError::DataChangeInDdl` if
    /// it changed rows, a guard violation if it touched engine objects, or
    /// the error of a provisioning reaction. The transaction is poisoned in
    /// every case.
    pub fn execute_ddl(&mut self, sql: &str) -> AuditResult<Vec<SchemaChange>> {
        self.ensure_active()?;
        let result = self.observe_ddl(sql);
        self.track(result)
    }

    fn observe_ddl(&mut self, sql: &str) -> AuditResult<Vec<SchemaChange>> {
        let (before, changes) = self.apply_ddl(sql)?;
        for change in &changes {
            if change.object == ObjectKind::Trigger && change.kind == ChangeKind::Create {
                let table = catalog_table_name(&self.tx, &change.table)?
                    .unwrap_or_else(|| change.table.clone());
                check_trigger_target(&table)?;
            }
        }
        self.react(&before, &changes)?;
        Ok(changes)
    }

    /// Run a batch and log its changes without reacting to them.
    ///
    /// Returns the catalog as it was before the batch, and the changes.
    pub(crate) fn apply_ddl(
        &mut self,
        sql: &str,
    ) -> AuditResult<(CatalogSnapshot, Vec<SchemaChange>)> {
        let before = CatalogSnapshot::capture(&self.tx)?;
        let rows_before = self.tx.total_changes();
        self.tx.execute_batch(sql)?;
        let changed = self.tx.total_changes().saturating_sub(rows_before);
        if changed > 0 {
            return Err(AuditError::DataChangeInDdl(changed));
        }
        let after = CatalogSnapshot::capture(&self.tx)?;
        let changes = before.diff(&after);

        for change in &changes {
            check_schema_change(change)?;
        }
        if !changes.is_empty() {
            self.invalidate_interceptors();
        }

        let schema = self.policy.schema_name().to_string();
        for change in &changes {
            self.log_ddl(
                &change.command_tag(),
                change.object.as_str(),
                &change.identity(&schema),
            )?;
        }
        Ok((before, changes))
    }

    fn react(&mut self, before: &CatalogSnapshot, changes: &[SchemaChange]) -> AuditResult<()> {
        for change in changes.iter().filter(|c| c.object == ObjectKind::Table) {
            let table = change.name.as_str();
            match (change.kind, change.previous_name.as_deref()) {
                (ChangeKind::Create, _) => {
                    let resume = before.is_monitored(table);
                    if !(resume || self.policy.should_auto_provision(table))
                        || AuditTableNames::for_table(table).collides_with_engine()
                    {
                        continue;
                    }
                    if has_rowid(&self.tx, table)? {
                        self.provision_table(table)?;
                    } else {
                        tracing::warn!(table = %table, "Not monitoring WITHOUT ROWID table");
                    }
                }
                (ChangeKind::Drop, _) => {
                    if !is_engine_table(table) {
                        self.deprovision_table(table)?;
                    }
                }
                (ChangeKind::Alter, Some(previous)) => {
                    if before.is_monitored(previous) {
                        tracing::info!(from = %previous, to = %table, "Monitored table renamed");
                        self.deprovision_table(previous)?;
                        self.provision_table(table)?;
                    }
                }
                (ChangeKind::Alter, None) => {}
            }
        }
        Ok(())
    }
}
