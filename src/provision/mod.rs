//! Per-table audit store provisioning and guards.

pub(crate) mod guard;
pub mod naming;
mod provisioner;

pub use naming::{AuditTableNames, GuardNames};
pub use provisioner::{is_monitored, monitored_tables};
