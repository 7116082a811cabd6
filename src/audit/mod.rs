//! Audit store: schema, record types, the store and its read surface.

mod error;
pub mod query;
pub mod schema;
mod shared;
mod store;
mod types;

pub use error::{AuditError, AuditResult};
pub use schema::{SCHEMA, SCHEMA_VERSION};
pub use shared::SharedStore;
pub use store::{default_database_path, Store};
pub use types::{
    AuditLogEntry, DdlLogEntry, Descriptor, DeprovisionOutcome, DmlType, FilterRule,
    GuardedOperation, ProvisionOutcome, Row,
};
