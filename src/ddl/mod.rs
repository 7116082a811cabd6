//! Schema-change auditing.

mod catalog;
mod observer;

pub use catalog::{CatalogObject, CatalogSnapshot, ChangeKind, ObjectKind, SchemaChange};
