//! rowtrail - transactional change-data-capture and append-only audit
//! logging for `SQLite` tables.
//!
//! Writes flow through an [`AuditedTx`] carrying the [`ActionContext`] of
//! the action that caused them. Monitored tables get an append-only log
//! table (`ZAL<table>`) whose rows commit atomically with the change they
//! record; schema changes made through the same layer land in `ZALDDL`.

pub mod audit;
pub mod capture;
pub mod config;
pub mod ddl;
pub mod provision;
pub mod registry;

pub use audit::{AuditError, AuditResult, SharedStore, Store};
pub use capture::{ActionContext, AuditedTx};
