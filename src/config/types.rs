//! Configuration types.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrailConfig {
    /// Database location and connection settings.
    pub database: DatabaseConfig,
    /// Audit engine settings.
    pub audit: AuditSettings,
}

/// Database connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file; the platform data directory when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// How long a writer waits for another writer's lock, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Audit engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSettings {
    /// Schema name recorded in the DDL log.
    #[serde(default = "default_schema_name")]
    pub schema_name: String,
    /// Columns filtered on every table, seeded when the store opens.
    #[serde(default = "default_global_filters")]
    pub global_filters: Vec<String>,
    /// Columns filtered per table, seeded when the store opens.
    #[serde(default)]
    pub table_filters: BTreeMap<String, Vec<String>>,
    /// Regex patterns of tables never provisioned automatically.
    #[serde(default)]
    pub excluded_tables: Vec<String>,
    /// Provision tables as soon as they are created.
    #[serde(default = "default_true")]
    pub auto_provision: bool,
    /// Provision every existing user table when the store opens.
    #[serde(default = "default_true")]
    pub backfill_on_open: bool,
}

fn default_schema_name() -> String {
    "main".to_string()
}

fn default_global_filters() -> Vec<String> {
    vec!["updatedAt".to_string()]
}

fn default_true() -> bool {
    true
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            schema_name: default_schema_name(),
            global_filters: default_global_filters(),
            table_filters: BTreeMap::new(),
            excluded_tables: Vec::new(),
            auto_provision: true,
            backfill_on_open: true,
        }
    }
}
