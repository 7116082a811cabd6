//! Runtime provisioning policy derived from configuration.

use crate::audit::AuditResult;
use crate::config::{AuditSettings, ExclusionList};
use crate::provision::naming::is_engine_table;

/// Decides which tables the engine instruments on its own.
#[derive(Debug, Clone)]
pub struct AuditPolicy {
    schema_name: String,
    exclusions: ExclusionList,
    auto_provision: bool,
}

impl AuditPolicy {
    /// Build a policy from the `[audit]` configuration section.
    ///
    /// # Errors
    ///
    /// Returns `AuditError::InvalidPattern` if an exclusion pattern does not
    /// compile.
    pub fn from_settings(settings: &AuditSettings) -> AuditResult<Self> {
        Ok(Self {
            schema_name: settings.schema_name.clone(),
            exclusions: ExclusionList::from_patterns(&settings.excluded_tables)?,
            auto_provision: settings.auto_provision,
        })
    }

    /// Schema name recorded in the DDL log.
    #[must_use]
    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    #[must_use]
    pub fn auto_provision(&self) -> bool {
        self.auto_provision
    }

    /// Whether configuration excludes the table from auto-provisioning.
    #[must_use]
    pub fn is_excluded(&self, table: &str) -> bool {
        self.exclusions.is_excluded(table)
    }

    /// Whether a table may be instrumented without an explicit request.
    #[must_use]
    pub fn is_candidate(&self, table: &str) -> bool {
        !is_engine_table(table) && !self.is_excluded(table)
    }

    /// Whether a newly created table should be provisioned right away.
    #[must_use]
    pub fn should_auto_provision(&self, table: &str) -> bool {
        self.auto_provision && self.is_candidate(table)
    }
}

impl Default for AuditPolicy {
    fn default() -> Self {
        Self {
            schema_name: "main".to_string(),
            exclusions: ExclusionList::new(),
            auto_provision: true,
        }
    }
}
