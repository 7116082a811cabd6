//! Locating and reading the rowtrail configuration file.
//!
//! Candidates, first match wins:
//!
//! 1. the file named by `ROWTRAIL_CONFIG`
//! 2. `.rowtrail.toml` in the working directory
//! 3. `rowtrail/config.toml` under the user config directory
//!
//! With no file present the defaults apply.

use std::path::{Path, PathBuf};

use super::exclusion::ExclusionList;
use super::types::TrailConfig;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV: &str = "ROWTRAIL_CONFIG";

/// Finds and parses the configuration file.
#[derive(Debug)]
pub struct ConfigLoader {
    candidates: Vec<PathBuf>,
}

impl ConfigLoader {
    /// Loader over the standard candidates, honouring `ROWTRAIL_CONFIG`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_override(std::env::var_os(CONFIG_ENV).map(PathBuf::from))
    }

    fn with_override(explicit: Option<PathBuf>) -> Self {
        let mut candidates: Vec<PathBuf> = explicit.into_iter().collect();
        candidates.push(PathBuf::from(".rowtrail.toml"));
        candidates.extend(dirs::config_dir().map(|dir| dir.join("rowtrail").join("config.toml")));
        Self { candidates }
    }

    /// Loader that only considers `path`.
    #[must_use]
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            candidates: vec![path],
        }
    }

    /// Load the first candidate file, or the defaults when none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid TOML, or
    /// lists an exclusion pattern that does not compile.
    pub fn load(&self) -> Result<TrailConfig, ConfigError> {
        match self.find_config_file() {
            Some(path) => {
                tracing::debug!(path = %path.display(), "Loading rowtrail config");
                read_config(&path)
            }
            None => {
                tracing::debug!(candidates = ?self.candidates, "No rowtrail config found");
                Ok(TrailConfig::default())
            }
        }
    }

    /// Candidate files in the order they are tried.
    #[must_use]
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.candidates
    }

    /// The candidate [`ConfigLoader::load`] would read.
    #[must_use]
    pub fn find_config_file(&self) -> Option<PathBuf> {
        self.candidates.iter().find(|p| p.is_file()).cloned()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn read_config(path: &Path) -> Result<TrailConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;
    let config: TrailConfig = toml::from_str(&content).map_err(|source| ConfigError::ParseError {
        path: path.to_path_buf(),
        source,
    })?;

    ExclusionList::from_patterns(&config.audit.excluded_tables).map_err(|source| {
        ConfigError::PatternError {
            path: path.to_path_buf(),
            source,
        }
    })?;
    Ok(config)
}

/// Errors that can occur during configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid excluded_tables pattern in {path}: {source}")]
    PatternError {
        path: PathBuf,
        source: regex::Error,
    },
}
