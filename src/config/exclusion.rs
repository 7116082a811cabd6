//! Table exclusion patterns.
//!
//! Tables whose names match any pattern are never instrumented
//! automatically. An explicit provisioning request still wins.

use regex::Regex;

/// A set of compiled table-name patterns.
#[derive(Debug, Clone, Default)]
pub struct ExclusionList {
    patterns: Vec<Regex>,
}

impl ExclusionList {
    /// Create an empty exclusion list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    /// Compile a list of patterns.
    ///
    /// # Errors
    ///
    /// Returns the first pattern that fails to compile.
    pub fn from_patterns(patterns: &[String]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Add a pattern to the list.
    ///
    /// # Errors
    ///
    /// Returns an error if the pattern does not compile.
    pub fn add_pattern(&mut self, pattern: &str) -> Result<(), regex::Error> {
        self.patterns.push(Regex::new(pattern)?);
        Ok(())
    }

    /// Check a table name against all patterns.
    #[must_use]
    pub fn is_excluded(&self, table: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(table))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Get the pattern strings (for debugging/display).
    #[must_use]
    pub fn patterns(&self) -> Vec<&str> {
        self.patterns.iter().map(Regex::as_str).collect()
    }
}
