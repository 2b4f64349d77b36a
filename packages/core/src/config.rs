//! Session configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{ConfigParseSnafu, ConfigReadSnafu, Result};

/// Behaviour switches of a mount point mapping session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MappingConfig {
    /// Treat constraint mismatches (required filesystem, encryption) as
    /// blocking instead of only showing them on the row.
    pub enforce_constraints: bool,
    /// Keep editing the current manual partitioning instead of creating a
    /// new one when the session starts.
    pub reuse_partitioning: bool,
    /// Reset a previously applied partitioning that differs from the one
    /// being edited.
    pub reset_applied_partitioning: bool,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            enforce_constraints: true,
            reuse_partitioning: true,
            reset_applied_partitioning: true,
        }
    }
}

impl MappingConfig {
    /// Loads a configuration file. Missing keys take their default value.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).context(ConfigReadSnafu { path })?;
        serde_json::from_str(&content).context(ConfigParseSnafu { path })
    }

    /// Loads a configuration file if given, otherwise returns the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_config_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "enforce-constraints": false }}"#).unwrap();

        let config = MappingConfig::load(file.path()).unwrap();
        assert!(!config.enforce_constraints);
        assert!(config.reuse_partitioning);
        assert!(config.reset_applied_partitioning);
    }

    #[test]
    fn test_missing_config_file() {
        let err = MappingConfig::load(Path::new("/nonexistent/mountmap.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/mountmap.json"));
        assert_eq!(MappingConfig::load_or_default(None).unwrap(), MappingConfig::default());
    }
}
