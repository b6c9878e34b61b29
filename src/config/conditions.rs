//! Alert condition definitions loaded from configuration.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::storage::NewCondition;

use super::validation::{ConfigError, expand_env_vars};

/// Condition definitions of one config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionsConfig {
    #[serde(default)]
    pub conditions: Vec<NewCondition>,
}

impl ConditionsConfig {
    /// Merge another set of definitions into this one.
    #[must_use]
    pub fn merge(mut self, other: ConditionsConfig) -> Self {
        self.conditions.extend(other.conditions);
        self
    }

    /// Validate every definition and reject duplicate names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for condition in &self.conditions {
            condition.validate().map_err(ConfigError::invalid)?;
            if !seen.insert(condition.name.trim()) {
                return Err(ConfigError::invalid(format!(
                    "duplicate condition name: '{}'",
                    condition.name
                )));
            }
        }
        Ok(())
    }

    /// Load definitions from all YAML files in a directory.
    ///
    /// Files are read in name order so merges are deterministic.
    pub fn load_from_dir(dir_path: &str) -> Result<Self, ConfigError> {
        let dir = Path::new(dir_path);
        if !dir.is_dir() {
            return Err(ConfigError::invalid(format!(
                "condition_path '{dir_path}' is not a directory"
            )));
        }

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if path.is_file() && is_yaml {
                paths.push(path);
            }
        }
        paths.sort();

        let mut merged = Self::default();
        for path in paths {
            tracing::debug!(path = %path.display(), "Loading condition definitions");
            let content = expand_env_vars(&std::fs::read_to_string(&path)?);
            let file: Self = serde_yaml::from_str(&content).map_err(|e| {
                ConfigError::invalid(format!("failed to parse '{}': {}", path.display(), e))
            })?;
            merged = merged.merge(file);
        }
        Ok(merged)
    }
}
