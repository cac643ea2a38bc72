//! Run settings shared by every prediction mode.
//!
//! Defaults live in code. A TOML file may override any subset of fields.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Environment variable holding the 1-based index of an array-job task.
pub const TASK_ID_VAR: &str = "SGE_TASK_ID";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read settings file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML settings file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("n_splits must be at least 2, got {0}.")]
    TooFewSplits(usize),
    #[error("{field} must be at least 2, got {value}.")]
    TooFewGridPoints { field: &'static str, value: usize },
    #[error("variance_threshold must lie in (0, 1], got {0}.")]
    InvalidThreshold(f64),
    #[error("subject_key must name at least one column.")]
    EmptySubjectKey,
    #[error("No seed was given and SGE_TASK_ID is not set.")]
    MissingSeed,
    #[error("SGE_TASK_ID must be a positive integer, got '{0}'.")]
    InvalidTaskId(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunSettings {
    /// Folds in every cross-validation loop.
    pub n_splits: usize,
    /// Points per hyperparameter axis in nested mode.
    pub nested_grid_points: usize,
    /// Points per hyperparameter axis in lesion mode.
    pub lesion_grid_points: usize,
    /// Cumulative explained-variance fraction the PCA must reach.
    pub variance_threshold: f64,
    /// Columns that together identify a subject in both input tables.
    pub subject_key: Vec<String>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            n_splits: 10,
            nested_grid_points: 20,
            lesion_grid_points: 10,
            variance_threshold: 0.9,
            subject_key: vec!["bblid".to_string(), "scanid".to_string()],
        }
    }
}

impl RunSettings {
    /// Reads settings from a TOML file; omitted fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let settings: RunSettings = toml::from_str(&text)?;
        settings.validate()?;
        log::info!("Loaded run settings from '{}'", path.display());
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_splits < 2 {
            return Err(ConfigError::TooFewSplits(self.n_splits));
        }
        for (field, value) in [
            ("nested_grid_points", self.nested_grid_points),
            ("lesion_grid_points", self.lesion_grid_points),
        ] {
            if value < 2 {
                return Err(ConfigError::TooFewGridPoints { field, value });
            }
        }
        if !(self.variance_threshold > 0.0 && self.variance_threshold <= 1.0) {
            return Err(ConfigError::InvalidThreshold(self.variance_threshold));
        }
        if self.subject_key.is_empty() {
            return Err(ConfigError::EmptySubjectKey);
        }
        Ok(())
    }
}

/// Resolves the run seed: an explicit value wins, otherwise the array-job
/// task index minus one.
pub fn resolve_seed(explicit: Option<u64>, task_id: Option<&str>) -> Result<u64, ConfigError> {
    if let Some(seed) = explicit {
        return Ok(seed);
    }
    let raw = task_id.ok_or(ConfigError::MissingSeed)?;
    match raw.trim().parse::<u64>() {
        Ok(id) if id >= 1 => Ok(id - 1),
        _ => Err(ConfigError::InvalidTaskId(raw.to_string())),
    }
}
