use serde::Deserialize;
use std::{fs, io, path::Path, time::Duration};

/// Tuning for a [Scheduler](crate::Scheduler) and the fetch tasks of a
/// [Loader](crate::Loader).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of tasks executing at the same time. Unbounded when
    /// unset.
    pub max_concurrent_tasks: Option<usize>,

    /// How long a single fetch may take before it fails. Unbounded when
    /// unset.
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Option<Duration>,
}

impl Config {
    /// Parses a config from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a YAML config file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let yaml = fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_tasks == Some(0) {
            return Err(ConfigError::Invalid(
                "max_concurrent_tasks must be at least 1",
            ));
        }
        if self.fetch_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::Invalid("fetch_timeout must not be zero"));
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file")]
    Io(#[from] io::Error),
    #[error("failed to parse config")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}
