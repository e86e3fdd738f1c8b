//! Configuration for the analysis pipeline
//!
//! Every component receives its configuration explicitly at construction.
//! `CollabConfig::load` layers an optional TOML file under `COLLABEVAL__*`
//! environment variables (for example `COLLABEVAL__ANALYSIS__MODEL`).

use crate::error::{CollabError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "COLLABEVAL";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    pub analysis: AnalysisConfig,
    pub inference: InferenceConfig,
    pub storage: StorageConfig,
}

/// Retry controller and prompt settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Model identifier sent with each inference request
    pub model: String,

    /// Schema version stamped on new records
    pub schema_version: String,

    /// Upper bound on inference attempts per participant
    pub max_attempts: u32,

    /// Temperature of the first attempt
    pub base_temperature: f32,

    /// Temperature added per retry
    pub temperature_step: f32,

    /// Temperature never exceeds this value
    pub temperature_cap: f32,

    /// Timeout for a single inference call (in seconds)
    #[serde(with = "serde_duration")]
    pub request_timeout: Duration,

    /// Feedback used when the model omits it
    pub feedback_placeholder: String,

    /// Directory for per-attempt interaction logs (disabled when unset)
    pub interaction_log_dir: Option<PathBuf>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            model: "deepseek-r1:8b".to_string(),
            schema_version: "0.7.0".to_string(),
            max_attempts: 5,
            base_temperature: 0.3,
            temperature_step: 0.15,
            temperature_cap: 0.7,
            request_timeout: Duration::from_secs(30),
            feedback_placeholder: "No feedback content".to_string(),
            interaction_log_dir: None,
        }
    }
}

/// HTTP inference endpoint settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// OpenAI-compatible chat completions URL
    pub endpoint: String,

    /// Bearer token; local endpoints usually need none
    pub api_key: Option<String>,

    pub max_tokens: Option<u32>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434/v1/chat/completions".to_string(),
            api_key: None,
            max_tokens: None,
        }
    }
}

/// Storage locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// libsql database holding mappings, users and records
    pub database_path: PathBuf,

    /// Directory of JSON records written by earlier releases
    pub legacy_records_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            legacy_records_dir: None,
        }
    }
}

/// Default database path under the platform data directory
pub fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("collabeval")
        .join("collabeval.db")
}

impl CollabConfig {
    /// Load from an optional TOML file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            debug!("Loading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let config: CollabConfig = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: CollabConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.analysis.validate()
    }
}

impl AnalysisConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(CollabError::Config("analysis.model must not be empty".into()));
        }

        if self.schema_version.trim().is_empty() {
            return Err(CollabError::Config(
                "analysis.schema_version must not be empty".into(),
            ));
        }

        if self.max_attempts == 0 {
            return Err(CollabError::Config(
                "analysis.max_attempts must be at least 1".into(),
            ));
        }

        if self.base_temperature < 0.0 || self.temperature_step < 0.0 {
            return Err(CollabError::Config(
                "analysis temperatures must not be negative".into(),
            ));
        }

        if self.temperature_cap < self.base_temperature {
            return Err(CollabError::Config(
                "analysis.temperature_cap must be >= base_temperature".into(),
            ));
        }

        if self.request_timeout.is_zero() {
            return Err(CollabError::Config(
                "analysis.request_timeout must be positive".into(),
            ));
        }

        Ok(())
    }
}

// Custom serde module for Duration (serialize/deserialize as seconds)
mod serde_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
