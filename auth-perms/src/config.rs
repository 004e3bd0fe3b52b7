use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Environment variable prefix, e.g. `PERMS_MAX_DEPTH=20`
pub const ENV_PREFIX: &str = "PERMS";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Permission engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PermsConfig {
    /// Maximum membership hops followed during resolution (default: 100)
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Global permissions every new principal starts with
    #[serde(default)]
    pub signup_perms: Vec<String>,

    /// Permissions granted to a creator on each object it registers
    #[serde(default)]
    pub creator_perms: Vec<String>,

    /// PostgreSQL connection string; in-memory store when absent
    #[serde(default)]
    pub database_url: Option<String>,

    /// Default tracing filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl PermsConfig {
    /// Layers an optional file (YAML, TOML or JSON, by extension) under
    /// `PERMS_*` environment variables. Nested keys use `__`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("signup_perms")
                    .with_list_parse_key("creator_perms")
                    .try_parsing(true),
            )
            .build()?;

        let config: PermsConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_depth == 0 {
            return Err(ConfigError::Invalid("max_depth must be at least 1".to_string()));
        }
        if self.log_level.trim().is_empty() {
            return Err(ConfigError::Invalid("log_level must not be empty".to_string()));
        }
        Ok(())
    }
}

impl Default for PermsConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            signup_perms: Vec::new(),
            creator_perms: Vec::new(),
            database_url: None,
            log_level: default_log_level(),
        }
    }
}

fn default_max_depth() -> usize {
    crate::graph::DEFAULT_MAX_DEPTH
}

fn default_log_level() -> String {
    "info".to_string()
}
