//! Configuration loader for YAML files and environment resolution
//!
//! `${NAME}` references are expanded as a text preprocessing step before the
//! YAML is parsed. A handful of well known environment variables then
//! override the parsed values.

use crate::config::types::AutotestConfig;
use crate::errors::AutotestError;
use regex::Regex;
use std::env;
use std::path::Path;
use tokio::fs;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_VAR: &str = "AUTOTESTER_CONFIG";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load from `path`, else from `AUTOTESTER_CONFIG`, else use defaults.
    pub async fn load(path: Option<&Path>) -> Result<AutotestConfig, AutotestError> {
        if let Some(path) = path {
            return Self::from_file(path).await;
        }
        match env::var(CONFIG_PATH_VAR) {
            Ok(path) if !path.is_empty() => Self::from_file(path).await,
            _ => {
                log::info!("No configuration file given, using defaults");
                Self::from_str("")
            }
        }
    }

    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<AutotestConfig, AutotestError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await.map_err(|e| {
            AutotestError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        log::debug!("Loaded configuration file {}", path.display());
        Self::from_str(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str) -> Result<AutotestConfig, AutotestError> {
        let expanded = Self::substitute_env(content)?;
        let mut config: AutotestConfig = if expanded.trim().is_empty() {
            AutotestConfig::default()
        } else {
            serde_yaml::from_str(&expanded).map_err(|e| {
                AutotestError::ConfigError(format!("Failed to parse YAML config: {}", e))
            })?
        };

        Self::apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Replace every `${NAME}` with the value of the environment variable
    /// `NAME`, or the empty string when it is unset.
    pub fn substitute_env(content: &str) -> Result<String, AutotestError> {
        let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
            .map_err(|e| AutotestError::InternalError(e.to_string()))?;
        let expanded = pattern.replace_all(content, |caps: &regex::Captures| {
            env::var(&caps[1]).unwrap_or_default()
        });
        Ok(expanded.into_owned())
    }

    fn apply_env_overrides(config: &mut AutotestConfig) -> Result<(), AutotestError> {
        if let Some(url) = non_empty_var("REDIS_URL") {
            config.redis_url = url;
        }
        if let Some(path) = non_empty_var("ERROR_LOG") {
            config.server.error_log = Some(path.into());
        }
        if let Some(path) = non_empty_var("ACCESS_LOG") {
            config.server.access_log = Some(path.into());
        }
        if let Some(timeout) = non_empty_var("SETTINGS_JOB_TIMEOUT") {
            config.settings_job_timeout = timeout.parse().map_err(|_| {
                AutotestError::ConfigError(format!(
                    "SETTINGS_JOB_TIMEOUT must be a whole number of seconds, got '{}'",
                    timeout
                ))
            })?;
        }
        Ok(())
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}
