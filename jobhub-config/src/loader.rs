//! Configuration loading and environment variable handling

use crate::domains::utils::parse_duration;
use crate::domains::JobhubConfig;
use crate::error::{ConfigError, ConfigResult};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "JOBHUB".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<JobhubConfig> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut config: JobhubConfig = if content.trim().is_empty() {
            JobhubConfig::default()
        } else {
            serde_yaml::from_str(&content)?
        };
        tracing::debug!(path = %path.display(), "Loaded configuration file");

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<JobhubConfig> {
        let mut config = JobhubConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<JobhubConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut JobhubConfig) -> ConfigResult<()> {
        self.apply_execution_overrides(&mut config.execution)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    /// Apply execution config overrides
    fn apply_execution_overrides(
        &self,
        config: &mut crate::domains::execution::ExecutionConfig,
    ) -> ConfigResult<()> {
        if let Some(timeout) = self.duration_var("TERMINATION_TIMEOUT")? {
            config.termination_timeout = timeout;
        }

        if let Some(timeout) = self.duration_var("KILL_TIMEOUT")? {
            config.kill_timeout = timeout;
        }

        if let Some(timeout) = self.duration_var("STARTUP_TIMEOUT")? {
            config.startup_timeout = timeout;
        }

        if let Ok(max) = self.get_env_var("MAX_CONCURRENCY") {
            config.max_concurrency = max.trim().parse().map_err(|e| {
                ConfigError::EnvError(format!("Invalid {}: {}", self.var_name("MAX_CONCURRENCY"), e))
            })?;
        }

        if let Ok(program) = self.get_env_var("WORKER_PROGRAM") {
            config.worker.program = Some(PathBuf::from(program));
        }

        Ok(())
    }

    /// Apply logging config overrides
    fn apply_logging_overrides(
        &self,
        config: &mut crate::domains::logging::LoggingConfig,
    ) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = crate::domains::logging::LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = crate::domains::logging::LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    fn duration_var(&self, name: &str) -> ConfigResult<Option<std::time::Duration>> {
        match self.get_env_var(name) {
            Ok(value) => parse_duration(&value).map(Some).map_err(|e| {
                ConfigError::EnvError(format!("Invalid {}: {}", self.var_name(name), e))
            }),
            Err(_) => Ok(None),
        }
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}_{}", self.prefix, name)
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(self.var_name(name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
