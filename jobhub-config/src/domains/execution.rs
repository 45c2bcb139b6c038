//! Job execution configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigResult;
use crate::validation::{validate_at_most, validate_required_string, Validatable};

/// Upper bound on `max_concurrency`; anything larger is almost certainly a typo
const MAX_CONCURRENCY_LIMIT: usize = 4096;

/// Job execution configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Grace period after a job settles before its worker is asked to stop.
    /// Zero disables termination escalation.
    #[serde(with = "humantime_serde")]
    pub termination_timeout: Duration,

    /// Time between the graceful stop request and the forced kill
    #[serde(with = "humantime_serde")]
    pub kill_timeout: Duration,

    /// How long a freshly spawned worker has to report startup.
    /// Zero disables the startup timer.
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,

    /// Maximum number of jobs running at once; zero means unlimited
    pub max_concurrency: usize,

    /// How worker processes are launched
    pub worker: WorkerBootstrapConfig,
}

/// Worker process bootstrap configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerBootstrapConfig {
    /// Program to execute; defaults to the current executable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<PathBuf>,

    /// Arguments passed to the program
    pub args: Vec<String>,

    /// Extra environment variables for the worker
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl ExecutionConfig {
    /// Graceful termination delay, if escalation is enabled
    pub fn termination_delay(&self) -> Option<Duration> {
        (!self.termination_timeout.is_zero()).then_some(self.termination_timeout)
    }

    /// Startup timer duration, if enabled
    pub fn startup_deadline(&self) -> Option<Duration> {
        (!self.startup_timeout.is_zero()).then_some(self.startup_timeout)
    }

    /// Concurrency limit, if the gate is enabled
    pub fn concurrency_limit(&self) -> Option<usize> {
        (self.max_concurrency > 0).then_some(self.max_concurrency)
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            termination_timeout: default_termination_timeout(),
            kill_timeout: default_kill_timeout(),
            startup_timeout: default_startup_timeout(),
            max_concurrency: 0,
            worker: WorkerBootstrapConfig::default(),
        }
    }
}

impl Default for WorkerBootstrapConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: vec!["worker".to_string()],
            env: BTreeMap::new(),
        }
    }
}

impl Validatable for ExecutionConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_at_most(
            self.max_concurrency,
            MAX_CONCURRENCY_LIMIT,
            "max_concurrency",
            self.domain_name(),
        )?;

        self.worker.validate()?;

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "execution"
    }
}

impl Validatable for WorkerBootstrapConfig {
    fn validate(&self) -> ConfigResult<()> {
        if let Some(program) = &self.program {
            validate_required_string(&program.to_string_lossy(), "program", self.domain_name())?;
        }

        for arg in &self.args {
            validate_required_string(arg, "args entry", self.domain_name())?;
        }

        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') {
                return Err(self.validation_error(format!("invalid env variable name '{}'", key)));
            }
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "execution.worker"
    }
}

// Default value functions
fn default_termination_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_kill_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_startup_timeout() -> Duration {
    Duration::from_secs(30)
}
