//! Error taxonomy for job orchestration
//!
//! Every failure a submission can observe is a [`JobError`]. The type is
//! cloneable so that deduplicated submissions can share one outcome, and
//! serializable so that a worker process can report it over the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use thiserror::Error;

/// Result type alias for job operations
pub type JobResult<T> = std::result::Result<T, JobError>;

/// Top-level job error
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum JobError {
    /// Registry and definition-shape errors
    #[error("Definition error: {0}")]
    Definition(DefinitionError),

    /// Caller parameters rejected by a definition's validator
    #[error("Validation failed for job {job_name}: {message}")]
    Validation {
        job_name: String,
        message: String,
        param: Option<String>,
        value: Option<JsonValue>,
    },

    /// A `unique_key` implementation returned something other than a string or null
    #[error("Unique key for job {job_name} must be a string or null, got {returned}")]
    Uniqueness { job_name: String, returned: String },

    /// Worker process or protocol failure
    #[error("{0}")]
    Fork(ForkError),

    /// A success or failure lifecycle hook failed while handling an outcome
    #[error("{0}")]
    Handler(Box<HandlerError>),

    /// The job was aborted before it settled
    #[error("Job aborted: {reason}")]
    Aborted { reason: JsonValue },

    /// An error reported by a job handler
    #[error("{message}")]
    Failed {
        message: String,
        data: Option<JsonValue>,
    },
}

impl JobError {
    /// Create a handler failure with a message
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            data: None,
        }
    }

    /// Create a handler failure carrying structured data
    pub fn failed_with(message: impl Into<String>, data: JsonValue) -> Self {
        Self::Failed {
            message: message.into(),
            data: Some(data),
        }
    }

    /// Create a validation error without parameter context
    pub fn validation(job_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            job_name: job_name.into(),
            message: message.into(),
            param: None,
            value: None,
        }
    }

    /// Create a validation error naming the offending parameter
    pub fn invalid_param(
        job_name: impl Into<String>,
        param: impl Into<String>,
        value: JsonValue,
        message: impl Into<String>,
    ) -> Self {
        Self::Validation {
            job_name: job_name.into(),
            message: message.into(),
            param: Some(param.into()),
            value: Some(value),
        }
    }

    /// Create an abort error
    pub fn aborted(reason: impl Into<JsonValue>) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    /// Create a job-not-found error
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::Definition(DefinitionError::NotFound { name: name.into() })
    }

    /// Short machine-readable kind, used in logs and events
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Definition(_) => "definition",
            JobError::Validation { .. } => "validation",
            JobError::Uniqueness { .. } => "uniqueness",
            JobError::Fork(_) => "fork",
            JobError::Handler(_) => "handler",
            JobError::Aborted { .. } => "aborted",
            JobError::Failed { .. } => "failed",
        }
    }

    pub fn is_fork(&self) -> bool {
        matches!(self, JobError::Fork(_))
    }

    pub fn as_fork(&self) -> Option<&ForkError> {
        match self {
            JobError::Fork(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DefinitionError> for JobError {
    fn from(err: DefinitionError) -> Self {
        JobError::Definition(err)
    }
}

impl From<ForkError> for JobError {
    fn from(err: ForkError) -> Self {
        JobError::Fork(err)
    }
}

impl From<HandlerError> for JobError {
    fn from(err: HandlerError) -> Self {
        JobError::Handler(Box::new(err))
    }
}

/// Definition and registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DefinitionError {
    #[error("Job not found: {name}")]
    NotFound { name: String },

    #[error("Job already registered: {name}")]
    AlreadyRegistered { name: String },

    #[error("Malformed job definition {name}: {message}")]
    Malformed { name: String, message: String },
}

/// Worker failure normalized for the owning job
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub struct ForkError {
    pub job_name: String,
    pub job_id: String,
    pub failure: ForkFailure,
    /// Abort that was still waiting to reach the worker when it failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<JsonValue>,
}

impl ForkError {
    pub fn new(job_name: impl Into<String>, job_id: impl Into<String>, failure: ForkFailure) -> Self {
        Self {
            job_name: job_name.into(),
            job_id: job_id.into(),
            failure,
            abort_reason: None,
        }
    }

    pub fn with_abort_reason(mut self, reason: JsonValue) -> Self {
        self.abort_reason = Some(reason);
        self
    }
}

impl fmt::Display for ForkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Worker for job {} ({}) failed: {}",
            self.job_name, self.job_id, self.failure
        )?;
        if let Some(reason) = &self.abort_reason {
            write!(f, " (abort pending: {})", reason)?;
        }
        Ok(())
    }
}

/// What went wrong with a worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ForkFailure {
    /// The worker process could not be spawned
    Spawn { message: String },

    /// No startup message arrived within the startup window
    StartupTimeout { timeout_ms: u64 },

    /// The channel closed before the worker reported an outcome
    Disconnected { exit: Option<WorkerExit> },

    /// Transport-level error reading from or talking to the process
    Transport { message: String },

    /// Sending a message to the worker failed
    Send { message: String },

    /// The worker reported an error that is not a structured job error
    MalformedError { payload: JsonValue },
}

impl fmt::Display for ForkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForkFailure::Spawn { message } => write!(f, "failed to spawn worker: {}", message),
            ForkFailure::StartupTimeout { timeout_ms } => {
                write!(f, "worker did not start within {}ms", timeout_ms)
            }
            ForkFailure::Disconnected { exit: Some(exit) } => {
                write!(f, "worker disconnected before settling ({})", exit)
            }
            ForkFailure::Disconnected { exit: None } => {
                write!(f, "worker disconnected before settling")
            }
            ForkFailure::Transport { message } => write!(f, "transport error: {}", message),
            ForkFailure::Send { message } => write!(f, "failed to send to worker: {}", message),
            ForkFailure::MalformedError { payload } => {
                write!(f, "worker reported a malformed error: {}", payload)
            }
        }
    }
}

/// Exit status of a worker process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// The outcome a lifecycle hook was handling when it failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum SettledOutcome {
    Success(JsonValue),
    Failure(JobError),
}

impl fmt::Display for SettledOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettledOutcome::Success(value) => write!(f, "success {}", value),
            SettledOutcome::Failure(err) => write!(f, "failure '{}'", err),
        }
    }
}

/// Composite error: the hook failure plus the outcome it was handling
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("Lifecycle hook failed: {error} (while handling {original})")]
pub struct HandlerError {
    pub original: SettledOutcome,
    pub error: JobError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_kinds() {
        assert_eq!(JobError::not_found("x").kind(), "definition");
        assert_eq!(JobError::failed("boom").kind(), "failed");
        assert_eq!(JobError::aborted("X").kind(), "aborted");
        assert!(JobError::from(ForkError::new(
            "job",
            "id-1",
            ForkFailure::StartupTimeout { timeout_ms: 10 }
        ))
        .is_fork());
    }

    #[test]
    fn test_handler_error_keeps_both_sides() {
        let err: JobError = HandlerError {
            original: SettledOutcome::Success(json!({"ok": true})),
            error: JobError::failed("hook exploded"),
        }
        .into();

        match &err {
            JobError::Handler(inner) => {
                assert_eq!(inner.original, SettledOutcome::Success(json!({"ok": true})));
                assert_eq!(inner.error, JobError::failed("hook exploded"));
            }
            other => panic!("expected handler error, got {:?}", other),
        }
        assert!(err.to_string().contains("hook exploded"));
    }

    #[test]
    fn test_error_wire_format() {
        let err = JobError::from(ForkError::new(
            "resize",
            "job-7",
            ForkFailure::Disconnected {
                exit: Some(WorkerExit {
                    code: Some(1),
                    signal: None,
                }),
            },
        ));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["kind"], "fork");
        assert_eq!(value["detail"]["failure"]["reason"], "disconnected");

        let back: JobError = serde_json::from_value(value).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_fork_failure_display() {
        let failure = ForkFailure::Disconnected {
            exit: Some(WorkerExit {
                code: None,
                signal: Some(9),
            }),
        };
        assert_eq!(failure.to_string(), "worker disconnected before settling (signal 9)");
    }
}
