//! Error types for job execution

use jobhub_config::ConfigError;
use jobhub_core::JobError;
use jobhub_ipc::IpcError;
use std::any::Any;
use thiserror::Error;

/// Execution engine errors
///
/// Failures of an individual job are never reported through this type; they
/// settle the job with a [`JobError`]. This covers setting the engine up and
/// running the worker side of the protocol.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<ConfigError> for ExecutionError {
    fn from(err: ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
