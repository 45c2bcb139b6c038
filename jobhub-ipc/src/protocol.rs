//! IPC protocol definitions and message types
//!
//! The exchange for one job is:
//!
//! 1. worker → hub `startup` once the worker process has bootstrapped
//! 2. hub → worker `payload` in response, carrying the job to run
//! 3. worker → hub zero or more `progress`
//! 4. worker → hub exactly one terminal `success` or `error`
//!
//! The hub may additionally send `abort` at any point after `payload`.

use chrono::{DateTime, Utc};
use jobhub_core::{JobError, JobId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// IPC protocol version for compatibility checking
pub const IPC_PROTOCOL_VERSION: u32 = 1;

/// Options forwarded to the worker alongside its payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeOptions {
    /// Log level the worker should use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Free-form settings for worker-side job loading
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub settings: JsonValue,
}

/// Messages sent from the hub to worker processes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// The job to run, sent in response to `startup`
    Payload {
        job_id: JobId,
        job_name: String,
        params: JsonValue,
        #[serde(default)]
        runtime_options: RuntimeOptions,
    },

    /// Abort the running job
    Abort { reason: JsonValue },
}

/// Messages sent from worker processes to the hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage {
    /// Worker has bootstrapped and is ready for its payload
    Startup { pid: u32 },

    /// Progress report
    Progress { value: JsonValue },

    /// Terminal: the job succeeded
    Success { result: JsonValue },

    /// Terminal: the job failed
    Error { error: JsonValue },
}

impl HubMessage {
    /// Build an `error` message from a job error
    pub fn error(error: &JobError) -> Self {
        let error = serde_json::to_value(error)
            .unwrap_or_else(|_| JsonValue::String(error.to_string()));
        HubMessage::Error { error }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, HubMessage::Success { .. } | HubMessage::Error { .. })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            HubMessage::Startup { .. } => "startup",
            HubMessage::Progress { .. } => "progress",
            HubMessage::Success { .. } => "success",
            HubMessage::Error { .. } => "error",
        }
    }
}

/// Decode the payload of an `error` message.
///
/// Returns the original payload if it is not a structured [`JobError`].
pub fn parse_reported_error(payload: JsonValue) -> Result<JobError, JsonValue> {
    match serde_json::from_value::<JobError>(payload.clone()) {
        Ok(error) => Ok(error),
        Err(_) => Err(payload),
    }
}

/// Message envelope for all IPC communications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub protocol_version: u32,
    pub timestamp: DateTime<Utc>,
    pub message: T,
}

impl<T> MessageEnvelope<T> {
    /// Create a new message envelope
    pub fn new(message: T) -> Self {
        Self {
            protocol_version: IPC_PROTOCOL_VERSION,
            timestamp: Utc::now(),
            message,
        }
    }

    /// Check if protocol version is compatible
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == IPC_PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_messages_are_type_tagged() {
        let startup = serde_json::to_value(HubMessage::Startup { pid: 42 }).unwrap();
        assert_eq!(startup, json!({"type": "startup", "pid": 42}));

        let payload = serde_json::to_value(WorkerMessage::Payload {
            job_id: JobId::from("j-1"),
            job_name: "resize".to_string(),
            params: json!({"w": 10}),
            runtime_options: RuntimeOptions::default(),
        })
        .unwrap();
        assert_eq!(payload["type"], "payload");
        assert_eq!(payload["job_id"], "j-1");
        assert_eq!(payload["runtime_options"], json!({}));
    }

    #[test]
    fn test_terminal_messages() {
        assert!(HubMessage::Success { result: json!(1) }.is_terminal());
        assert!(HubMessage::error(&JobError::failed("x")).is_terminal());
        assert!(!HubMessage::Progress { value: json!(1) }.is_terminal());
        assert!(!HubMessage::Startup { pid: 1 }.is_terminal());
    }

    #[test]
    fn test_structured_error_payload_decodes() {
        let HubMessage::Error { error } = HubMessage::error(&JobError::failed("boom")) else {
            panic!("expected error message");
        };
        assert_eq!(parse_reported_error(error).unwrap(), JobError::failed("boom"));
    }

    #[test]
    fn test_unstructured_error_payload_is_returned() {
        let payload = json!("something broke");
        assert_eq!(parse_reported_error(payload.clone()).unwrap_err(), payload);
        let payload = json!({"message": "no kind tag"});
        assert_eq!(parse_reported_error(payload.clone()).unwrap_err(), payload);
    }

    #[test]
    fn test_message_envelope() {
        let envelope = MessageEnvelope::new(WorkerMessage::Abort { reason: json!("X") });
        assert_eq!(envelope.protocol_version, IPC_PROTOCOL_VERSION);
        assert!(envelope.is_compatible());

        let json = serde_json::to_string(&envelope).unwrap();
        let deserialized: MessageEnvelope<WorkerMessage> = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.message, envelope.message);
    }
}
