//! Events published by tracked jobs and re-published by the hub

use jobhub_core::{JobError, JobId, JsonValue};
use serde::{Deserialize, Serialize};

/// Lifecycle event of a single tracked job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Created,
    Started,
    /// A worker was spawned for the job
    Forked {
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    Progress { value: JsonValue },
    Success { result: JsonValue },
    Failure { error: JobError },
    /// The watchdog asked the job's worker to stop
    Terminate { force_kill: bool },
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Created => "created",
            JobEvent::Started => "started",
            JobEvent::Forked { .. } => "forked",
            JobEvent::Progress { .. } => "progress",
            JobEvent::Success { .. } => "success",
            JobEvent::Failure { .. } => "failure",
            JobEvent::Terminate { .. } => "terminate",
        }
    }
}

/// A job event with the originating job attached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubEvent {
    pub job_id: JobId,
    pub job_name: String,
    #[serde(flatten)]
    pub event: JobEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hub_event_wire_shape() {
        let event = HubEvent {
            job_id: JobId::from("job-1"),
            job_name: "resize".to_string(),
            event: JobEvent::Terminate { force_kill: true },
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"job_id": "job-1", "job_name": "resize", "type": "terminate", "force_kill": true})
        );
        assert_eq!(event.event.name(), "terminate");
    }
}
