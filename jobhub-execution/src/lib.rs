//! jobhub execution engine
//!
//! This crate runs submitted jobs. It owns the per-job state machine
//! ([`TrackedJob`]), the supervisor that drives one worker process through
//! the IPC handshake ([`WorkerSupervisor`]), the scheduler with its dedup
//! index ([`JobHub`]), the optional admission stage ([`ConcurrencyGate`]),
//! the termination escalation for finished workers ([`TerminationWatchdog`]),
//! and the worker-side mirror of the protocol ([`WorkerRuntime`]).

pub mod error;
pub mod events;
pub mod gate;
pub mod interceptors;
pub mod job;
pub mod scheduler;
pub mod supervisor;
pub mod transport;
pub mod watchdog;
pub mod worker;

// Re-export main types
pub use error::{ExecutionError, ExecutionResult};
pub use events::{HubEvent, JobEvent};
pub use gate::{ConcurrencyGate, GateStatus, GatedJob};
pub use interceptors::{CreateJobRequest, Interceptors, LoadJobRequest, SupervisorOptions};
pub use job::{JobStage, OutcomeHandle, TrackedJob};
pub use scheduler::{JobHub, JobHubBuilder};
pub use supervisor::{SupervisorState, WorkerSupervisor};
pub use transport::{
    local::LocalTransport, process::ProcessTransport, ChannelEvent, ForkSpec, SpawnedWorker,
    WorkerLink, WorkerTransport,
};
pub use watchdog::TerminationWatchdog;
pub use worker::WorkerRuntime;
