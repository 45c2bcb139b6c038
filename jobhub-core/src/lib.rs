//! Core domain models and types for jobhub
//!
//! This crate contains the job definition contract, the registry that holds
//! definitions, the argument surface handed to job handlers, and the error
//! taxonomy shared by the hub and its worker processes. It has no knowledge
//! of processes or transports.

pub mod definition;
pub mod error;
pub mod ids;
pub mod interceptor;
pub mod job_arg;
pub mod normalize;
pub mod registry;

// Re-export commonly used types at the crate root
pub use definition::{JobDefinition, JobDefinitionBuilder, JobInfo, LifecycleHooks, Uniqueness};
pub use error::{
    DefinitionError, ForkError, ForkFailure, HandlerError, JobError, JobResult, SettledOutcome,
    WorkerExit,
};
pub use ids::{IdGenerator, JobId, SequentialIdGenerator, UuidIdGenerator};
pub use interceptor::{InterceptorChain, InterceptorPriority};
pub use job_arg::{AbortController, AbortSignal, JobArg, JobArgSink, Next};
pub use normalize::normalize;
pub use registry::JobRegistry;

/// JSON value type used for parameters, results and progress
pub type JsonValue = serde_json::Value;
