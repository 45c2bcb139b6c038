//! Extension points of the hub and the worker runtime
//!
//! Each field is an ordered [`InterceptorChain`] around the default
//! behavior. Interceptors run synchronously and must not call back into
//! the hub that invokes them.

use jobhub_core::{
    InterceptorChain, JobArg, JobDefinition, JobId, JobResult, JsonValue,
};
use jobhub_ipc::RuntimeOptions;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::job::TrackedJob;
use crate::transport::{ForkSpec, WorkerTransport};

/// Input of the job creation chain
#[derive(Clone)]
pub struct CreateJobRequest {
    pub definition: Arc<JobDefinition>,
    pub id: JobId,
    pub params: JsonValue,
}

/// Input and output of the supervisor construction chain
#[derive(Clone)]
pub struct SupervisorOptions {
    pub spec: ForkSpec,
    pub transport: Arc<dyn WorkerTransport>,
    pub startup_timeout: Option<Duration>,
}

impl fmt::Debug for SupervisorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisorOptions")
            .field("spec", &self.spec)
            .field("transport", &self.transport.name())
            .field("startup_timeout", &self.startup_timeout)
            .finish()
    }
}

/// Input of the worker-side job loading chain
#[derive(Debug, Clone)]
pub struct LoadJobRequest {
    pub job_name: String,
    pub runtime_options: RuntimeOptions,
}

#[derive(Default)]
pub struct Interceptors {
    /// Hub: construction of a tracked job for an accepted submission
    pub create_job: InterceptorChain<CreateJobRequest, JobResult<Arc<TrackedJob>>>,
    /// Hub: the fork arguments and options of a dispatched job
    pub fork_options: InterceptorChain<ForkSpec, ForkSpec>,
    /// Hub: construction of the worker supervisor
    pub create_supervisor: InterceptorChain<SupervisorOptions, SupervisorOptions>,
    /// Worker: resolving the definition named in the payload
    pub load_job: InterceptorChain<LoadJobRequest, JobResult<Arc<JobDefinition>>>,
    /// Worker: the argument handed to `run`
    pub job_arg: InterceptorChain<JobArg, JobArg>,
}

impl Interceptors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.create_job.is_empty()
            && self.fork_options.is_empty()
            && self.create_supervisor.is_empty()
            && self.load_job.is_empty()
            && self.job_arg.is_empty()
    }
}

impl fmt::Debug for Interceptors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptors")
            .field("create_job", &self.create_job)
            .field("fork_options", &self.fork_options)
            .field("create_supervisor", &self.create_supervisor)
            .field("load_job", &self.load_job)
            .field("job_arg", &self.job_arg)
            .finish()
    }
}
