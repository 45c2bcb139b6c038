//! Job hub: submission, deduplication and the in-flight indices
//!
//! [`JobHub::submit`] resolves the definition and its uniqueness policy,
//! returns the in-flight instance when a deduplicated submission matches
//! one, and otherwise creates a [`TrackedJob`], indexes it and starts it
//! (through the concurrency gate when one is configured). Settled jobs are
//! removed from every index before their worker is handed to the
//! termination watchdog.

use jobhub_config::validation::Validatable;
use jobhub_config::ExecutionConfig;
use jobhub_core::{
    normalize, IdGenerator, JobDefinition, JobError, JobId, JobRegistry, JobResult, JsonValue,
    Uniqueness, UuidIdGenerator,
};
use jobhub_ipc::RuntimeOptions;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{panic_message, ExecutionResult};
use crate::events::{HubEvent, JobEvent};
use crate::gate::{ConcurrencyGate, GateStatus};
use crate::interceptors::{CreateJobRequest, Interceptors};
use crate::job::{DispatchContext, TrackedJob};
use crate::transport::process::ProcessTransport;
use crate::transport::WorkerTransport;
use crate::watchdog::TerminationWatchdog;

const HUB_EVENT_CAPACITY: usize = 256;

/// In-flight jobs by id, plus the dedup index and its reverse
#[derive(Default)]
struct JobIndex {
    by_id: HashMap<JobId, Arc<TrackedJob>>,
    unique: HashMap<String, HashMap<Uniqueness, JobId>>,
    keys: HashMap<String, HashMap<JobId, Uniqueness>>,
}

impl JobIndex {
    fn find(&self, job_name: &str, key: &Uniqueness) -> Option<Arc<TrackedJob>> {
        if !key.is_deduplicated() {
            return None;
        }
        let id = self.unique.get(job_name)?.get(key)?;
        self.by_id.get(id).filter(|job| !job.is_settled()).cloned()
    }

    fn insert(&mut self, job: &Arc<TrackedJob>, key: Uniqueness) {
        let id = job.id().clone();
        if key.is_deduplicated() {
            let name = job.name().to_string();
            self.unique
                .entry(name.clone())
                .or_default()
                .insert(key.clone(), id.clone());
            self.keys.entry(name).or_default().insert(id.clone(), key);
        }
        self.by_id.insert(id, Arc::clone(job));
    }

    fn remove(&mut self, job: &TrackedJob) {
        self.by_id.remove(job.id());

        let name = job.name();
        let Some(keys) = self.keys.get_mut(name) else {
            return;
        };
        let Some(key) = keys.remove(job.id()) else {
            return;
        };
        if keys.is_empty() {
            self.keys.remove(name);
        }
        if let Some(unique) = self.unique.get_mut(name) {
            // Only drop the entry if it still points at this job
            if unique.get(&key) == Some(job.id()) {
                unique.remove(&key);
            }
            if unique.is_empty() {
                self.unique.remove(name);
            }
        }
    }
}

struct HubInner {
    registry: Arc<JobRegistry>,
    ids: Arc<dyn IdGenerator>,
    index: Mutex<JobIndex>,
    gate: Option<Arc<ConcurrencyGate<TrackedJob>>>,
    watchdog: Arc<TerminationWatchdog>,
    events: broadcast::Sender<HubEvent>,
    context: DispatchContext,
}

/// Accepts submissions and owns every in-flight job
#[derive(Clone)]
pub struct JobHub {
    inner: Arc<HubInner>,
}

impl JobHub {
    pub fn builder(registry: Arc<JobRegistry>) -> JobHubBuilder {
        JobHubBuilder::new(registry)
    }

    /// Submit a job.
    ///
    /// Returns the in-flight instance when the job deduplicates and a
    /// matching one exists; otherwise a new job, already started or queued.
    pub fn submit<P: Serialize>(&self, job_name: &str, params: P) -> JobResult<Arc<TrackedJob>> {
        let params = normalize(&params).map_err(|e| {
            JobError::validation(job_name, format!("parameters are not serializable: {}", e))
        })?;
        let definition = self.inner.registry.get(job_name)?;
        let key = definition.uniqueness(&params)?;

        if let Some(existing) = self.inner.index.lock().find(definition.name(), &key) {
            debug!(job_id = %existing.id(), job_name, "Returning in-flight job");
            return Ok(existing);
        }

        let job = self.create_job(Arc::clone(&definition), params)?;
        {
            let mut index = self.inner.index.lock();
            // Another submission may have won while the job was being built
            if let Some(existing) = index.find(definition.name(), &key) {
                debug!(job_id = %existing.id(), job_name, "Returning in-flight job");
                return Ok(existing);
            }
            index.insert(&job, key);
        }

        let hub = Arc::downgrade(&self.inner);
        job.on_settled(move |job| release(&hub, job));

        info!(job_id = %job.id(), job_name, "Job created");
        self.run_create_hook(&definition, &job);
        job.publish(JobEvent::Created);

        match &self.inner.gate {
            Some(gate) => gate.add(Arc::clone(&job)),
            None => {
                job.run();
            }
        }
        Ok(job)
    }

    /// Submit a job and wait for its outcome
    pub async fn run<P: Serialize>(&self, job_name: &str, params: P) -> JobResult<JsonValue> {
        self.submit(job_name, params)?.handle().await
    }

    fn create_job(
        &self,
        definition: Arc<JobDefinition>,
        params: JsonValue,
    ) -> JobResult<Arc<TrackedJob>> {
        let context = &self.inner.context;
        let request = CreateJobRequest {
            definition,
            id: self.inner.ids.next_id(),
            params,
        };
        context.interceptors.create_job.run(request, &|request| {
            Ok(TrackedJob::new(
                request.definition,
                request.id,
                request.params,
                context.clone(),
            ))
        })
    }

    fn run_create_hook(&self, definition: &JobDefinition, job: &Arc<TrackedJob>) {
        let Some(hook) = &definition.hooks().on_create else {
            return;
        };
        match catch_unwind(AssertUnwindSafe(|| hook(job.info()))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(job_id = %job.id(), "on_create hook failed: {}", e),
            Err(panic) => warn!(
                job_id = %job.id(),
                "on_create hook panicked: {}",
                panic_message(panic.as_ref())
            ),
        }
    }

    pub fn get(&self, job_id: &JobId) -> Option<Arc<TrackedJob>> {
        self.inner.index.lock().by_id.get(job_id).cloned()
    }

    pub fn in_flight(&self) -> Vec<Arc<TrackedJob>> {
        self.inner.index.lock().by_id.values().cloned().collect()
    }

    /// The in-flight job a submission with `params` would be deduplicated onto
    pub fn find_unique<P: Serialize>(
        &self,
        job_name: &str,
        params: P,
    ) -> JobResult<Option<Arc<TrackedJob>>> {
        let params = normalize(&params).map_err(|e| {
            JobError::validation(job_name, format!("parameters are not serializable: {}", e))
        })?;
        let definition = self.inner.registry.get(job_name)?;
        let key = definition.uniqueness(&params)?;
        Ok(self.inner.index.lock().find(definition.name(), &key))
    }

    /// Abort an in-flight job; false if it is unknown or already settled
    pub fn abort(&self, job_id: &JobId, reason: impl Into<JsonValue>) -> bool {
        match self.get(job_id) {
            Some(job) => job.abort(reason.into()),
            None => false,
        }
    }

    pub fn gate_status(&self) -> Option<GateStatus> {
        self.inner.gate.as_ref().map(|gate| gate.status())
    }

    /// Events of every job, tagged with the job they came from
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.inner.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.inner.registry
    }

    pub fn watchdog(&self) -> &Arc<TerminationWatchdog> {
        &self.inner.watchdog
    }
}

impl fmt::Debug for JobHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHub")
            .field("jobs", &self.inner.registry.names())
            .field("in_flight", &self.inner.index.lock().by_id.len())
            .field("transport", &self.inner.context.transport.name())
            .field("gate", &self.gate_status())
            .finish()
    }
}

fn release(hub: &Weak<HubInner>, job: &Arc<TrackedJob>) {
    let Some(hub) = hub.upgrade() else {
        return;
    };
    hub.index.lock().remove(job);
    hub.watchdog.watch(job);
}

pub struct JobHubBuilder {
    registry: Arc<JobRegistry>,
    config: ExecutionConfig,
    transport: Option<Arc<dyn WorkerTransport>>,
    ids: Option<Arc<dyn IdGenerator>>,
    interceptors: Interceptors,
    runtime_options: RuntimeOptions,
}

impl JobHubBuilder {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self {
            registry,
            config: ExecutionConfig::default(),
            transport: None,
            ids: None,
            interceptors: Interceptors::default(),
            runtime_options: RuntimeOptions::default(),
        }
    }

    pub fn config(mut self, config: ExecutionConfig) -> Self {
        self.config = config;
        self
    }

    /// Transport for dispatched jobs; defaults to worker processes
    pub fn transport(mut self, transport: Arc<dyn WorkerTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn interceptors(mut self, interceptors: Interceptors) -> Self {
        self.interceptors = interceptors;
        self
    }

    /// Options forwarded to every worker in its payload
    pub fn runtime_options(mut self, runtime_options: RuntimeOptions) -> Self {
        self.runtime_options = runtime_options;
        self
    }

    pub fn build(self) -> ExecutionResult<JobHub> {
        self.config.validate()?;

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(ProcessTransport::from_config(&self.config.worker)));
        let gate = self.config.concurrency_limit().map(ConcurrencyGate::new);
        let watchdog = TerminationWatchdog::from_config(&self.config);
        let (events, _) = broadcast::channel(HUB_EVENT_CAPACITY);

        info!(
            transport = transport.name(),
            max_concurrency = self.config.max_concurrency,
            "Job hub ready with {} job definitions",
            self.registry.len()
        );

        let context = DispatchContext {
            transport,
            interceptors: Arc::new(self.interceptors),
            execution: Arc::new(self.config),
            runtime_options: self.runtime_options,
            hub_events: Some(events.clone()),
        };

        Ok(JobHub {
            inner: Arc::new(HubInner {
                registry: self.registry,
                ids: self.ids.unwrap_or_else(|| Arc::new(UuidIdGenerator)),
                index: Mutex::new(JobIndex::default()),
                gate,
                watchdog,
                events,
                context,
            }),
        })
    }
}
