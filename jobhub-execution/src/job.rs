//! Tracked jobs
//!
//! A [`TrackedJob`] is one accepted submission. Its stages run strictly in
//! order: validation, the optional in-process fast path, then dispatch to a
//! worker. Whichever stage produces an outcome settles the job exactly once;
//! the matching lifecycle hook runs before the outcome becomes visible.

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use jobhub_config::ExecutionConfig;
use jobhub_core::definition::{HandlerFuture, QuickRunHandler};
use jobhub_core::{
    AbortController, ForkError, ForkFailure, HandlerError, JobArg, JobArgSink, JobDefinition,
    JobError, JobId, JobInfo, JobResult, JsonValue, Next, SettledOutcome,
};
use jobhub_ipc::RuntimeOptions;
use parking_lot::Mutex;
use std::fmt;
use std::future::IntoFuture;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::panic_message;
use crate::events::{HubEvent, JobEvent};
use crate::interceptors::{Interceptors, SupervisorOptions};
use crate::supervisor::WorkerSupervisor;
use crate::transport::{ForkSpec, WorkerTransport};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    Created,
    Validating,
    QuickRunning,
    Dispatching,
    AwaitingWorker,
    Settled,
}

/// What a tracked job needs to fork a worker
#[derive(Clone)]
pub(crate) struct DispatchContext {
    pub transport: Arc<dyn WorkerTransport>,
    pub interceptors: Arc<Interceptors>,
    pub execution: Arc<ExecutionConfig>,
    pub runtime_options: RuntimeOptions,
    pub hub_events: Option<broadcast::Sender<HubEvent>>,
}

type SettleListener = Box<dyn FnOnce(&Arc<TrackedJob>) + Send>;

pub struct TrackedJob {
    info: JobInfo,
    definition: Arc<JobDefinition>,
    stage: Mutex<JobStage>,
    started: AtomicBool,
    settled: AtomicBool,
    outcome: watch::Sender<Option<JobResult<JsonValue>>>,
    last_progress: Mutex<Option<JsonValue>>,
    supervisor: OnceLock<Arc<WorkerSupervisor>>,
    abort: AbortController,
    fast_path: Mutex<Option<Arc<FastPathCell>>>,
    events: broadcast::Sender<JobEvent>,
    listeners: Mutex<Option<Vec<SettleListener>>>,
    context: DispatchContext,
}

impl TrackedJob {
    pub(crate) fn new(
        definition: Arc<JobDefinition>,
        id: JobId,
        params: JsonValue,
        context: DispatchContext,
    ) -> Arc<Self> {
        let (outcome, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            info: JobInfo {
                id,
                name: definition.name().to_string(),
                params,
                created_at: Utc::now(),
            },
            definition,
            stage: Mutex::new(JobStage::Created),
            started: AtomicBool::new(false),
            settled: AtomicBool::new(false),
            outcome,
            last_progress: Mutex::new(None),
            supervisor: OnceLock::new(),
            abort: AbortController::new(),
            fast_path: Mutex::new(None),
            events,
            listeners: Mutex::new(Some(Vec::new())),
            context,
        })
    }

    pub fn id(&self) -> &JobId {
        &self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn params(&self) -> &JsonValue {
        &self.info.params
    }

    pub fn info(&self) -> &JobInfo {
        &self.info
    }

    pub fn definition(&self) -> &Arc<JobDefinition> {
        &self.definition
    }

    pub fn stage(&self) -> JobStage {
        *self.stage.lock()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// True from the moment the outcome is decided, before hooks finish
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    /// The published outcome, once hooks are done
    pub fn outcome(&self) -> Option<JobResult<JsonValue>> {
        self.outcome.borrow().clone()
    }

    pub fn last_progress(&self) -> Option<JsonValue> {
        self.last_progress.lock().clone()
    }

    /// The worker supervisor, if the job was dispatched
    pub fn supervisor(&self) -> Option<Arc<WorkerSupervisor>> {
        self.supervisor.get().cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn handle(&self) -> OutcomeHandle {
        OutcomeHandle {
            job_id: self.info.id.clone(),
            outcome: self.outcome.subscribe(),
        }
    }

    /// Start the job. Later calls return the same handle and do nothing else.
    pub fn run(self: &Arc<Self>) -> OutcomeHandle {
        if !self.is_settled() && !self.started.swap(true, Ordering::SeqCst) {
            info!(job_id = %self.info.id, job_name = %self.info.name, "Job started");
            self.publish(JobEvent::Started);
            tokio::spawn(Arc::clone(self).drive());
        }
        self.handle()
    }

    /// Deliver an abort to whichever handler is active.
    ///
    /// Returns false once the job settled or if it was already aborted.
    pub fn abort(self: &Arc<Self>, reason: JsonValue) -> bool {
        if self.is_settled() || !self.abort.abort(reason.clone()) {
            return false;
        }
        info!(job_id = %self.info.id, job_name = %self.info.name, %reason, "Abort requested");

        match self.stage() {
            JobStage::Created | JobStage::Validating => {
                if self.claim_settlement() {
                    tokio::spawn(Arc::clone(self).complete(Err(JobError::aborted(reason))));
                }
            }
            JobStage::QuickRunning => {
                let cell = self.fast_path.lock().clone();
                if let Some(cell) = cell {
                    cell.decide(FastPathDecision::Reject(JobError::aborted(reason)));
                }
            }
            JobStage::AwaitingWorker => {
                if let Some(supervisor) = self.supervisor.get() {
                    supervisor.abort(reason);
                }
            }
            // Dispatch forwards the reason once the supervisor exists
            JobStage::Dispatching | JobStage::Settled => {}
        }
        true
    }

    /// Run `listener` when the job settles, or now if it already has
    pub(crate) fn on_settled<F>(self: &Arc<Self>, listener: F)
    where
        F: FnOnce(&Arc<TrackedJob>) + Send + 'static,
    {
        let mut listeners = self.listeners.lock();
        match listeners.as_mut() {
            Some(pending) => pending.push(Box::new(listener)),
            None => {
                drop(listeners);
                listener(self);
            }
        }
    }

    pub(crate) fn publish(&self, event: JobEvent) {
        debug!(job_id = %self.info.id, event = event.name(), "Job event");
        if let Some(hub_events) = &self.context.hub_events {
            let _ = hub_events.send(HubEvent {
                job_id: self.info.id.clone(),
                job_name: self.info.name.clone(),
                event: event.clone(),
            });
        }
        let _ = self.events.send(event);
    }

    async fn drive(self: Arc<Self>) {
        if let Some(outcome) = self.execute().await {
            self.settle(outcome).await;
        }
    }

    /// Run the stages; `None` means the job was settled from outside
    async fn execute(self: &Arc<Self>) -> Option<JobResult<JsonValue>> {
        if let Some(validator) = self.definition.validator().cloned() {
            if !self.enter(JobStage::Validating) {
                return None;
            }
            let params = self.info.params.clone();
            match guarded(move || validator(params)).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => return Some(Err(self.validation_failure(error))),
                Err(panic) => {
                    return Some(Err(JobError::validation(
                        &self.info.name,
                        format!("validator panicked: {}", panic),
                    )))
                }
            }
        }

        if let Some(quick_run) = self.definition.quick_run_handler().cloned() {
            if !self.enter(JobStage::QuickRunning) {
                return None;
            }
            match self.quick_run(quick_run).await {
                FastPathDecision::Resolve(value) => return Some(Ok(value)),
                FastPathDecision::Reject(error) => return Some(Err(error)),
                FastPathDecision::Next => {
                    debug!(job_id = %self.info.id, "Fast path deferred to a worker");
                }
            }
        }

        if !self.enter(JobStage::Dispatching) {
            return None;
        }
        Some(self.dispatch().await)
    }

    fn validation_failure(&self, error: JobError) -> JobError {
        match error {
            JobError::Validation { .. } => error,
            other => JobError::validation(&self.info.name, other.to_string()),
        }
    }

    async fn quick_run(self: &Arc<Self>, handler: QuickRunHandler) -> FastPathDecision {
        let (tx, rx) = oneshot::channel();
        let cell = Arc::new(FastPathCell {
            decision: Mutex::new(Some(tx)),
        });
        *self.fast_path.lock() = Some(Arc::clone(&cell));
        if let Some(reason) = self.abort.signal().reason() {
            cell.decide(FastPathDecision::Reject(JobError::aborted(reason)));
        }

        let sink = Arc::new(FastPathSink {
            cell,
            job: Arc::downgrade(self),
        });
        let arg = JobArg::new(
            self.info.id.clone(),
            self.info.name.clone(),
            self.info.params.clone(),
            sink.clone(),
            self.abort.signal(),
        );
        let next = Next::new(sink.clone());

        // `sink` stays alive until the handler's own result is seen, so an
        // error return wins over the dropped-handles default
        tokio::spawn(async move {
            match guarded(move || handler(arg, next)).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    sink.reject(error);
                }
                Err(panic) => {
                    sink.reject(JobError::failed(format!("quick_run panicked: {}", panic)));
                }
            }
        });

        let decision = rx.await.unwrap_or(FastPathDecision::Next);
        self.fast_path.lock().take();
        decision
    }

    async fn dispatch(self: &Arc<Self>) -> JobResult<JsonValue> {
        let context = &self.context;
        let execution = &context.execution;

        let spec = ForkSpec {
            job_id: self.info.id.clone(),
            job_name: self.info.name.clone(),
            params: self.info.params.clone(),
            runtime_options: context.runtime_options.clone(),
            program: execution.worker.program.clone(),
            args: execution.worker.args.clone(),
            env: execution.worker.env.clone(),
        };
        let spec = context.interceptors.fork_options.run(spec, &|spec| spec);
        let options = SupervisorOptions {
            spec,
            transport: Arc::clone(&context.transport),
            startup_timeout: execution.startup_deadline(),
        };
        let options = context
            .interceptors
            .create_supervisor
            .run(options, &|options| options);

        let (supervisor, mut channels) = WorkerSupervisor::start(options).await?;
        let _ = self.supervisor.set(Arc::clone(&supervisor));
        self.publish(JobEvent::Forked {
            pid: supervisor.pid(),
        });
        self.enter(JobStage::AwaitingWorker);
        if let Some(reason) = self.abort.signal().reason() {
            supervisor.abort(reason);
        }

        loop {
            tokio::select! {
                biased;

                Some(value) = channels.progress.recv() => self.record_progress(value),

                outcome = &mut channels.settled => {
                    while let Ok(value) = channels.progress.try_recv() {
                        self.record_progress(value);
                    }
                    return outcome.unwrap_or_else(|_| {
                        Err(ForkError::new(
                            &self.info.name,
                            self.info.id.as_str(),
                            ForkFailure::Disconnected { exit: supervisor.exit_status() },
                        )
                        .into())
                    });
                }
            }
        }
    }

    fn record_progress(&self, value: JsonValue) {
        if self.is_settled() {
            return;
        }
        if let Some(hook) = &self.definition.hooks().on_progress {
            match catch_unwind(AssertUnwindSafe(|| hook(&self.info, &value))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(job_id = %self.info.id, "on_progress hook failed: {}", e),
                Err(panic) => warn!(
                    job_id = %self.info.id,
                    "on_progress hook panicked: {}",
                    panic_message(panic.as_ref())
                ),
            }
        }
        *self.last_progress.lock() = Some(value.clone());
        self.publish(JobEvent::Progress { value });
    }

    /// Move to `stage` unless the job already settled
    fn enter(&self, stage: JobStage) -> bool {
        let mut current = self.stage.lock();
        if self.is_settled() {
            return false;
        }
        *current = stage;
        true
    }

    fn claim_settlement(&self) -> bool {
        let mut stage = self.stage.lock();
        if self.settled.swap(true, Ordering::SeqCst) {
            return false;
        }
        *stage = JobStage::Settled;
        true
    }

    async fn settle(self: Arc<Self>, outcome: JobResult<JsonValue>) {
        if self.claim_settlement() {
            self.complete(outcome).await;
        }
    }

    async fn complete(self: Arc<Self>, outcome: JobResult<JsonValue>) {
        // Listeners see the claim, not the hook's result
        let listeners = self.listeners.lock().take().unwrap_or_default();
        for listener in listeners {
            listener(&self);
        }

        let outcome = self.run_settle_hook(outcome).await;
        self.abort.clear_callbacks();

        match &outcome {
            Ok(_) => info!(job_id = %self.info.id, job_name = %self.info.name, "Job succeeded"),
            Err(e) => warn!(job_id = %self.info.id, job_name = %self.info.name, "Job failed: {}", e),
        }

        self.publish(match &outcome {
            Ok(result) => JobEvent::Success {
                result: result.clone(),
            },
            Err(error) => JobEvent::Failure {
                error: error.clone(),
            },
        });
        self.outcome.send_replace(Some(outcome));
    }

    async fn run_settle_hook(&self, outcome: JobResult<JsonValue>) -> JobResult<JsonValue> {
        let hooks = self.definition.hooks();
        match outcome {
            Ok(value) => {
                let Some(hook) = hooks.on_success.clone() else {
                    return Ok(value);
                };
                let (info, result) = (self.info.clone(), value.clone());
                match guarded(move || hook(info, result)).await {
                    Ok(Ok(())) => Ok(value),
                    Ok(Err(error)) => Err(handler_error(SettledOutcome::Success(value), error)),
                    Err(panic) => Err(handler_error(
                        SettledOutcome::Success(value),
                        JobError::failed(format!("on_success panicked: {}", panic)),
                    )),
                }
            }
            Err(error) => {
                let Some(hook) = hooks.on_failure.clone() else {
                    return Err(error);
                };
                let (info, failure) = (self.info.clone(), error.clone());
                match guarded(move || hook(info, failure)).await {
                    Ok(Ok(())) => Err(error),
                    Ok(Err(hook_error)) => {
                        Err(handler_error(SettledOutcome::Failure(error), hook_error))
                    }
                    Err(panic) => Err(handler_error(
                        SettledOutcome::Failure(error),
                        JobError::failed(format!("on_failure panicked: {}", panic)),
                    )),
                }
            }
        }
    }
}

impl fmt::Debug for TrackedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedJob")
            .field("id", &self.info.id)
            .field("name", &self.info.name)
            .field("stage", &self.stage())
            .finish_non_exhaustive()
    }
}

fn handler_error(original: SettledOutcome, error: JobError) -> JobError {
    HandlerError { original, error }.into()
}

/// Call a handler, turning a panic (while building or polling its future)
/// into an error message
pub(crate) async fn guarded<F>(call: F) -> Result<JobResult<()>, String>
where
    F: FnOnce() -> HandlerFuture,
{
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(future) => AssertUnwindSafe(future)
            .catch_unwind()
            .await
            .map_err(|panic| panic_message(panic.as_ref())),
        Err(panic) => Err(panic_message(panic.as_ref())),
    }
}

enum FastPathDecision {
    Resolve(JsonValue),
    Reject(JobError),
    Next,
}

/// Single-assignment cell: the first of resolve, reject or next wins
struct FastPathCell {
    decision: Mutex<Option<oneshot::Sender<FastPathDecision>>>,
}

impl FastPathCell {
    fn decide(&self, decision: FastPathDecision) -> bool {
        let sender = self.decision.lock().take();
        match sender {
            Some(sender) => {
                let _ = sender.send(decision);
                true
            }
            None => false,
        }
    }

    fn is_open(&self) -> bool {
        self.decision.lock().is_some()
    }
}

struct FastPathSink {
    cell: Arc<FastPathCell>,
    job: Weak<TrackedJob>,
}

impl JobArgSink for FastPathSink {
    fn resolve(&self, value: JsonValue) -> bool {
        self.cell.decide(FastPathDecision::Resolve(value))
    }

    fn reject(&self, error: JobError) -> bool {
        self.cell.decide(FastPathDecision::Reject(error))
    }

    fn progress(&self, value: JsonValue) {
        if !self.cell.is_open() {
            return;
        }
        if let Some(job) = self.job.upgrade() {
            job.record_progress(value);
        }
    }

    fn proceed(&self) -> bool {
        self.cell.decide(FastPathDecision::Next)
    }
}

impl Drop for FastPathSink {
    // Every handle was dropped without a decision: continue as `next` would
    fn drop(&mut self) {
        self.cell.decide(FastPathDecision::Next);
    }
}

/// Awaitable outcome of a tracked job, shared by every caller that
/// submitted or ran it
#[derive(Clone)]
pub struct OutcomeHandle {
    job_id: JobId,
    outcome: watch::Receiver<Option<JobResult<JsonValue>>>,
}

impl OutcomeHandle {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn try_outcome(&self) -> Option<JobResult<JsonValue>> {
        self.outcome.borrow().clone()
    }

    pub async fn wait(&self) -> JobResult<JsonValue> {
        let mut outcome = self.outcome.clone();
        let settled = match outcome.wait_for(Option::is_some).await {
            Ok(settled) => settled.clone(),
            Err(_) => None,
        };
        settled.unwrap_or_else(|| Err(JobError::failed("job was dropped before it settled")))
    }
}

impl IntoFuture for OutcomeHandle {
    type Output = JobResult<JsonValue>;
    type IntoFuture = BoxFuture<'static, JobResult<JsonValue>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}

impl fmt::Debug for OutcomeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutcomeHandle")
            .field("job_id", &self.job_id)
            .field("settled", &self.outcome.borrow().is_some())
            .finish()
    }
}
