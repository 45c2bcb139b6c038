//! Worker supervision
//!
//! A [`WorkerSupervisor`] owns exactly one worker for exactly one job. It
//! waits for the worker's `startup`, sends the payload, forwards progress,
//! and turns whatever happens on the channel into a single settlement.
//! Anything observed after settlement is ignored, except the exit itself,
//! which is still recorded for the termination watchdog.

use jobhub_core::{ForkError, ForkFailure, JobId, JobResult, JsonValue, WorkerExit};
use jobhub_ipc::{parse_reported_error, HubMessage, WorkerMessage};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::interceptors::SupervisorOptions;
use crate::transport::{ChannelEvent, SpawnedWorker, WorkerLink};

/// How long a closed channel may precede the exit report before the job is
/// failed without an exit status
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Spawned; waiting for `startup`
    Started,
    /// Payload sent
    Active,
    /// The job outcome is decided
    Settled,
    /// The worker is gone
    Exited,
}

/// Receivers a supervisor feeds
pub struct SupervisorChannels {
    pub settled: oneshot::Receiver<JobResult<JsonValue>>,
    pub progress: mpsc::UnboundedReceiver<JsonValue>,
}

enum Control {
    Abort(JsonValue),
}

pub struct WorkerSupervisor {
    job_id: JobId,
    job_name: String,
    link: Arc<dyn WorkerLink>,
    state: Mutex<SupervisorState>,
    control: mpsc::UnboundedSender<Control>,
    exited: watch::Receiver<Option<WorkerExit>>,
    graceful_requested: AtomicBool,
    force_requested: AtomicBool,
}

impl WorkerSupervisor {
    /// Spawn a worker and start supervising it
    pub async fn start(
        options: SupervisorOptions,
    ) -> Result<(Arc<Self>, SupervisorChannels), ForkError> {
        let SupervisorOptions {
            spec,
            transport,
            startup_timeout,
        } = options;

        let SpawnedWorker { link, events } = transport.spawn(&spec).await.map_err(|e| {
            ForkError::new(
                &spec.job_name,
                spec.job_id.as_str(),
                ForkFailure::Spawn {
                    message: e.to_string(),
                },
            )
        })?;

        debug!(
            job_id = %spec.job_id,
            transport = transport.name(),
            pid = ?link.pid(),
            "Worker spawned, awaiting startup"
        );

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (exited_tx, exited_rx) = watch::channel(None);
        let (settled_tx, settled_rx) = oneshot::channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();

        let supervisor = Arc::new(Self {
            job_id: spec.job_id.clone(),
            job_name: spec.job_name.clone(),
            link,
            state: Mutex::new(SupervisorState::Started),
            control: control_tx,
            exited: exited_rx,
            graceful_requested: AtomicBool::new(false),
            force_requested: AtomicBool::new(false),
        });

        let pump = Pump {
            supervisor: Arc::clone(&supervisor),
            payload: Some(spec.payload()),
            startup_deadline: startup_timeout.map(|timeout| (Instant::now() + timeout, timeout)),
            settled: Some(settled_tx),
            progress: progress_tx,
            exited: exited_tx,
            pending_abort: None,
            abort_sent: false,
        };
        tokio::spawn(pump.run(events, control_rx));

        Ok((
            supervisor,
            SupervisorChannels {
                settled: settled_rx,
                progress: progress_rx,
            },
        ))
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.link.pid()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock()
    }

    pub fn has_exited(&self) -> bool {
        self.exited.borrow().is_some()
    }

    /// Exit status once the worker is gone
    pub fn exit_status(&self) -> Option<WorkerExit> {
        *self.exited.borrow()
    }

    /// Wait for the worker to exit
    pub async fn wait_exit(&self) -> WorkerExit {
        let mut exited = self.exited.clone();
        let status = match exited.wait_for(Option::is_some).await {
            Ok(status) => *status,
            Err(_) => None,
        };
        status.unwrap_or_default()
    }

    /// Whether a forced termination was already requested
    pub fn kill_requested(&self) -> bool {
        self.force_requested.load(Ordering::SeqCst)
    }

    /// Forward an abort to the worker; it is delivered after the payload
    pub fn abort(&self, reason: JsonValue) {
        let _ = self.control.send(Control::Abort(reason));
    }

    /// Ask the worker to stop.
    ///
    /// Each kind of request is issued at most once, and never after the
    /// worker exited. Returns whether a request was issued.
    pub fn terminate(&self, force: bool) -> bool {
        if self.has_exited() {
            return false;
        }
        let flag = if force {
            &self.force_requested
        } else {
            &self.graceful_requested
        };
        if flag.swap(true, Ordering::SeqCst) {
            return false;
        }

        info!(
            job_id = %self.job_id,
            job_name = %self.job_name,
            pid = ?self.pid(),
            force,
            "Terminating worker"
        );
        if let Err(e) = self.link.terminate(force) {
            warn!(job_id = %self.job_id, "Failed to terminate worker: {}", e);
        }
        true
    }

    fn set_state(&self, state: SupervisorState) {
        *self.state.lock() = state;
    }

    fn fork_error(&self, failure: ForkFailure) -> ForkError {
        ForkError::new(&self.job_name, self.job_id.as_str(), failure)
    }
}

struct Pump {
    supervisor: Arc<WorkerSupervisor>,
    payload: Option<WorkerMessage>,
    startup_deadline: Option<(Instant, Duration)>,
    settled: Option<oneshot::Sender<JobResult<JsonValue>>>,
    progress: mpsc::UnboundedSender<JsonValue>,
    exited: watch::Sender<Option<WorkerExit>>,
    pending_abort: Option<JsonValue>,
    abort_sent: bool,
}

impl Pump {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        mut control: mpsc::UnboundedReceiver<Control>,
    ) {
        let mut disconnect_deadline: Option<Instant> = None;
        let mut control_open = true;

        loop {
            let startup_timer = self
                .startup_deadline
                .filter(|_| self.awaiting_startup())
                .map(|(deadline, _)| deadline);

            tokio::select! {
                biased;

                event = events.recv() => match event {
                    Some(ChannelEvent::Exited(exit)) => {
                        self.fail(ForkFailure::Disconnected { exit: Some(exit) });
                        self.mark_exited(exit);
                        break;
                    }
                    Some(event) => {
                        let disconnected = matches!(event, ChannelEvent::Disconnected);
                        let before_startup = self.awaiting_startup();
                        self.handle_event(event);
                        if disconnected && before_startup {
                            // Nothing was sent, so no outcome can still be in flight
                            self.fail(ForkFailure::Disconnected { exit: None });
                        } else if disconnected && self.settled.is_some() {
                            disconnect_deadline = Some(Instant::now() + DISCONNECT_GRACE);
                        }
                    }
                    None => {
                        self.fail(ForkFailure::Disconnected { exit: None });
                        self.mark_exited(WorkerExit::default());
                        break;
                    }
                },

                request = control.recv(), if control_open => match request {
                    Some(Control::Abort(reason)) => self.handle_abort(reason),
                    None => control_open = false,
                },

                _ = sleep_until_opt(startup_timer) => {
                    let timeout = self.startup_deadline.map(|(_, timeout)| timeout).unwrap_or_default();
                    warn!(
                        job_id = %self.supervisor.job_id,
                        "Worker did not report startup within {:?}",
                        timeout
                    );
                    self.startup_deadline = None;
                    self.fail(ForkFailure::StartupTimeout {
                        timeout_ms: timeout.as_millis() as u64,
                    });
                    self.supervisor.terminate(true);
                }

                _ = sleep_until_opt(disconnect_deadline) => {
                    disconnect_deadline = None;
                    self.fail(ForkFailure::Disconnected { exit: None });
                }
            }
        }

        debug!(job_id = %self.supervisor.job_id, "Worker supervision finished");
    }

    fn awaiting_startup(&self) -> bool {
        self.payload.is_some() && self.settled.is_some()
    }

    fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message(message) => self.handle_message(message),
            ChannelEvent::Disconnected => {
                debug!(job_id = %self.supervisor.job_id, "Worker channel disconnected");
            }
            ChannelEvent::Error(message) => self.fail(ForkFailure::Transport { message }),
            ChannelEvent::SendFailed(message) => self.fail(ForkFailure::Send { message }),
            ChannelEvent::Exited(_) => {}
        }
    }

    fn handle_message(&mut self, message: HubMessage) {
        if self.settled.is_none() {
            debug!(
                job_id = %self.supervisor.job_id,
                message = message.type_name(),
                "Ignoring worker message after settlement"
            );
            return;
        }

        match message {
            HubMessage::Startup { pid } => {
                let Some(payload) = self.payload.take() else {
                    warn!(job_id = %self.supervisor.job_id, "Duplicate startup from worker");
                    return;
                };
                debug!(job_id = %self.supervisor.job_id, worker_pid = pid, "Worker started, sending payload");
                if let Err(e) = self.supervisor.link.send(payload) {
                    self.fail(ForkFailure::Send {
                        message: e.to_string(),
                    });
                    return;
                }
                self.supervisor.set_state(SupervisorState::Active);
                if let Some(reason) = self.pending_abort.take() {
                    self.send_abort(reason);
                }
            }
            other if self.payload.is_some() => {
                warn!(
                    job_id = %self.supervisor.job_id,
                    message = other.type_name(),
                    "Ignoring worker message received before startup"
                );
            }
            HubMessage::Progress { value } => {
                let _ = self.progress.send(value);
            }
            HubMessage::Success { result } => self.settle(Ok(result)),
            HubMessage::Error { error } => match parse_reported_error(error) {
                Ok(error) => self.settle(Err(error)),
                Err(payload) => self.fail(ForkFailure::MalformedError { payload }),
            },
        }
    }

    fn handle_abort(&mut self, reason: JsonValue) {
        if self.settled.is_none() || self.abort_sent {
            return;
        }
        if self.payload.is_some() {
            // Not started yet; the abort follows the payload
            self.pending_abort.get_or_insert(reason);
            return;
        }
        self.send_abort(reason);
    }

    fn send_abort(&mut self, reason: JsonValue) {
        self.abort_sent = true;
        if let Err(e) = self.supervisor.link.send(WorkerMessage::Abort { reason }) {
            warn!(job_id = %self.supervisor.job_id, "Failed to forward abort to worker: {}", e);
        }
    }

    fn fail(&mut self, failure: ForkFailure) {
        if self.settled.is_none() {
            return;
        }
        let mut error = self.supervisor.fork_error(failure);
        if let Some(reason) = self.pending_abort.take() {
            error = error.with_abort_reason(reason);
        }
        warn!(job_id = %self.supervisor.job_id, "Worker failed: {}", error);
        self.settle(Err(error.into()));
    }

    fn settle(&mut self, outcome: JobResult<JsonValue>) {
        if let Some(settled) = self.settled.take() {
            self.supervisor.set_state(SupervisorState::Settled);
            let _ = settled.send(outcome);
        }
    }

    fn mark_exited(&mut self, exit: WorkerExit) {
        self.supervisor.set_state(SupervisorState::Exited);
        self.exited.send_replace(Some(exit));
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
