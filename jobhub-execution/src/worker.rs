//! Worker-side runtime
//!
//! Runs inside a worker: reports startup, waits for the payload, loads the
//! named definition and runs it, reporting progress and the single terminal
//! message back to the hub. A closed hub channel ends the worker quietly;
//! errors and panics of the job are reported as `Error`.

use jobhub_core::{
    AbortController, JobArg, JobArgSink, JobDefinition, JobError, JobId, JobRegistry, JobResult,
    JsonValue,
};
use jobhub_ipc::{FrameReader, FrameWriter, HubMessage, IpcError, RuntimeOptions, WorkerMessage};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ExecutionResult;
use crate::interceptors::{Interceptors, LoadJobRequest};
use crate::job::guarded;

struct Payload {
    job_id: JobId,
    job_name: String,
    params: JsonValue,
    runtime_options: RuntimeOptions,
}

pub struct WorkerRuntime {
    registry: Arc<JobRegistry>,
    interceptors: Arc<Interceptors>,
    shutdown: CancellationToken,
    pid: u32,
}

impl WorkerRuntime {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self {
            registry,
            interceptors: Arc::new(Interceptors::default()),
            shutdown: CancellationToken::new(),
            pid: std::process::id(),
        }
    }

    pub fn with_interceptors(mut self, interceptors: Arc<Interceptors>) -> Self {
        self.interceptors = interceptors;
        self
    }

    /// Cancelling `shutdown` aborts the running job and ends `serve`
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Pid reported in the startup message
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run one job over the given channel
    pub async fn serve<R, W>(
        &self,
        mut reader: FrameReader<R>,
        mut writer: FrameWriter<W>,
    ) -> ExecutionResult<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        writer
            .send_message(HubMessage::Startup { pid: self.pid })
            .await?;
        debug!(pid = self.pid, "Worker started, awaiting payload");

        let payload = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            payload = await_payload(&mut reader) => payload?,
        };
        let Some(payload) = payload else {
            debug!("Hub closed the channel before sending a payload");
            return Ok(());
        };

        let definition = match self.load_job(&payload) {
            Ok(definition) => definition,
            Err(e) => {
                warn!(job_name = %payload.job_name, "Failed to load job: {}", e);
                writer.send_message(HubMessage::error(&e)).await?;
                return Ok(());
            }
        };

        info!(job_id = %payload.job_id, job_name = %payload.job_name, "Running job");
        let (messages, mut outgoing) = mpsc::unbounded_channel();
        let outcome = Arc::new(WorkerOutcome {
            messages,
            decided: AtomicBool::new(false),
        });
        let abort = AbortController::new();
        let arg = JobArg::new(
            payload.job_id.clone(),
            payload.job_name.clone(),
            payload.params,
            Arc::new(WorkerSink {
                outcome: Arc::clone(&outcome),
            }),
            abort.signal(),
        );
        let arg = self.interceptors.job_arg.run(arg, &|arg| arg);

        let run = Arc::clone(definition.run_handler());
        let task = tokio::spawn(async move {
            // Holds the sink open until the handler's own result is seen
            let sink = arg.clone();
            match guarded(move || run(arg)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    sink.reject(e);
                }
                Err(panic) => {
                    sink.reject(JobError::failed(format!("job panicked: {}", panic)));
                }
            }
        });

        let result = self
            .exchange(&payload.job_id, &mut reader, &mut writer, &mut outgoing, &outcome, &abort)
            .await;
        task.abort();
        result
    }

    fn load_job(&self, payload: &Payload) -> JobResult<Arc<JobDefinition>> {
        let request = LoadJobRequest {
            job_name: payload.job_name.clone(),
            runtime_options: payload.runtime_options.clone(),
        };
        self.interceptors
            .load_job
            .run(request, &|request| self.registry.get(&request.job_name))
    }

    async fn exchange<R, W>(
        &self,
        job_id: &JobId,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
        outgoing: &mut mpsc::UnboundedReceiver<HubMessage>,
        outcome: &WorkerOutcome,
        abort: &AbortController,
    ) -> ExecutionResult<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let mut hub_open = true;
        loop {
            tokio::select! {
                biased;

                message = outgoing.recv() => {
                    let Some(message) = message else {
                        return Ok(());
                    };
                    let terminal = message.is_terminal();
                    writer.send_message(&message).await?;
                    if terminal {
                        debug!(job_id = %job_id, outcome = message.type_name(), "Job settled");
                        return Ok(());
                    }
                }

                incoming = reader.recv::<WorkerMessage>(), if hub_open => match incoming {
                    Ok(Some(envelope)) => match envelope.message {
                        WorkerMessage::Abort { reason } => {
                            info!(job_id = %job_id, %reason, "Abort received");
                            abort.abort(reason.clone());
                            outcome.reject(JobError::aborted(reason));
                        }
                        WorkerMessage::Payload { .. } => {
                            warn!(job_id = %job_id, "Ignoring repeated payload");
                        }
                    },
                    Ok(None) => {
                        debug!(job_id = %job_id, "Hub channel closed, exiting");
                        return Ok(());
                    }
                    Err(IpcError::DeserializationError(e)) => {
                        warn!(job_id = %job_id, "Skipping malformed message from hub: {}", e);
                    }
                    Err(e) if e.is_fatal() => {
                        debug!(job_id = %job_id, "Hub channel failed, exiting: {}", e);
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, "Hub channel error: {}", e);
                        hub_open = false;
                    }
                },

                _ = self.shutdown.cancelled() => {
                    info!(job_id = %job_id, "Worker shutting down");
                    abort.abort(json!("shutdown"));
                    return Ok(());
                }
            }
        }
    }
}

async fn await_payload<R>(reader: &mut FrameReader<R>) -> Result<Option<Payload>, IpcError>
where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.recv::<WorkerMessage>().await {
            Ok(Some(envelope)) => match envelope.message {
                WorkerMessage::Payload {
                    job_id,
                    job_name,
                    params,
                    runtime_options,
                } => {
                    return Ok(Some(Payload {
                        job_id,
                        job_name,
                        params,
                        runtime_options,
                    }))
                }
                WorkerMessage::Abort { .. } => {
                    debug!("Ignoring abort received before the payload");
                }
            },
            Ok(None) => return Ok(None),
            Err(IpcError::DeserializationError(e)) => {
                warn!("Skipping malformed message from hub: {}", e);
            }
            Err(e) if e.is_fatal() => return Ok(None),
            Err(e) => return Err(e),
        }
    }
}

/// Terminal-once reporting towards the hub
struct WorkerOutcome {
    messages: mpsc::UnboundedSender<HubMessage>,
    decided: AtomicBool,
}

impl WorkerOutcome {
    fn decide(&self, message: HubMessage) -> bool {
        if self.decided.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.messages.send(message);
        true
    }

    fn reject(&self, error: JobError) -> bool {
        self.decide(HubMessage::error(&error))
    }
}

struct WorkerSink {
    outcome: Arc<WorkerOutcome>,
}

impl JobArgSink for WorkerSink {
    fn resolve(&self, value: JsonValue) -> bool {
        self.outcome.decide(HubMessage::Success { result: value })
    }

    fn reject(&self, error: JobError) -> bool {
        self.outcome.reject(error)
    }

    fn progress(&self, value: JsonValue) {
        if !self.outcome.decided.load(Ordering::SeqCst) {
            let _ = self.outcome.messages.send(HubMessage::Progress { value });
        }
    }
}

impl Drop for WorkerSink {
    // Every copy of the job argument is gone and nothing was reported
    fn drop(&mut self) {
        self.outcome
            .reject(JobError::failed("job finished without resolving"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobhub_ipc::MessageEnvelope;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream, ReadHalf, WriteHalf};

    struct Hub {
        reader: FrameReader<ReadHalf<DuplexStream>>,
        writer: FrameWriter<WriteHalf<DuplexStream>>,
    }

    impl Hub {
        async fn expect(&mut self) -> HubMessage {
            let envelope: MessageEnvelope<HubMessage> =
                self.reader.recv().await.unwrap().expect("worker closed the channel");
            envelope.message
        }

        async fn send(&mut self, message: WorkerMessage) {
            self.writer.send_message(message).await.unwrap();
        }
    }

    fn start(registry: JobRegistry) -> (Hub, tokio::task::JoinHandle<ExecutionResult<()>>, CancellationToken) {
        let (hub_side, worker_side) = duplex(64 * 1024);
        let (hub_read, hub_write) = tokio::io::split(hub_side);
        let (worker_read, worker_write) = tokio::io::split(worker_side);
        let runtime = WorkerRuntime::new(Arc::new(registry)).with_pid(77);
        let shutdown = runtime.shutdown_token();
        let task = tokio::spawn(async move {
            runtime
                .serve(FrameReader::new(worker_read), FrameWriter::new(worker_write))
                .await
        });
        (
            Hub {
                reader: FrameReader::new(hub_read),
                writer: FrameWriter::new(hub_write),
            },
            task,
            shutdown,
        )
    }

    fn payload(job_name: &str, params: JsonValue) -> WorkerMessage {
        WorkerMessage::Payload {
            job_id: JobId::from("job-1"),
            job_name: job_name.to_string(),
            params,
            runtime_options: RuntimeOptions::default(),
        }
    }

    fn registry_with(definition: JobDefinition) -> JobRegistry {
        let registry = JobRegistry::new();
        registry.register(definition).unwrap();
        registry
    }

    #[tokio::test]
    async fn test_runs_job_after_handshake() {
        let registry = registry_with(
            JobDefinition::builder("double")
                .run(|arg| async move {
                    let n = arg.params()["n"].as_i64().unwrap_or_default();
                    arg.send_progress(json!({"step": "doubling"}));
                    arg.resolve(n * 2);
                    Ok(())
                })
                .build()
                .unwrap(),
        );
        let (mut hub, task, _) = start(registry);

        assert_eq!(hub.expect().await, HubMessage::Startup { pid: 77 });
        hub.send(payload("double", json!({"n": 21}))).await;
        assert_eq!(
            hub.expect().await,
            HubMessage::Progress { value: json!({"step": "doubling"}) }
        );
        assert_eq!(hub.expect().await, HubMessage::Success { result: json!(42) });
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_job_reports_error() {
        let (mut hub, task, _) = start(JobRegistry::new());
        hub.expect().await;
        hub.send(payload("missing", json!({}))).await;

        match hub.expect().await {
            HubMessage::Error { error } => {
                let parsed = jobhub_ipc::parse_reported_error(error).unwrap();
                assert_eq!(parsed, JobError::not_found("missing"));
            }
            other => panic!("expected error, got {:?}", other),
        }
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_panics_and_silent_returns_are_reported() {
        let registry = registry_with(
            JobDefinition::builder("explodes")
                .run(|_arg| async move { panic!("kaboom") })
                .build()
                .unwrap(),
        );
        let (mut hub, task, _) = start(registry);
        hub.expect().await;
        hub.send(payload("explodes", json!({}))).await;
        match hub.expect().await {
            HubMessage::Error { error } => {
                assert!(error.to_string().contains("kaboom"));
            }
            other => panic!("expected error, got {:?}", other),
        }
        task.await.unwrap().unwrap();

        let registry = registry_with(
            JobDefinition::builder("forgetful")
                .run(|_arg| async move { Ok(()) })
                .build()
                .unwrap(),
        );
        let (mut hub, _task, _) = start(registry);
        hub.expect().await;
        hub.send(payload("forgetful", json!({}))).await;
        match hub.expect().await {
            HubMessage::Error { error } => {
                assert!(error.to_string().contains("without resolving"));
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_abort_is_delivered_to_the_job() {
        let registry = registry_with(
            JobDefinition::builder("patient")
                .run(|arg| async move {
                    let reason = arg.aborted().await;
                    arg.resolve(json!({"cancelled": reason}));
                    Ok(())
                })
                .build()
                .unwrap(),
        );
        let (mut hub, task, _) = start(registry);
        hub.expect().await;
        hub.send(payload("patient", json!({}))).await;
        hub.send(WorkerMessage::Abort { reason: json!("X") }).await;

        // The default rejection applies synchronously, before the job resumes
        match hub.expect().await {
            HubMessage::Error { error } => {
                let parsed = jobhub_ipc::parse_reported_error(error).unwrap();
                assert_eq!(parsed, JobError::aborted("X"));
            }
            other => panic!("expected error, got {:?}", other),
        }
        task.await.unwrap().unwrap();

        let registry = registry_with(
            JobDefinition::builder("cooperative")
                .run(|arg| async move {
                    arg.on_abort(|arg, reason| {
                        arg.resolve(json!({"stopped": reason}));
                    });
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                })
                .build()
                .unwrap(),
        );
        let (mut hub, task, _) = start(registry);
        hub.expect().await;
        hub.send(payload("cooperative", json!({}))).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        hub.send(WorkerMessage::Abort { reason: json!("X") }).await;
        assert_eq!(
            hub.expect().await,
            HubMessage::Success { result: json!({"stopped": "X"}) }
        );
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_hub_disconnect_ends_quietly() {
        let registry = registry_with(
            JobDefinition::builder("forever")
                .run(|_arg| async move {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                })
                .build()
                .unwrap(),
        );
        let (mut hub, task, _) = start(registry);
        hub.expect().await;
        hub.send(payload("forever", json!({}))).await;
        drop(hub);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_before_payload() {
        let (mut hub, task, shutdown) = start(JobRegistry::new());
        hub.expect().await;
        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}
