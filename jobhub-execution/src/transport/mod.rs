//! Worker transports
//!
//! A transport starts one worker for one job and hands back a
//! [`WorkerLink`] for talking to it plus a stream of [`ChannelEvent`]s.
//! Every transport guarantees that [`ChannelEvent::Exited`] is the last
//! event it emits.

pub mod local;
pub mod process;

use async_trait::async_trait;
use jobhub_core::{JobId, JsonValue, WorkerExit};
use jobhub_ipc::{FrameReader, FrameWriter, HubMessage, IpcError, RuntimeOptions, WorkerMessage};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Upper bound on how long exit reporting waits for the reader to drain
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything needed to fork a worker for one job
#[derive(Debug, Clone, PartialEq)]
pub struct ForkSpec {
    pub job_id: JobId,
    pub job_name: String,
    pub params: JsonValue,
    pub runtime_options: RuntimeOptions,
    /// Program to execute; `None` means the current executable
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl ForkSpec {
    /// The payload message sent once the worker reports startup
    pub fn payload(&self) -> WorkerMessage {
        WorkerMessage::Payload {
            job_id: self.job_id.clone(),
            job_name: self.job_name.clone(),
            params: self.params.clone(),
            runtime_options: self.runtime_options.clone(),
        }
    }
}

/// What a transport observed on a worker channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message(HubMessage),
    /// The worker closed its side of the channel
    Disconnected,
    /// Transport-level failure while reading
    Error(String),
    /// Writing to the worker failed
    SendFailed(String),
    /// The worker is gone; always the final event
    Exited(WorkerExit),
}

/// Control handle for a spawned worker
pub trait WorkerLink: Send + Sync {
    /// Queue a message for the worker
    fn send(&self, message: WorkerMessage) -> Result<(), IpcError>;

    /// Ask the worker to stop; `force` kills it outright
    fn terminate(&self, force: bool) -> Result<(), IpcError>;

    /// OS process id, if the worker is a separate process
    fn pid(&self) -> Option<u32>;
}

/// A freshly started worker
pub struct SpawnedWorker {
    pub link: Arc<dyn WorkerLink>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// A way of starting workers
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    async fn spawn(&self, spec: &ForkSpec) -> Result<SpawnedWorker, IpcError>;

    /// Name used in logs
    fn name(&self) -> &'static str;
}

/// Forward frames from a worker into `events` until the channel ends
pub(crate) fn spawn_frame_reader<R>(
    mut reader: FrameReader<R>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match reader.recv::<HubMessage>().await {
                Ok(Some(envelope)) => {
                    if events.send(ChannelEvent::Message(envelope.message)).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    let _ = events.send(ChannelEvent::Disconnected);
                    break;
                }
                Err(IpcError::DeserializationError(e)) => {
                    // Stray output on the channel is not fatal
                    warn!("Skipping non-protocol line from worker: {}", e);
                }
                Err(e) if e.is_fatal() => {
                    let _ = events.send(ChannelEvent::Disconnected);
                    debug!("Worker channel closed: {}", e);
                    break;
                }
                Err(e) => {
                    let _ = events.send(ChannelEvent::Error(e.to_string()));
                    break;
                }
            }
        }
    })
}

/// Drain `messages` into the worker, reporting the first write failure
pub(crate) fn spawn_frame_writer<W>(
    mut writer: FrameWriter<W>,
    mut messages: mpsc::UnboundedReceiver<WorkerMessage>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            if let Err(e) = writer.send_message(&message).await {
                let _ = events.send(ChannelEvent::SendFailed(e.to_string()));
                break;
            }
        }
    })
}

/// Emit the final `Exited` event once the reader has drained
pub(crate) async fn report_exit(
    reader: JoinHandle<()>,
    exit: WorkerExit,
    events: &mpsc::UnboundedSender<ChannelEvent>,
) {
    if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
        debug!("Worker reader did not drain before exit was reported");
    }
    let _ = events.send(ChannelEvent::Exited(exit));
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobhub_ipc::MessageEnvelope;
    use serde_json::json;

    #[tokio::test]
    async fn test_reader_skips_noise_and_reports_disconnect() {
        let input = format!(
            "starting up...\n{}\n",
            serde_json::to_string(&MessageEnvelope::new(HubMessage::Startup { pid: 3 })).unwrap()
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reader = spawn_frame_reader(FrameReader::new(std::io::Cursor::new(input.into_bytes())), tx.clone());

        assert_eq!(
            rx.recv().await.unwrap(),
            ChannelEvent::Message(HubMessage::Startup { pid: 3 })
        );
        assert_eq!(rx.recv().await.unwrap(), ChannelEvent::Disconnected);

        report_exit(reader, WorkerExit { code: Some(0), signal: None }, &tx).await;
        assert_eq!(
            rx.recv().await.unwrap(),
            ChannelEvent::Exited(WorkerExit { code: Some(0), signal: None })
        );
    }

    #[tokio::test]
    async fn test_writer_reports_send_failure() {
        let (near, far) = tokio::io::duplex(64);
        drop(far);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let writer = spawn_frame_writer(FrameWriter::new(near), messages_rx, events_tx);

        messages_tx
            .send(WorkerMessage::Abort { reason: json!("x") })
            .unwrap();
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            ChannelEvent::SendFailed(_)
        ));
        writer.await.unwrap();
    }

    #[test]
    fn test_fork_spec_payload() {
        let spec = ForkSpec {
            job_id: JobId::from("j-1"),
            job_name: "echo".to_string(),
            params: json!({"a": 1}),
            runtime_options: RuntimeOptions::default(),
            program: None,
            args: vec!["worker".to_string()],
            env: BTreeMap::new(),
        };
        assert_eq!(
            spec.payload(),
            WorkerMessage::Payload {
                job_id: JobId::from("j-1"),
                job_name: "echo".to_string(),
                params: json!({"a": 1}),
                runtime_options: RuntimeOptions::default(),
            }
        );
    }
}
