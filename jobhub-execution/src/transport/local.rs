//! In-process workers
//!
//! Runs the worker runtime on an in-memory duplex stream inside the hub's
//! own process. The exchange is the same protocol a worker process speaks,
//! so everything above the transport behaves identically. Useful for tests
//! and for embedding the hub where spawning processes is not wanted.

use async_trait::async_trait;
use jobhub_core::{JobRegistry, WorkerExit};
use jobhub_ipc::{FrameReader, FrameWriter, IpcError, WorkerMessage};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    report_exit, spawn_frame_reader, spawn_frame_writer, ForkSpec, SpawnedWorker, WorkerLink,
    WorkerTransport,
};
use crate::interceptors::Interceptors;
use crate::worker::WorkerRuntime;

const DUPLEX_CAPACITY: usize = 64 * 1024;

/// Exit codes mirroring those of a worker process
const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;
const PANIC_EXIT_CODE: i32 = 101;

pub struct LocalTransport {
    registry: Arc<JobRegistry>,
    interceptors: Arc<Interceptors>,
    next_pid: AtomicU32,
}

impl LocalTransport {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self::with_interceptors(registry, Arc::new(Interceptors::default()))
    }

    /// Worker-side interceptors (`load_job`, `job_arg`) apply to every worker
    pub fn with_interceptors(registry: Arc<JobRegistry>, interceptors: Arc<Interceptors>) -> Self {
        Self {
            registry,
            interceptors,
            next_pid: AtomicU32::new(1),
        }
    }
}

#[async_trait]
impl WorkerTransport for LocalTransport {
    async fn spawn(&self, spec: &ForkSpec) -> Result<SpawnedWorker, IpcError> {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let (hub_side, worker_side) = tokio::io::duplex(DUPLEX_CAPACITY);
        let (hub_read, hub_write) = tokio::io::split(hub_side);
        let (worker_read, worker_write) = tokio::io::split(worker_side);

        let shutdown = CancellationToken::new();
        let runtime = WorkerRuntime::new(Arc::clone(&self.registry))
            .with_interceptors(Arc::clone(&self.interceptors))
            .with_shutdown(shutdown.clone())
            .with_pid(pid);
        let worker = tokio::spawn(async move {
            runtime
                .serve(FrameReader::new(worker_read), FrameWriter::new(worker_write))
                .await
        });

        debug!(job_id = %spec.job_id, job_name = %spec.job_name, pid, "Started in-process worker");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let reader = spawn_frame_reader(FrameReader::new(hub_read), events_tx.clone());
        spawn_frame_writer(FrameWriter::new(hub_write), messages_rx, events_tx.clone());

        let link = Arc::new(LocalLink {
            pid,
            messages: messages_tx,
            shutdown: shutdown.clone(),
            task: worker.abort_handle(),
        });

        tokio::spawn(async move {
            let exit = match worker.await {
                Ok(Ok(())) if shutdown.is_cancelled() => WorkerExit {
                    code: None,
                    signal: Some(SIGTERM),
                },
                Ok(Ok(())) => WorkerExit {
                    code: Some(0),
                    signal: None,
                },
                Ok(Err(e)) => {
                    debug!(pid, "In-process worker failed: {}", e);
                    WorkerExit {
                        code: Some(1),
                        signal: None,
                    }
                }
                Err(e) if e.is_cancelled() => WorkerExit {
                    code: None,
                    signal: Some(SIGKILL),
                },
                Err(_) => WorkerExit {
                    code: Some(PANIC_EXIT_CODE),
                    signal: None,
                },
            };
            report_exit(reader, exit, &events_tx).await;
        });

        Ok(SpawnedWorker {
            link,
            events: events_rx,
        })
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

struct LocalLink {
    pid: u32,
    messages: mpsc::UnboundedSender<WorkerMessage>,
    shutdown: CancellationToken,
    task: AbortHandle,
}

impl WorkerLink for LocalLink {
    fn send(&self, message: WorkerMessage) -> Result<(), IpcError> {
        self.messages
            .send(message)
            .map_err(|_| IpcError::ConnectionClosed)
    }

    fn terminate(&self, force: bool) -> Result<(), IpcError> {
        if force {
            self.task.abort();
        } else {
            self.shutdown.cancel();
        }
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }
}
