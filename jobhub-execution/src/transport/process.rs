//! Worker processes over child stdio

use async_trait::async_trait;
use jobhub_config::WorkerBootstrapConfig;
use jobhub_core::WorkerExit;
use jobhub_ipc::{FrameReader, FrameWriter, IpcError, WorkerMessage};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    report_exit, spawn_frame_reader, spawn_frame_writer, ChannelEvent, ForkSpec, SpawnedWorker,
    WorkerLink, WorkerTransport,
};

/// Environment variable carrying the worker's log level
pub const WORKER_LOG_ENV: &str = "JOBHUB_WORKER_LOG";

/// Spawns one OS process per job and speaks the protocol over its stdio
#[derive(Debug, Clone, Default)]
pub struct ProcessTransport {
    default_program: Option<PathBuf>,
}

impl ProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `program` when a fork spec does not name one
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            default_program: Some(program.into()),
        }
    }

    pub fn from_config(config: &WorkerBootstrapConfig) -> Self {
        Self {
            default_program: config.program.clone(),
        }
    }

    fn resolve_program(&self, spec: &ForkSpec) -> Result<PathBuf, IpcError> {
        if let Some(program) = spec.program.clone().or_else(|| self.default_program.clone()) {
            return Ok(program);
        }
        std::env::current_exe().map_err(|e| {
            IpcError::SpawnFailed(format!("cannot determine current executable: {}", e))
        })
    }
}

#[async_trait]
impl WorkerTransport for ProcessTransport {
    async fn spawn(&self, spec: &ForkSpec) -> Result<SpawnedWorker, IpcError> {
        let program = self.resolve_program(spec)?;

        let mut command = Command::new(&program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(level) = &spec.runtime_options.log_level {
            command.env(WORKER_LOG_ENV, level);
        }

        let mut child = command.spawn().map_err(|e| {
            IpcError::SpawnFailed(format!("{}: {}", program.display(), e))
        })?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| IpcError::SpawnFailed("worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| IpcError::SpawnFailed("worker stdout unavailable".to_string()))?;

        info!(
            job_id = %spec.job_id,
            job_name = %spec.job_name,
            pid = ?pid,
            "Spawned worker process {}",
            program.display()
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();

        let reader = spawn_frame_reader(FrameReader::new(stdout), events_tx.clone());
        spawn_frame_writer(FrameWriter::new(stdin), messages_rx, events_tx.clone());

        tokio::spawn(async move {
            let exit = wait_for_exit(child, kill_rx).await;
            debug!(pid = ?pid, "Worker process exited with {}", exit);
            report_exit(reader, exit, &events_tx).await;
        });

        Ok(SpawnedWorker {
            link: Arc::new(ProcessLink {
                pid,
                messages: messages_tx,
                kill: kill_tx,
            }),
            events: events_rx,
        })
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

struct ProcessLink {
    pid: Option<u32>,
    messages: mpsc::UnboundedSender<WorkerMessage>,
    kill: mpsc::UnboundedSender<()>,
}

impl WorkerLink for ProcessLink {
    fn send(&self, message: WorkerMessage) -> Result<(), IpcError> {
        self.messages
            .send(message)
            .map_err(|_| IpcError::ConnectionClosed)
    }

    fn terminate(&self, force: bool) -> Result<(), IpcError> {
        if force {
            // The waiter owns the child; a closed channel means it already exited
            let _ = self.kill.send(());
            return Ok(());
        }
        self.request_graceful_stop()
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl ProcessLink {
    #[cfg(unix)]
    fn request_graceful_stop(&self) -> Result<(), IpcError> {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return Ok(());
        };
        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(IpcError::IoError(format!("failed to signal worker {}: {}", pid, e))),
        }
    }

    #[cfg(not(unix))]
    fn request_graceful_stop(&self) -> Result<(), IpcError> {
        // No graceful signal available; fall back to killing the process
        let _ = self.kill.send(());
        Ok(())
    }
}

async fn wait_for_exit(mut child: Child, mut kill: mpsc::UnboundedReceiver<()>) -> WorkerExit {
    let mut kill_open = true;
    loop {
        tokio::select! {
            status = child.wait() => {
                return match status {
                    Ok(status) => exit_from_status(status),
                    Err(e) => {
                        warn!("Failed to wait for worker process: {}", e);
                        WorkerExit::default()
                    }
                };
            }
            request = kill.recv(), if kill_open => {
                match request {
                    Some(()) => {
                        if let Err(e) = child.start_kill() {
                            warn!("Failed to kill worker process: {}", e);
                        }
                    }
                    None => kill_open = false,
                }
            }
        }
    }
}

fn exit_from_status(status: ExitStatus) -> WorkerExit {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    WorkerExit {
        code: status.code(),
        signal,
    }
}
