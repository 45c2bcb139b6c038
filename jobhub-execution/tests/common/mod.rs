//! Shared fixtures for the execution integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use jobhub_core::{JobError, WorkerExit};
use jobhub_execution::{ChannelEvent, ForkSpec, SpawnedWorker, WorkerLink, WorkerTransport};
use jobhub_ipc::{HubMessage, IpcError, WorkerMessage};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// How a scripted worker behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Never reports startup
    Silent,
    /// Never reports startup and survives every termination request
    Unkillable,
    /// Echoes the params as its result, then stays alive until terminated
    EchoAndLinger { ignore_graceful: bool },
}

/// One termination request seen by a scripted worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminateRequest {
    pub at: Instant,
    pub force: bool,
}

/// Transport whose workers follow a [`Script`] instead of running code
pub struct ScriptedTransport {
    script: Script,
    pub terminations: Arc<Mutex<Vec<TerminateRequest>>>,
}

impl ScriptedTransport {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            terminations: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn terminations(&self) -> Vec<TerminateRequest> {
        self.terminations.lock().clone()
    }
}

#[async_trait]
impl WorkerTransport for ScriptedTransport {
    async fn spawn(&self, _spec: &ForkSpec) -> Result<SpawnedWorker, IpcError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let link = Arc::new(ScriptedLink {
            script: self.script,
            events: events_tx,
            exited: AtomicBool::new(false),
            terminations: Arc::clone(&self.terminations),
        });
        if !matches!(self.script, Script::Silent | Script::Unkillable) {
            link.emit(HubMessage::Startup { pid: 4242 });
        }
        Ok(SpawnedWorker {
            link,
            events: events_rx,
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

struct ScriptedLink {
    script: Script,
    events: mpsc::UnboundedSender<ChannelEvent>,
    exited: AtomicBool,
    terminations: Arc<Mutex<Vec<TerminateRequest>>>,
}

impl ScriptedLink {
    fn emit(&self, message: HubMessage) {
        if !self.exited.load(Ordering::SeqCst) {
            let _ = self.events.send(ChannelEvent::Message(message));
        }
    }

    fn exit(&self, signal: i32) {
        if self.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(ChannelEvent::Disconnected);
        let _ = self.events.send(ChannelEvent::Exited(WorkerExit {
            code: None,
            signal: Some(signal),
        }));
    }
}

impl WorkerLink for ScriptedLink {
    fn send(&self, message: WorkerMessage) -> Result<(), IpcError> {
        match message {
            WorkerMessage::Payload { params, .. } => {
                self.emit(HubMessage::Success { result: params })
            }
            WorkerMessage::Abort { reason } => {
                self.emit(HubMessage::error(&JobError::aborted(reason)))
            }
        }
        Ok(())
    }

    fn terminate(&self, force: bool) -> Result<(), IpcError> {
        self.terminations.lock().push(TerminateRequest {
            at: Instant::now(),
            force,
        });
        match (force, self.script) {
            (_, Script::Unkillable) => {}
            (true, _) => self.exit(9),
            (false, Script::EchoAndLinger { ignore_graceful: false }) => self.exit(15),
            (false, _) => {}
        }
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        Some(4242)
    }
}
