//! Termination watchdog
//!
//! Once a dispatched job settles its worker should exit on its own. If it
//! is still alive after the termination timeout it is asked to stop, and if
//! it survives the kill timeout as well it is killed.

use jobhub_config::ExecutionConfig;
use jobhub_core::JobId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::events::JobEvent;
use crate::job::TrackedJob;

pub struct TerminationWatchdog {
    termination_timeout: Option<Duration>,
    kill_timeout: Duration,
    entries: Mutex<HashMap<JobId, AbortHandle>>,
}

impl TerminationWatchdog {
    /// `termination_timeout` of `None` disables the watchdog
    pub fn new(termination_timeout: Option<Duration>, kill_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            termination_timeout,
            kill_timeout,
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(config: &ExecutionConfig) -> Arc<Self> {
        Self::new(config.termination_delay(), config.kill_timeout)
    }

    pub fn is_enabled(&self) -> bool {
        self.termination_timeout.is_some()
    }

    /// Number of workers currently being watched
    pub fn watching(&self) -> usize {
        self.entries.lock().len()
    }

    /// Start watching the worker of a settled job
    pub fn watch(self: &Arc<Self>, job: &Arc<TrackedJob>) {
        let Some(termination_timeout) = self.termination_timeout else {
            return;
        };
        let Some(supervisor) = job.supervisor() else {
            return;
        };
        if supervisor.has_exited() {
            return;
        }

        let job_id = job.id().clone();
        let watchdog = Arc::clone(self);
        let watched = Arc::clone(job);
        let kill_timeout = self.kill_timeout;

        let mut entries = self.entries.lock();
        if entries.contains_key(&job_id) {
            return;
        }
        let task = tokio::spawn(async move {
            tokio::select! {
                biased;

                exit = supervisor.wait_exit() => {
                    debug!(job_id = %watched.id(), "Worker exited on its own with {}", exit);
                }

                _ = async {
                    tokio::time::sleep(termination_timeout).await;
                    // Already killed, only the exit is outstanding
                    if supervisor.kill_requested() {
                        debug!(job_id = %watched.id(), "Worker kill already requested, waiting for exit");
                        supervisor.wait_exit().await;
                        return;
                    }
                    if supervisor.terminate(false) {
                        info!(job_id = %watched.id(), "Worker still running after {:?}, requesting termination", termination_timeout);
                        watched.publish(JobEvent::Terminate { force_kill: false });
                    }

                    tokio::time::sleep(kill_timeout).await;
                    if supervisor.terminate(true) {
                        warn!(job_id = %watched.id(), "Worker ignored termination for {:?}, killing it", kill_timeout);
                        watched.publish(JobEvent::Terminate { force_kill: true });
                    }
                    supervisor.wait_exit().await;
                } => {}
            }
            watchdog.entries.lock().remove(watched.id());
        });
        entries.insert(job_id, task.abort_handle());
    }

    /// Stop watching every worker without terminating them
    pub fn cancel_all(&self) {
        for (_, task) in self.entries.lock().drain() {
            task.abort();
        }
    }
}

impl Drop for TerminationWatchdog {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
