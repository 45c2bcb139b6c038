//! Concurrency gate
//!
//! Bounds how many jobs run at once. Jobs wait in submission order; a job
//! that started or settled through another path is skipped when its turn
//! comes. Admission checks are coalesced: any number of state changes in a
//! burst trigger a single drain of the queue.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::job::TrackedJob;

/// A job the gate can admit
pub trait GatedJob: Send + Sync + 'static {
    fn is_started(&self) -> bool;

    fn is_settled(&self) -> bool;

    /// Start the job; the future completes when it settles
    fn start(self: Arc<Self>) -> BoxFuture<'static, ()>;
}

impl GatedJob for TrackedJob {
    fn is_started(&self) -> bool {
        TrackedJob::is_started(self)
    }

    fn is_settled(&self) -> bool {
        TrackedJob::is_settled(self)
    }

    fn start(self: Arc<Self>) -> BoxFuture<'static, ()> {
        let handle = self.run();
        Box::pin(async move {
            let _ = handle.wait().await;
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateStatus {
    pub max_concurrency: usize,
    pub running: usize,
    pub queued: usize,
}

struct GateState<J> {
    queue: VecDeque<Arc<J>>,
    running: usize,
}

pub struct ConcurrencyGate<J: GatedJob> {
    max: usize,
    state: Mutex<GateState<J>>,
    check_scheduled: AtomicBool,
}

impl<J: GatedJob> ConcurrencyGate<J> {
    /// A gate admitting at most `max` jobs at once; zero means unlimited
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            max,
            state: Mutex::new(GateState {
                queue: VecDeque::new(),
                running: 0,
            }),
            check_scheduled: AtomicBool::new(false),
        })
    }

    pub fn max_concurrency(&self) -> usize {
        self.max
    }

    /// Queue a job; it starts once a slot is free
    pub fn add(self: &Arc<Self>, job: Arc<J>) {
        self.state.lock().queue.push_back(job);
        self.schedule_check();
    }

    pub fn status(&self) -> GateStatus {
        let state = self.state.lock();
        GateStatus {
            max_concurrency: self.max,
            running: state.running,
            queued: state.queue.len(),
        }
    }

    fn schedule_check(self: &Arc<Self>) {
        if self.check_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            gate.check_scheduled.store(false, Ordering::SeqCst);
            gate.drain();
        });
    }

    fn drain(self: &Arc<Self>) {
        let admitted = {
            let mut state = self.state.lock();
            let mut admitted = Vec::new();
            while self.max == 0 || state.running < self.max {
                let Some(job) = state.queue.pop_front() else {
                    break;
                };
                if job.is_started() || job.is_settled() {
                    continue;
                }
                state.running += 1;
                admitted.push(job);
            }
            admitted
        };

        for job in admitted {
            debug!("Gate admitted a job");
            let gate = Arc::clone(self);
            let finished = job.start();
            tokio::spawn(async move {
                finished.await;
                gate.state.lock().running -= 1;
                gate.schedule_check();
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct FakeJob {
        started: AtomicBool,
        settled: AtomicBool,
        release: Notify,
        running: Arc<Mutex<(usize, usize)>>,
    }

    impl FakeJob {
        fn new(running: Arc<Mutex<(usize, usize)>>) -> Arc<Self> {
            Arc::new(Self {
                started: AtomicBool::new(false),
                settled: AtomicBool::new(false),
                release: Notify::new(),
                running,
            })
        }
    }

    impl GatedJob for FakeJob {
        fn is_started(&self) -> bool {
            self.started.load(Ordering::SeqCst)
        }

        fn is_settled(&self) -> bool {
            self.settled.load(Ordering::SeqCst)
        }

        fn start(self: Arc<Self>) -> BoxFuture<'static, ()> {
            self.started.store(true, Ordering::SeqCst);
            {
                let mut running = self.running.lock();
                running.0 += 1;
                running.1 = running.1.max(running.0);
            }
            Box::pin(async move {
                self.release.notified().await;
                self.settled.store(true, Ordering::SeqCst);
                self.running.lock().0 -= 1;
            })
        }
    }

    async fn settle_a_bit() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_gate_bounds_concurrency() {
        let running = Arc::new(Mutex::new((0, 0)));
        let gate = ConcurrencyGate::new(2);
        let jobs: Vec<_> = (0..4).map(|_| FakeJob::new(running.clone())).collect();
        for job in &jobs {
            gate.add(job.clone());
        }
        settle_a_bit().await;

        assert!(jobs[0].is_started() && jobs[1].is_started());
        assert!(!jobs[2].is_started() && !jobs[3].is_started());
        assert_eq!(gate.status(), GateStatus { max_concurrency: 2, running: 2, queued: 2 });

        jobs[0].release.notify_one();
        settle_a_bit().await;
        assert!(jobs[2].is_started());
        assert!(!jobs[3].is_started());

        for job in &jobs[1..] {
            job.release.notify_one();
        }
        settle_a_bit().await;
        jobs[3].release.notify_one();
        settle_a_bit().await;

        assert!(jobs.iter().all(|job| job.is_settled()));
        assert_eq!(*running.lock(), (0, 2));
        assert_eq!(gate.status().running, 0);
    }

    #[tokio::test]
    async fn test_gate_skips_jobs_handled_elsewhere() {
        let running = Arc::new(Mutex::new((0, 0)));
        let gate = ConcurrencyGate::new(1);
        let blocker = FakeJob::new(running.clone());
        let already_settled = FakeJob::new(running.clone());
        let waiting = FakeJob::new(running.clone());

        gate.add(blocker.clone());
        gate.add(already_settled.clone());
        gate.add(waiting.clone());
        settle_a_bit().await;

        already_settled.settled.store(true, Ordering::SeqCst);
        blocker.release.notify_one();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(!already_settled.is_started());
        assert!(waiting.is_started());
        waiting.release.notify_one();
    }

    #[tokio::test]
    async fn test_zero_means_unlimited() {
        let running = Arc::new(Mutex::new((0, 0)));
        let gate = ConcurrencyGate::new(0);
        let jobs: Vec<_> = (0..5).map(|_| FakeJob::new(running.clone())).collect();
        for job in &jobs {
            gate.add(job.clone());
        }
        settle_a_bit().await;

        assert!(jobs.iter().all(|job| job.is_started()));
        assert_eq!(gate.status(), GateStatus { max_concurrency: 0, running: 5, queued: 0 });
        for job in &jobs {
            job.release.notify_one();
        }
    }
}
