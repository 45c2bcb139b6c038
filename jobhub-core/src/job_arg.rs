//! The argument surface handed to `run` and `quick_run` handlers
//!
//! A [`JobArg`] exposes the job id and parameters plus `resolve`, `reject`
//! and `send_progress`. Where those calls land depends on the path: the
//! fast path routes them into the hub's single-assignment cell, a worker
//! routes them onto the wire. Either way only the first of resolve/reject
//! has any effect.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

use crate::error::{JobError, JobResult};
use crate::ids::JobId;
use crate::normalize::normalize;

/// Destination of a handler's resolve/reject/progress calls
pub trait JobArgSink: Send + Sync {
    /// Settle successfully; returns false if something already settled
    fn resolve(&self, value: JsonValue) -> bool;

    /// Settle with an error; returns false if something already settled
    fn reject(&self, error: JobError) -> bool;

    /// Publish a progress value
    fn progress(&self, value: JsonValue);

    /// Continue to worker dispatch (fast path only)
    fn proceed(&self) -> bool {
        false
    }
}

/// Handler argument
#[derive(Clone)]
pub struct JobArg {
    job_id: JobId,
    job_name: String,
    params: JsonValue,
    sink: Arc<dyn JobArgSink>,
    abort: AbortSignal,
}

impl JobArg {
    pub fn new(
        job_id: JobId,
        job_name: impl Into<String>,
        params: JsonValue,
        sink: Arc<dyn JobArgSink>,
        abort: AbortSignal,
    ) -> Self {
        Self {
            job_id,
            job_name: job_name.into(),
            params,
            sink,
            abort,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn params(&self) -> &JsonValue {
        &self.params
    }

    /// Deserialize the parameters into a typed value
    pub fn params_as<T: DeserializeOwned>(&self) -> JobResult<T> {
        serde_json::from_value(self.params.clone())
            .map_err(|e| JobError::validation(&self.job_name, e.to_string()))
    }

    /// Replace the parameters (used by job-argument interceptors)
    pub fn with_params(mut self, params: JsonValue) -> Self {
        self.params = params;
        self
    }

    /// Settle the job successfully with a normalized copy of `value`.
    ///
    /// A value that cannot be encoded rejects the job instead.
    pub fn resolve<T: Serialize>(&self, value: T) -> bool {
        match normalize(&value) {
            Ok(normalized) => self.sink.resolve(normalized),
            Err(e) => self.sink.reject(JobError::failed(format!(
                "job result is not serializable: {}",
                e
            ))),
        }
    }

    /// Settle the job with an error
    pub fn reject(&self, error: JobError) -> bool {
        self.sink.reject(error)
    }

    /// Publish a normalized progress value; unencodable values are dropped
    pub fn send_progress<T: Serialize>(&self, value: T) {
        match normalize(&value) {
            Ok(normalized) => self.sink.progress(normalized),
            Err(e) => warn!(job_id = %self.job_id, "Dropping unserializable progress value: {}", e),
        }
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    /// Wait until the job is aborted and return the reason
    pub async fn aborted(&self) -> JsonValue {
        self.abort.wait().await
    }

    /// Run `callback` when the job is aborted, or right away if it already was.
    ///
    /// The callback runs synchronously inside the abort request and receives
    /// a clone of this argument, so it can settle the job before the default
    /// aborted rejection applies. It must not block.
    pub fn on_abort<F>(&self, callback: F)
    where
        F: FnOnce(JobArg, JsonValue) + Send + 'static,
    {
        let arg = self.clone();
        self.abort.on_abort(move |reason| callback(arg, reason));
    }
}

impl fmt::Debug for JobArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobArg")
            .field("job_id", &self.job_id)
            .field("job_name", &self.job_name)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Fast-path continuation: hand the job over to a worker process
#[derive(Clone)]
pub struct Next {
    sink: Arc<dyn JobArgSink>,
}

impl Next {
    pub fn new(sink: Arc<dyn JobArgSink>) -> Self {
        Self { sink }
    }

    /// Continue to dispatch; returns false if the fast path already settled
    pub fn proceed(&self) -> bool {
        self.sink.proceed()
    }
}

type AbortCallback = Box<dyn FnOnce(JsonValue) + Send>;

#[derive(Default)]
struct AbortCallbacks {
    pending: Mutex<Vec<AbortCallback>>,
}

/// Owner side of an abort signal
pub struct AbortController {
    tx: watch::Sender<Option<JsonValue>>,
    callbacks: Arc<AbortCallbacks>,
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            tx,
            callbacks: Arc::new(AbortCallbacks::default()),
        }
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
            callbacks: Arc::clone(&self.callbacks),
        }
    }

    /// Request an abort; only the first request is recorded.
    ///
    /// Registered callbacks run before this returns.
    pub fn abort(&self, reason: JsonValue) -> bool {
        let fired = self.tx.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(reason.clone());
                true
            }
        });

        if fired {
            let callbacks = std::mem::take(&mut *self.callbacks.pending.lock());
            for callback in callbacks {
                let reason = reason.clone();
                if let Err(payload) = catch_unwind(AssertUnwindSafe(move || callback(reason))) {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_default();
                    warn!("Abort callback panicked: {}", message);
                }
            }
        }

        fired
    }

    pub fn is_aborted(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Drop callbacks that never ran; called once the job settled
    pub fn clear_callbacks(&self) {
        self.callbacks.pending.lock().clear();
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AbortController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortController")
            .field("reason", &*self.tx.borrow())
            .field("callbacks", &self.callbacks.pending.lock().len())
            .finish()
    }
}

/// Observer side of an abort signal
#[derive(Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<Option<JsonValue>>,
    callbacks: Arc<AbortCallbacks>,
}

impl AbortSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (_, rx) = watch::channel(None);
        Self {
            rx,
            callbacks: Arc::new(AbortCallbacks::default()),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<JsonValue> {
        self.rx.borrow().clone()
    }

    /// Register a callback for the abort, or run it now if already aborted
    pub fn on_abort<F>(&self, callback: F)
    where
        F: FnOnce(JsonValue) + Send + 'static,
    {
        let mut pending = self.callbacks.pending.lock();
        match self.reason() {
            Some(reason) => {
                drop(pending);
                callback(reason);
            }
            None => pending.push(Box::new(callback)),
        }
    }

    /// Resolve with the abort reason; pends forever if the controller is gone
    pub async fn wait(&self) -> JsonValue {
        let mut rx = self.rx.clone();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        };
        match reason {
            Some(reason) => reason,
            None => futures::future::pending().await,
        }
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("reason", &*self.rx.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        settled: AtomicBool,
        resolved: Mutex<Option<JsonValue>>,
        rejected: Mutex<Option<JobError>>,
        progress: Mutex<Vec<JsonValue>>,
    }

    impl JobArgSink for RecordingSink {
        fn resolve(&self, value: JsonValue) -> bool {
            if self.settled.swap(true, Ordering::SeqCst) {
                return false;
            }
            *self.resolved.lock() = Some(value);
            true
        }

        fn reject(&self, error: JobError) -> bool {
            if self.settled.swap(true, Ordering::SeqCst) {
                return false;
            }
            *self.rejected.lock() = Some(error);
            true
        }

        fn progress(&self, value: JsonValue) {
            self.progress.lock().push(value);
        }
    }

    fn arg_with(sink: Arc<RecordingSink>, abort: AbortSignal) -> JobArg {
        JobArg::new(JobId::from("j-1"), "demo", json!({"n": 3}), sink, abort)
    }

    #[test]
    fn test_first_settlement_wins() {
        let sink = Arc::new(RecordingSink::default());
        let arg = arg_with(sink.clone(), AbortSignal::never());

        assert!(arg.resolve(json!({"ok": 1})));
        assert!(!arg.reject(JobError::failed("late")));
        assert!(!arg.resolve(json!({"ok": 2})));

        assert_eq!(*sink.resolved.lock(), Some(json!({"ok": 1})));
        assert!(sink.rejected.lock().is_none());
    }

    #[test]
    fn test_progress_is_normalized() {
        #[derive(Serialize)]
        struct Step {
            done: u32,
            #[serde(skip_serializing_if = "Option::is_none")]
            note: Option<String>,
        }

        let sink = Arc::new(RecordingSink::default());
        let arg = arg_with(sink.clone(), AbortSignal::never());
        arg.send_progress(Step { done: 1, note: None });

        assert_eq!(*sink.progress.lock(), vec![json!({"done": 1})]);
    }

    #[test]
    fn test_typed_params() {
        #[derive(serde::Deserialize)]
        struct Params {
            n: u32,
        }

        let arg = arg_with(Arc::new(RecordingSink::default()), AbortSignal::never());
        let params: Params = arg.params_as().unwrap();
        assert_eq!(params.n, 3);
        assert!(arg.params_as::<Vec<u32>>().is_err());
    }

    #[test]
    fn test_only_first_abort_is_recorded() {
        let controller = AbortController::new();
        assert!(controller.abort(json!("first")));
        assert!(!controller.abort(json!("second")));
        assert_eq!(controller.signal().reason(), Some(json!("first")));
    }

    #[test]
    fn test_on_abort_callback_can_settle() {
        let controller = AbortController::new();
        let sink = Arc::new(RecordingSink::default());
        let arg = arg_with(sink.clone(), controller.signal());

        arg.on_abort(|arg, reason| {
            arg.resolve(json!({"stopped": reason}));
        });
        controller.abort(json!("X"));

        // the callback ran inside abort(), so a default rejection loses
        assert!(!arg.reject(JobError::aborted("X")));
        assert_eq!(*sink.resolved.lock(), Some(json!({"stopped": "X"})));
    }

    #[test]
    fn test_on_abort_after_abort_runs_immediately() {
        let controller = AbortController::new();
        controller.abort(json!("late"));

        let seen = Arc::new(Mutex::new(None));
        let seen_in_callback = seen.clone();
        controller.signal().on_abort(move |reason| {
            *seen_in_callback.lock() = Some(reason);
        });
        assert_eq!(*seen.lock(), Some(json!("late")));
    }

    #[test]
    fn test_panicking_abort_callback_is_contained() {
        let controller = AbortController::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_in_callback = ran.clone();
        controller.signal().on_abort(|_| panic!("callback exploded"));
        controller.signal().on_abort(move |_| ran_in_callback.store(true, Ordering::SeqCst));

        assert!(controller.abort(json!("X")));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_wait_resolves_with_reason() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let waiter = tokio::spawn(async move { signal.wait().await });
        controller.abort(json!({"why": "shutdown"}));
        assert_eq!(waiter.await.unwrap(), json!({"why": "shutdown"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_signal_pends() {
        let signal = AbortSignal::never();
        let waited = tokio::time::timeout(Duration::from_secs(5), signal.wait()).await;
        assert!(waited.is_err());
    }
}
