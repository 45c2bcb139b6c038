//! Job definitions: the registered, immutable description of a job
//!
//! A definition names a job and carries its handlers and policy. `run` is
//! the only required handler; everything else is optional. Definitions are
//! built with [`JobDefinition::builder`] and never change afterwards.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value as JsonValue;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::error::{DefinitionError, JobError, JobResult};
use crate::ids::JobId;
use crate::job_arg::{JobArg, Next};

/// Future returned by job handlers
pub type HandlerFuture = BoxFuture<'static, JobResult<()>>;

pub type RunHandler = Arc<dyn Fn(JobArg) -> HandlerFuture + Send + Sync>;
pub type QuickRunHandler = Arc<dyn Fn(JobArg, Next) -> HandlerFuture + Send + Sync>;
pub type ValidateHandler = Arc<dyn Fn(JsonValue) -> HandlerFuture + Send + Sync>;
pub type UniqueKeyFn = Arc<dyn Fn(&JsonValue) -> JsonValue + Send + Sync>;
pub type CreateHook = Arc<dyn Fn(&JobInfo) -> JobResult<()> + Send + Sync>;
pub type ProgressHook = Arc<dyn Fn(&JobInfo, &JsonValue) -> JobResult<()> + Send + Sync>;
pub type SuccessHook = Arc<dyn Fn(JobInfo, JsonValue) -> HandlerFuture + Send + Sync>;
pub type FailureHook = Arc<dyn Fn(JobInfo, JobError) -> HandlerFuture + Send + Sync>;

/// Snapshot of a tracked job handed to lifecycle hooks
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub params: JsonValue,
    pub created_at: DateTime<Utc>,
}

/// How submissions of a job are deduplicated
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Uniqueness {
    /// No deduplication for this submission
    None,
    /// At most one in-flight instance of the job at all
    Global,
    /// At most one in-flight instance per key
    Keyed(String),
}

impl Uniqueness {
    pub fn is_deduplicated(&self) -> bool {
        !matches!(self, Uniqueness::None)
    }
}

/// Optional lifecycle hooks
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    pub on_create: Option<CreateHook>,
    pub on_success: Option<SuccessHook>,
    pub on_failure: Option<FailureHook>,
    pub on_progress: Option<ProgressHook>,
}

/// Registered description of a job
#[derive(Clone)]
pub struct JobDefinition {
    name: String,
    run: RunHandler,
    quick_run: Option<QuickRunHandler>,
    validate: Option<ValidateHandler>,
    unique_key: Option<UniqueKeyFn>,
    unique: bool,
    hooks: LifecycleHooks,
    metadata: JsonValue,
}

impl JobDefinition {
    /// Start building a definition
    pub fn builder(name: impl Into<String>) -> JobDefinitionBuilder {
        JobDefinitionBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run_handler(&self) -> &RunHandler {
        &self.run
    }

    pub fn quick_run_handler(&self) -> Option<&QuickRunHandler> {
        self.quick_run.as_ref()
    }

    pub fn validator(&self) -> Option<&ValidateHandler> {
        self.validate.as_ref()
    }

    pub fn hooks(&self) -> &LifecycleHooks {
        &self.hooks
    }

    pub fn metadata(&self) -> &JsonValue {
        &self.metadata
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn has_unique_key(&self) -> bool {
        self.unique_key.is_some()
    }

    /// Resolve the dedup policy for one submission.
    ///
    /// A `unique_key` function wins over the `unique` flag. Its result must be
    /// a string (dedup on that key) or null (no dedup); anything else is a
    /// [`JobError::Uniqueness`].
    pub fn uniqueness(&self, params: &JsonValue) -> JobResult<Uniqueness> {
        if let Some(unique_key) = &self.unique_key {
            return match unique_key(params) {
                JsonValue::String(key) => Ok(Uniqueness::Keyed(key)),
                JsonValue::Null => Ok(Uniqueness::None),
                other => Err(JobError::Uniqueness {
                    job_name: self.name.clone(),
                    returned: json_type_name(&other).to_string(),
                }),
            };
        }

        if self.unique {
            Ok(Uniqueness::Global)
        } else {
            Ok(Uniqueness::None)
        }
    }
}

impl fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .field("quick_run", &self.quick_run.is_some())
            .field("validate", &self.validate.is_some())
            .field("unique_key", &self.unique_key.is_some())
            .field("unique", &self.unique)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Builder for [`JobDefinition`]
pub struct JobDefinitionBuilder {
    name: String,
    run: Option<RunHandler>,
    quick_run: Option<QuickRunHandler>,
    validate: Option<ValidateHandler>,
    unique_key: Option<UniqueKeyFn>,
    unique: bool,
    hooks: LifecycleHooks,
    metadata: JsonValue,
}

impl JobDefinitionBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run: None,
            quick_run: None,
            validate: None,
            unique_key: None,
            unique: false,
            hooks: LifecycleHooks::default(),
            metadata: JsonValue::Null,
        }
    }

    /// Handler executed inside the worker process
    pub fn run<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(JobArg) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult<()>> + Send + 'static,
    {
        self.run = Some(Arc::new(move |arg: JobArg| -> HandlerFuture {
            Box::pin(handler(arg))
        }));
        self
    }

    /// In-process fast path, tried before a worker is dispatched
    pub fn quick_run<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(JobArg, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult<()>> + Send + 'static,
    {
        self.quick_run = Some(Arc::new(move |arg: JobArg, next: Next| -> HandlerFuture {
            Box::pin(handler(arg, next))
        }));
        self
    }

    /// Synchronous parameter validation
    pub fn validate<F>(mut self, validator: F) -> Self
    where
        F: Fn(&JsonValue) -> JobResult<()> + Send + Sync + 'static,
    {
        let validator = Arc::new(validator);
        self.validate = Some(Arc::new(move |params: JsonValue| -> HandlerFuture {
            let validator = Arc::clone(&validator);
            Box::pin(async move { validator(&params) })
        }));
        self
    }

    /// Asynchronous parameter validation
    pub fn validate_async<F, Fut>(mut self, validator: F) -> Self
    where
        F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult<()>> + Send + 'static,
    {
        self.validate = Some(Arc::new(move |params: JsonValue| -> HandlerFuture {
            Box::pin(validator(params))
        }));
        self
    }

    /// Per-submission dedup key; return a string to dedup, null to opt out
    pub fn unique_key<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&JsonValue) -> JsonValue + Send + Sync + 'static,
    {
        self.unique_key = Some(Arc::new(key_fn));
        self
    }

    /// Allow at most one in-flight instance of this job
    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    pub fn on_create<F>(mut self, hook: F) -> Self
    where
        F: Fn(&JobInfo) -> JobResult<()> + Send + Sync + 'static,
    {
        self.hooks.on_create = Some(Arc::new(hook));
        self
    }

    pub fn on_progress<F>(mut self, hook: F) -> Self
    where
        F: Fn(&JobInfo, &JsonValue) -> JobResult<()> + Send + Sync + 'static,
    {
        self.hooks.on_progress = Some(Arc::new(hook));
        self
    }

    pub fn on_success<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(JobInfo, JsonValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult<()>> + Send + 'static,
    {
        self.hooks.on_success = Some(Arc::new(move |info: JobInfo, value: JsonValue| -> HandlerFuture {
            Box::pin(hook(info, value))
        }));
        self
    }

    pub fn on_failure<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(JobInfo, JobError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult<()>> + Send + 'static,
    {
        self.hooks.on_failure = Some(Arc::new(move |info: JobInfo, error: JobError| -> HandlerFuture {
            Box::pin(hook(info, error))
        }));
        self
    }

    /// Opaque metadata carried alongside the definition
    pub fn metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }

    /// Finish the definition, rejecting malformed ones
    pub fn build(self) -> Result<JobDefinition, DefinitionError> {
        if self.name.trim().is_empty() {
            return Err(DefinitionError::Malformed {
                name: self.name,
                message: "job name cannot be empty".to_string(),
            });
        }

        let run = self.run.ok_or_else(|| DefinitionError::Malformed {
            name: self.name.clone(),
            message: "a run handler is required".to_string(),
        })?;

        Ok(JobDefinition {
            name: self.name,
            run,
            quick_run: self.quick_run,
            validate: self.validate,
            unique_key: self.unique_key,
            unique: self.unique,
            hooks: self.hooks,
            metadata: self.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop() -> JobDefinitionBuilder {
        JobDefinition::builder("noop").run(|_arg| async { Ok(()) })
    }

    #[test]
    fn test_missing_run_is_malformed() {
        let err = JobDefinition::builder("broken").build().unwrap_err();
        assert!(matches!(err, DefinitionError::Malformed { ref name, .. } if name == "broken"));
    }

    #[test]
    fn test_empty_name_is_malformed() {
        let err = JobDefinition::builder("  ")
            .run(|_arg| async { Ok(()) })
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::Malformed { .. }));
    }

    #[test]
    fn test_uniqueness_defaults_to_none() {
        let def = noop().build().unwrap();
        assert_eq!(def.uniqueness(&json!({})).unwrap(), Uniqueness::None);
    }

    #[test]
    fn test_unique_flag_is_global() {
        let def = noop().unique(true).build().unwrap();
        assert_eq!(def.uniqueness(&json!({})).unwrap(), Uniqueness::Global);
    }

    #[test]
    fn test_unique_key_wins_over_flag() {
        let def = noop()
            .unique(true)
            .unique_key(|params| params["user"].clone())
            .build()
            .unwrap();

        assert_eq!(
            def.uniqueness(&json!({"user": "ada"})).unwrap(),
            Uniqueness::Keyed("ada".to_string())
        );
        // A missing field indexes to null, which opts out of dedup
        assert_eq!(def.uniqueness(&json!({})).unwrap(), Uniqueness::None);
    }

    #[test]
    fn test_non_string_unique_key_is_rejected() {
        let def = noop().unique_key(|_| json!(42)).build().unwrap();
        match def.uniqueness(&json!({})) {
            Err(JobError::Uniqueness { job_name, returned }) => {
                assert_eq!(job_name, "noop");
                assert_eq!(returned, "number");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
