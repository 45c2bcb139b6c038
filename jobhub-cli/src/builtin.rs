//! Jobs shipped with the `jobhub` binary
//!
//! The hub and its worker processes both build this registry, so a job
//! dispatched by `jobhub run` is found again by `jobhub worker`.

use anyhow::Result;
use jobhub_core::{JobDefinition, JobError, JobRegistry, JsonValue};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Sums at most this many numbers on the fast path
const INLINE_SUM_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
struct SleepParams {
    #[serde(default = "default_sleep_ms")]
    ms: u64,
    #[serde(default = "default_sleep_steps")]
    steps: u32,
}

fn default_sleep_ms() -> u64 {
    1000
}

fn default_sleep_steps() -> u32 {
    4
}

#[derive(Debug, Deserialize)]
struct SumParams {
    numbers: Vec<f64>,
}

pub fn registry() -> Result<JobRegistry> {
    let registry = JobRegistry::new();
    registry.register(echo()?)?;
    registry.register(sleep()?)?;
    registry.register(sum()?)?;
    registry.register(fail()?)?;
    Ok(registry)
}

/// Name and description of every built-in job
pub fn describe(registry: &JobRegistry) -> Vec<(String, String)> {
    let mut jobs: Vec<_> = registry
        .names()
        .into_iter()
        .map(|name| {
            let description = registry
                .get(&name)
                .ok()
                .and_then(|definition| {
                    definition.metadata()["description"]
                        .as_str()
                        .map(str::to_string)
                })
                .unwrap_or_default();
            (name, description)
        })
        .collect();
    jobs.sort();
    jobs
}

fn echo() -> Result<JobDefinition> {
    Ok(JobDefinition::builder("echo")
        .metadata(json!({"description": "Returns its parameters from a worker process"}))
        .run(|arg| async move {
            arg.resolve(arg.params().clone());
            Ok(())
        })
        .build()?)
}

fn sleep() -> Result<JobDefinition> {
    Ok(JobDefinition::builder("sleep")
        .metadata(json!({"description": "Sleeps for `ms` milliseconds, reporting `steps` progress updates"}))
        .unique_key(|params| match params.get("key") {
            Some(JsonValue::String(key)) => json!(key),
            _ => JsonValue::Null,
        })
        .validate(|params| {
            serde_json::from_value::<SleepParams>(params.clone())
                .map(|_| ())
                .map_err(|e| JobError::validation("sleep", e.to_string()))
        })
        .run(|arg| async move {
            let params: SleepParams = arg.params_as()?;
            let steps = params.steps.max(1);
            let step = Duration::from_millis(params.ms / u64::from(steps));

            for done in 1..=steps {
                tokio::select! {
                    _ = tokio::time::sleep(step) => {}
                    reason = arg.aborted() => {
                        arg.reject(JobError::aborted(reason));
                        return Ok(());
                    }
                }
                arg.send_progress(json!({"step": done, "of": steps}));
            }
            arg.resolve(json!({"slept_ms": params.ms}));
            Ok(())
        })
        .build()?)
}

fn sum() -> Result<JobDefinition> {
    Ok(JobDefinition::builder("sum")
        .metadata(json!({"description": "Adds `numbers`; small inputs are summed without a worker"}))
        .validate(|params| match params.get("numbers") {
            Some(JsonValue::Array(items)) if items.iter().all(JsonValue::is_number) => Ok(()),
            other => Err(JobError::invalid_param(
                "sum",
                "numbers",
                other.cloned().unwrap_or(JsonValue::Null),
                "numbers must be an array of numbers",
            )),
        })
        .quick_run(|arg, next| async move {
            let params: SumParams = arg.params_as()?;
            if params.numbers.len() <= INLINE_SUM_LIMIT {
                let total: f64 = params.numbers.iter().sum();
                arg.resolve(json!({"sum": total, "inline": true}));
            } else {
                next.proceed();
            }
            Ok(())
        })
        .run(|arg| async move {
            let params: SumParams = arg.params_as()?;
            let total: f64 = params.numbers.iter().sum();
            arg.resolve(json!({"sum": total, "inline": false}));
            Ok(())
        })
        .build()?)
}

fn fail() -> Result<JobDefinition> {
    Ok(JobDefinition::builder("fail")
        .metadata(json!({"description": "Always fails with `message`"}))
        .run(|arg| async move {
            let message = arg.params()["message"]
                .as_str()
                .unwrap_or("requested failure")
                .to_string();
            Err(JobError::failed_with(message, arg.params().clone()))
        })
        .build()?)
}
