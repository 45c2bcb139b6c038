//! End-to-end hub behavior over in-process workers

use jobhub_config::ExecutionConfig;
use jobhub_core::{InterceptorPriority, JobDefinition, JobError, JobRegistry};
use jobhub_execution::{
    GateStatus, HubEvent, Interceptors, JobEvent, JobHub, JobStage, LocalTransport,
};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Serialize)]
struct Report {
    rows: u32,
    #[serde(skip)]
    _formatter: Option<fn(u32) -> String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    note: Option<String>,
}

fn registry() -> Arc<JobRegistry> {
    let registry = JobRegistry::new();
    registry
        .register(
            JobDefinition::builder("report")
                .run(|arg| async move {
                    arg.send_progress(Report { rows: 1, _formatter: None, note: None });
                    arg.resolve(Report {
                        rows: 2,
                        _formatter: Some(|n| n.to_string()),
                        note: None,
                    });
                    Ok(())
                })
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register(
            JobDefinition::builder("exclusive")
                .unique(true)
                .run(|_arg| async move {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                })
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register(
            JobDefinition::builder("echo")
                .run(|arg| async move {
                    arg.resolve(arg.params().clone());
                    Ok(())
                })
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register(
            JobDefinition::builder("broken")
                .run(|_arg| async move {
                    Err(JobError::failed_with("disk full", json!({"free": 0})))
                })
                .build()
                .unwrap(),
        )
        .unwrap();
    Arc::new(registry)
}

fn local_hub(config: ExecutionConfig, interceptors: Interceptors) -> JobHub {
    let registry = registry();
    JobHub::builder(Arc::clone(&registry))
        .config(config)
        .transport(Arc::new(LocalTransport::new(registry)))
        .interceptors(interceptors)
        .build()
        .unwrap()
}

fn drain(events: &mut tokio::sync::broadcast::Receiver<HubEvent>) -> Vec<JobEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event.event);
    }
    seen
}

#[tokio::test]
async fn test_worker_results_and_progress_are_plain_data() {
    let hub = local_hub(ExecutionConfig::default(), Interceptors::new());
    let mut events = hub.subscribe();

    let job = hub.submit("report", json!({})).unwrap();
    assert_eq!(job.handle().await, Ok(json!({"rows": 2})));
    assert_eq!(job.last_progress(), Some(json!({"rows": 1})));

    let names: Vec<_> = drain(&mut events).iter().map(|e| e.name()).collect();
    assert_eq!(names, vec!["created", "started", "forked", "progress", "success"]);
}

#[tokio::test]
async fn test_worker_errors_reach_the_caller() {
    let hub = local_hub(ExecutionConfig::default(), Interceptors::new());
    assert_eq!(
        hub.run("broken", json!({})).await,
        Err(JobError::failed_with("disk full", json!({"free": 0})))
    );
}

#[tokio::test]
async fn test_aborted_unique_job_is_replaced_by_a_fresh_one() {
    let hub = local_hub(ExecutionConfig::default(), Interceptors::new());

    let first = hub.submit("exclusive", json!({})).unwrap();
    assert!(Arc::ptr_eq(&first, &hub.submit("exclusive", json!({})).unwrap()));
    while first.stage() != JobStage::AwaitingWorker {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    assert!(hub.abort(first.id(), "X"));
    assert_eq!(first.handle().await, Err(JobError::aborted("X")));
    assert!(!hub.abort(first.id(), "again"));

    let second = hub.submit("exclusive", json!({})).unwrap();
    assert_ne!(first.id(), second.id());
    assert!(!second.is_settled());
    second.abort(json!("cleanup"));
    assert_eq!(second.handle().await, Err(JobError::aborted("cleanup")));
}

#[tokio::test]
async fn test_fork_options_interceptor_shapes_the_payload() {
    let mut interceptors = Interceptors::new();
    interceptors.fork_options.register(
        "tag-params",
        InterceptorPriority::Normal,
        |mut spec, next| {
            spec.params["tagged"] = json!(true);
            next(spec)
        },
    );
    let hub = local_hub(ExecutionConfig::default(), interceptors);

    assert_eq!(
        hub.run("echo", json!({"text": "hi"})).await,
        Ok(json!({"text": "hi", "tagged": true}))
    );
}

#[tokio::test]
async fn test_gate_never_runs_more_than_its_limit() {
    let release = Arc::new(Semaphore::new(0));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let registry = JobRegistry::new();
    {
        let (release, active, peak) = (release.clone(), active.clone(), peak.clone());
        registry
            .register(
                JobDefinition::builder("held")
                    .run(|_arg| async { Ok(()) })
                    .quick_run(move |arg, _next| {
                        let (release, active, peak) = (release.clone(), active.clone(), peak.clone());
                        async move {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            let permit = release.acquire().await.map_err(|e| JobError::failed(e.to_string()))?;
                            permit.forget();
                            active.fetch_sub(1, Ordering::SeqCst);
                            arg.resolve(json!("released"));
                            Ok(())
                        }
                    })
                    .build()
                    .unwrap(),
            )
            .unwrap();
    }
    let registry = Arc::new(registry);
    let hub = JobHub::builder(Arc::clone(&registry))
        .config(ExecutionConfig {
            max_concurrency: 2,
            ..ExecutionConfig::default()
        })
        .transport(Arc::new(LocalTransport::new(registry)))
        .build()
        .unwrap();

    let jobs: Vec<_> = (0..4).map(|_| hub.submit("held", json!({})).unwrap()).collect();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        hub.gate_status(),
        Some(GateStatus { max_concurrency: 2, running: 2, queued: 2 })
    );

    release.add_permits(4);
    for job in &jobs {
        assert_eq!(job.handle().await, Ok(json!("released")));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(
        hub.gate_status(),
        Some(GateStatus { max_concurrency: 2, running: 0, queued: 0 })
    );
    assert!(hub.in_flight().is_empty());
}
