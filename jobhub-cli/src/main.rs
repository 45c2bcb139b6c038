use anyhow::{Context, Result};
use clap::Parser;
use jobhub_config::{ConfigLoader, JobhubConfig, LogLevel};
use jobhub_core::JsonValue;
use jobhub_execution::transport::process::WORKER_LOG_ENV;
use jobhub_execution::{JobHub, LocalTransport, WorkerRuntime};
use jobhub_ipc::RuntimeOptions;
use jobhub_logging::{init_logging_from_config, init_worker_tracing};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod builtin;
mod cli;

use cli::{Cli, Commands, ConfigCommands};

/// Load configuration from a file, or from the environment and defaults
fn load_config(config_path: Option<&PathBuf>) -> Result<JobhubConfig> {
    let loader = ConfigLoader::new();

    match config_path {
        Some(path) => loader
            .load(Some(path))
            .with_context(|| format!("Failed to load configuration from {:?}", path)),
        None => loader
            .load(None::<&PathBuf>)
            .context("Failed to load configuration from environment"),
    }
}

/// Serve one job over stdio until the hub is done with this process
async fn run_worker_process() -> Result<()> {
    let registry = Arc::new(builtin::registry()?);
    let shutdown = CancellationToken::new();
    spawn_termination_listener(shutdown.clone());

    let runtime = WorkerRuntime::new(registry)
        .with_pid(std::process::id())
        .with_shutdown(shutdown);
    let (reader, writer) = jobhub_ipc::stdio();

    runtime
        .serve(reader, writer)
        .await
        .context("Worker protocol failure")?;
    debug!("Worker finished");
    Ok(())
}

/// Cancel `shutdown` when the hub asks this process to stop
fn spawn_termination_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    return;
                }
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
        }
        debug!("Termination requested");
        shutdown.cancel();
    });
}

/// Submit a job, stream its events, and print the outcome
async fn run_command(
    config: JobhubConfig,
    job_name: &str,
    params: Option<&str>,
    local: bool,
) -> Result<()> {
    let params: JsonValue = match params {
        Some(raw) => serde_json::from_str(raw).context("Invalid --params JSON")?,
        None => JsonValue::Null,
    };

    let registry = Arc::new(builtin::registry()?);
    let mut builder = JobHub::builder(Arc::clone(&registry))
        .config(config.execution)
        .runtime_options(RuntimeOptions {
            log_level: Some(config.logging.level.to_string()),
            ..RuntimeOptions::default()
        });
    if local {
        builder = builder.transport(Arc::new(LocalTransport::new(registry)));
    }
    let hub = builder.build().context("Failed to build job hub")?;

    let mut events = hub.subscribe();
    let job = hub
        .submit(job_name, params)
        .with_context(|| format!("Failed to submit job '{}'", job_name))?;
    info!(job_id = %job.id(), job = job_name, "Job submitted");

    let handle = job.handle();
    let outcome = handle.wait();
    tokio::pin!(outcome);
    let mut interrupted = false;

    let result = loop {
        tokio::select! {
            result = &mut outcome => break result,
            event = events.recv() => match event {
                Ok(event) if event.job_id == *job.id() => {
                    println!("{}", serde_json::to_string(&event)?);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Dropped {} job events", skipped);
                }
                Err(RecvError::Closed) => {}
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                info!(job_id = %job.id(), "Interrupted, aborting job");
                hub.abort(job.id(), "interrupted");
            }
        }
    };
    while let Ok(event) = events.try_recv() {
        if event.job_id == *job.id() {
            println!("{}", serde_json::to_string(&event)?);
        }
    }

    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(error) => Err(anyhow::Error::new(error)).context(format!("Job '{}' failed", job_name)),
    }
}

fn jobs_command() -> Result<()> {
    let registry = builtin::registry()?;
    for (name, description) in builtin::describe(&registry) {
        println!("{:<8} {}", name, description);
    }
    Ok(())
}

fn config_command(config_cmd: &ConfigCommands) -> Result<()> {
    match config_cmd {
        ConfigCommands::Validate { config_file } => {
            load_config(Some(config_file))?;
            println!("Configuration {:?} is valid", config_file);
            Ok(())
        }
        ConfigCommands::Generate { output } => {
            let sample = JobhubConfig::generate_sample();
            match output {
                Some(path) => {
                    std::fs::write(path, sample)
                        .with_context(|| format!("Failed to write {:?}", path))?;
                    println!("Sample configuration written to {:?}", path);
                }
                None => print!("{}", sample),
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle worker mode first, stdout belongs to the protocol
    if let Commands::Worker = cli.command {
        let level = std::env::var(WORKER_LOG_ENV).ok().or(cli.log_level.clone());
        init_worker_tracing(level.as_deref())?;
        return run_worker_process().await;
    }

    let mut config = load_config(cli.config.as_ref())?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level
            .parse::<LogLevel>()
            .map_err(|e| anyhow::anyhow!(e))?;
    }
    init_logging_from_config(&config.logging)?;

    match &cli.command {
        Commands::Run { job, params, local } => {
            run_command(config, job, params.as_deref(), *local).await
        }
        Commands::Jobs => jobs_command(),
        Commands::Config { config_cmd } => config_command(config_cmd),
        Commands::Worker => Ok(()),
    }
}
