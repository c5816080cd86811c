use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use shuttle::core::transfer_engine::select_strategy;
use shuttle::core::{
    AuthFailure, AuthObserver, FileRef, Orchestrator, TaskEvent, TaskId, TaskOutcome, validator,
};
use shuttle::format::{format_bytes, format_duration, format_rate};
use shuttle::logging::{LogConfig, ProgressLogThrottle};
use shuttle::{config, context};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(name = "shuttle")]
#[command(about = "Upload files to a remote media store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./shuttle.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload files and wait until every transfer has finished
    Upload(UploadArgs),
    /// Validate files without uploading anything
    Check(CheckArgs),
    /// Print the effective configuration
    Config(SettingsArgs),
}

#[derive(Args)]
struct UploadArgs {
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Use the resumable chunked strategy for every file
    #[arg(long)]
    resumable: bool,

    #[command(flatten)]
    settings: SettingsArgs,
}

#[derive(Args)]
struct CheckArgs {
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    #[command(flatten)]
    settings: SettingsArgs,
}

#[derive(Args, Serialize)]
struct SettingsArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    endpoint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    concurrency: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    retry_attempts: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    json_logs: Option<bool>,
}

/// Tells the user the token needs replacing. The CLI has no login flow.
struct LogAuthObserver;

#[async_trait]
impl AuthObserver for LogAuthObserver {
    async fn authorization_failed(&self, failure: AuthFailure) {
        error!(
            file = %failure.file_name,
            status = failure.status,
            "Credentials rejected, provide a valid token with --token or SHUTTLE_TOKEN"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.command {
        Commands::Upload(args) => &args.settings,
        Commands::Check(args) => &args.settings,
        Commands::Config(settings) => settings,
    };
    let config = config::AppConfig::new(cli.config.as_deref(), Some(settings))
        .context("Failed to load configuration")?;

    shuttle::logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    match &cli.command {
        Commands::Upload(args) => {
            let ctx = context::AppContext::new(config, Some(Arc::new(LogAuthObserver)))?;
            run_upload(ctx, &args.paths, args.resumable)
                .await
                .context("Upload failed")?
        }
        Commands::Check(args) => run_check(&config, &args.paths).await?,
        Commands::Config(_) => print!("{}", config.to_toml_redacted()?),
    }

    Ok(())
}

async fn load_files(paths: &[PathBuf], resumable: bool) -> (Vec<FileRef>, usize) {
    let mut files = Vec::with_capacity(paths.len());
    let mut unreadable = 0;

    for path in paths {
        match FileRef::from_path(path).await {
            Ok(file) => files.push(file.resumable(resumable)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable path");
                unreadable += 1;
            }
        }
    }
    (files, unreadable)
}

async fn run_upload(ctx: context::AppContext, paths: &[PathBuf], resumable: bool) -> Result<()> {
    let orchestrator = ctx.orchestrator.clone();
    let (files, unreadable) = load_files(paths, resumable).await;
    info!(
        files = files.len(),
        concurrency = ctx.config.concurrency,
        endpoint = %ctx.config.endpoint,
        simulation = ctx.config.simulation,
        "Starting upload"
    );

    let progress = tokio::spawn(log_progress(
        orchestrator.subscribe(),
        Duration::from_secs(1),
    ));

    let report = orchestrator.submit(files).await?;
    for rejection in &report.rejected {
        println!("rejected  {}  [{}] {}", rejection.file_name, rejection.code.as_str(), rejection.message);
    }

    let outcomes = if report.accepted.is_empty() {
        Vec::new()
    } else {
        wait_or_interrupt(&orchestrator, &report.accepted).await?
    };
    progress.abort();

    let views: HashMap<TaskId, _> = orchestrator
        .snapshot()
        .await?
        .into_iter()
        .map(|view| (view.id, view))
        .collect();

    let mut unfinished = 0;
    for (id, outcome) in &outcomes {
        let (name, size) = views
            .get(id)
            .map(|v| (v.name.as_str(), format_bytes(v.byte_size)))
            .unwrap_or(("?", String::from("-")));

        match outcome {
            TaskOutcome::Completed { remote_object_id } => {
                println!("done      {}  {}  -> {}", name, size, remote_object_id)
            }
            TaskOutcome::Failed(failure) => {
                unfinished += 1;
                println!("failed    {}  {}  {}", name, size, failure)
            }
            TaskOutcome::Cancelled => {
                unfinished += 1;
                println!("cancelled {}  {}", name, size)
            }
            TaskOutcome::Unknown => {
                unfinished += 1;
                println!("unknown   {}", id)
            }
        }
    }

    let _ = orchestrator.shutdown().await;

    let problems = unfinished + report.rejected.len() + unreadable;
    if problems > 0 {
        anyhow::bail!("{} of {} files were not uploaded", problems, paths.len());
    }
    info!(files = outcomes.len(), "All transfers completed");
    Ok(())
}

/// Wait for the tasks; Ctrl-C cancels everything and then waits for the
/// cancellations to land.
async fn wait_or_interrupt(
    orchestrator: &Orchestrator,
    ids: &[TaskId],
) -> Result<Vec<(TaskId, TaskOutcome)>> {
    tokio::select! {
        outcomes = orchestrator.await_all(ids) => Ok(outcomes?),
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            warn!("Interrupted, cancelling transfers");
            orchestrator.cancel_all().await?;
            Ok(orchestrator.await_all(ids).await?)
        }
    }
}

async fn log_progress(mut events: broadcast::Receiver<TaskEvent>, interval: Duration) {
    let mut throttle = ProgressLogThrottle::new(interval);

    loop {
        match events.recv().await {
            Ok(TaskEvent::Progress {
                id,
                percent,
                bytes_per_sec,
                eta_secs,
            }) => {
                if throttle.should_log(id, percent, Instant::now()) {
                    info!(
                        task_id = %id.short(),
                        percent,
                        rate = %bytes_per_sec.map(format_rate).unwrap_or_else(|| "-".into()),
                        eta = %eta_secs.map(format_duration).unwrap_or_else(|| "-".into()),
                        "Uploading"
                    );
                }
            }
            Ok(TaskEvent::Finalizing { id }) => {
                info!(task_id = %id.short(), "Waiting for the remote to register the object")
            }
            Ok(TaskEvent::Completed { id, .. })
            | Ok(TaskEvent::Failed { id, .. })
            | Ok(TaskEvent::Cancelled { id }) => throttle.forget(id),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Progress log fell behind")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_check(config: &config::AppConfig, paths: &[PathBuf]) -> Result<()> {
    let (files, unreadable) = load_files(paths, false).await;
    let mut rejected = 0;

    for file in &files {
        match validator::validate(file) {
            Ok(category) => {
                let strategy = select_strategy(
                    file.byte_size,
                    file.prefer_resumable,
                    config.resumable_threshold_bytes,
                );
                println!(
                    "ok        {}  {}  {}  {}",
                    file.name,
                    format_bytes(file.byte_size),
                    category,
                    strategy
                );
            }
            Err(rejection) => {
                rejected += 1;
                println!("rejected  {}  [{}] {}", file.name, rejection.code.as_str(), rejection.message);
            }
        }
    }

    if rejected + unreadable > 0 {
        anyhow::bail!(
            "{} of {} files would not be accepted",
            rejected + unreadable,
            paths.len()
        );
    }
    Ok(())
}
