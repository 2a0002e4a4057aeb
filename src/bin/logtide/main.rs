// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use logtide::bounded_channel;
use logtide::config::AgentConfig;
use logtide::copying::{BatchConfig, CopyingConfig, CopyingManager};
use logtide::monitors::scheduler::MonitorScheduler;
use logtide::tailer::CheckpointStore;
use logtide::uploader::{
    HttpsTransport, RateLimitConfig, RateLimiter, RetryConfig, Uploader,
};

#[derive(Debug, Parser)]
#[command(
    name = "logtide",
    version,
    about = "Host telemetry agent: runs metric monitors and ships their logs"
)]
struct Args {
    /// Path to the agent configuration file
    #[arg(long, env = "LOGTIDE_CONFIG", default_value = "/etc/logtide/agent.toml")]
    config: PathBuf,

    /// Log filter (tracing EnvFilter syntax)
    #[arg(long, env = "LOGTIDE_LOG", default_value = "logtide=info")]
    log: String,

    /// Write the agent's own log to this file instead of stderr. The file
    /// can be added to [[logs]] to ship the agent log itself.
    #[arg(long, env = "LOGTIDE_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    match &args.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new(&args.log))
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new(&args.log))
                .init();
        }
    }

    let config = AgentConfig::load(&args.config)?;
    info!(
        config = ?args.config,
        monitors = config.monitors.len(),
        logs = config.logs.len(),
        "logtide starting"
    );

    // The only process-fatal startup errors: a transport that cannot be
    // constructed and a checkpoint store that cannot be trusted.
    let transport =
        HttpsTransport::new(&config.upload.endpoint, config.upload.api_token.clone())?;
    let checkpoint = CheckpointStore::open(&config.upload.checkpoint_path)?;

    let session = format!(
        "{}-{}",
        gethostname::gethostname().to_string_lossy(),
        std::process::id()
    );

    let mut scheduler = MonitorScheduler::new(&config.monitor_log_dir);
    scheduler.start(&config.monitors);

    let mut stream_paths = scheduler.output_paths();
    stream_paths.extend(config.logs.iter().map(|l| l.path.clone()));

    let (jobs_tx, jobs_rx) = bounded_channel::bounded(8);
    let (outcomes_tx, outcomes_rx) = bounded_channel::bounded(8);

    let limiter = Arc::new(RateLimiter::new(RateLimitConfig::from(
        &config.upload.rate_limit,
    )));
    let uploader = Uploader::new(
        transport,
        limiter,
        RetryConfig::from(&config.upload.retry),
        session,
        jobs_rx,
        outcomes_tx,
    );

    let copying_config = CopyingConfig {
        poll_interval: config.upload.poll_interval(),
        max_line_len: config.upload.max_line_len,
        batch: BatchConfig {
            max_bytes: config.upload.batch_max_bytes,
            max_records: config.upload.batch_max_records,
            max_age: config.upload.batch_max_age(),
        },
        backlog_limit: config.upload.backlog_limit,
    };
    let manager = CopyingManager::new(
        copying_config,
        checkpoint,
        stream_paths,
        jobs_tx,
        outcomes_rx,
    );

    let manager_cancel = CancellationToken::new();
    let uploader_cancel = CancellationToken::new();
    let manager_handle = tokio::spawn(manager.run(manager_cancel.clone()));
    let uploader_handle = tokio::spawn(uploader.run(uploader_cancel.clone()));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    // Monitors stop first so their output files go quiet, then the
    // copying manager flushes and closes the upload queue, and finally
    // the uploader finishes or is cut off. Anything unconfirmed is
    // re-read from the last checkpoint on the next start.
    scheduler.stop().await;

    manager_cancel.cancel();
    if tokio::time::timeout(Duration::from_secs(10), manager_handle)
        .await
        .is_err()
    {
        error!("copying manager did not stop in time");
    }

    uploader_cancel.cancel();
    if tokio::time::timeout(Duration::from_secs(5), uploader_handle)
        .await
        .is_err()
    {
        error!("uploader did not stop in time");
    }

    info!("logtide stopped");
    Ok(())
}
