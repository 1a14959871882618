//! goxec worker node binary.
//!
//! Pulls jobs from the durable stream through the consumer group, executes
//! each snippet in an ephemeral Docker container via the worker pool, and
//! runs the recovery agent that reclaims entries abandoned by crashed
//! workers. Both the broker and the Docker daemon must be reachable at
//! startup; individual job failures never take the process down.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use goxec_core::{
    ContainerRunner, DockerRunner, JobQueue, LogBus, QueueConfig, RedisJobQueue, RunnerConfig,
    WorkerConfig, WorkerPool,
};
use log::LevelFilter;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[clap(author, version, about = "goxec worker - execute queued snippets in containers")]
struct Cli {
    #[clap(long, help = "Redis address, overriding the REDIS_ADDR environment variable")]
    redis_addr: Option<String>,

    #[clap(long, default_value_t = 3, help = "Concurrent container executions")]
    concurrency: usize,

    #[clap(long, default_value_t = 30, help = "Hard deadline per job in seconds")]
    job_timeout_secs: u64,

    #[clap(long, default_value_t = 30, help = "Recovery scan interval in seconds")]
    recovery_interval_secs: u64,

    #[clap(long, default_value_t = 60, help = "Pending idle time before an entry is reclaimed, in seconds")]
    max_idle_secs: u64,

    #[clap(long, default_value_t = 5, help = "Delivery count beyond which an entry is dead-lettered")]
    max_retries: usize,

    #[clap(long, short, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level_filter = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    log::info!("Starting goxec worker node");

    let mut queue_config = QueueConfig::from_env();
    if let Some(addr) = cli.redis_addr {
        queue_config = queue_config.with_redis_addr(addr);
    }
    let worker_config = WorkerConfig::default()
        .with_concurrency(cli.concurrency)
        .with_job_timeout(Duration::from_secs(cli.job_timeout_secs))
        .with_recovery_interval(Duration::from_secs(cli.recovery_interval_secs))
        .with_max_idle(Duration::from_secs(cli.max_idle_secs))
        .with_max_retries(cli.max_retries);

    log::info!("Connecting to redis at {}", queue_config.redis_addr);
    let queue = Arc::new(
        RedisJobQueue::connect(queue_config)
            .await
            .context("failed to connect to redis")?,
    );

    let runner = Arc::new(
        DockerRunner::connect(RunnerConfig::default())
            .await
            .context("failed to connect to docker daemon")?,
    );

    let pool = WorkerPool::start(
        worker_config.concurrency,
        runner as Arc<dyn ContainerRunner>,
        queue.clone() as Arc<dyn JobQueue>,
        queue.clone() as Arc<dyn LogBus>,
        worker_config.job_timeout,
    );

    let mut jobs = queue.subscribe().await.context("failed to subscribe to job stream")?;

    // Recovery redelivers through its own channel; the dispatch loop below
    // merges both sources into the pool.
    let (redeliver_tx, mut redelivered) = mpsc::channel(1);
    let recovery = {
        let queue = queue.clone();
        let config = worker_config.clone();
        tokio::spawn(async move {
            queue
                .run_recovery(
                    redeliver_tx,
                    config.recovery_interval,
                    config.max_idle,
                    config.max_retries,
                )
                .await;
        })
    };

    log::info!("Worker node listening for jobs");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                log::info!("Shutdown signal received");
                break;
            }
            job = jobs.recv() => {
                let Some(job) = job else { break };
                log::info!("Received job {} from stream", job.id);
                pool.submit(job).await;
            }
            job = redelivered.recv() => {
                let Some(job) = job else { break };
                log::info!("Received redelivered job {}", job.id);
                pool.submit(job).await;
            }
        }
    }

    // Dropping the receiver stops the subscription within its poll
    // interval; the recovery agent is aborted outright. In-flight jobs
    // drain through the pool before exit.
    drop(jobs);
    drop(redelivered);
    recovery.abort();
    pool.stop().await;

    log::info!("Worker node stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
