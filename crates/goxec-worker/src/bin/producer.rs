//! Smoke-test producer: publishes a handful of jobs straight to the stream.
//!
//! Useful for exercising a worker node end to end without the API server.

use anyhow::{Context, Result};
use clap::Parser;
use goxec_core::{Job, JobQueue, QueueConfig, RedisJobQueue};
use log::LevelFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about = "goxec producer - seed the job stream with sample snippets")]
struct Cli {
    #[clap(long, help = "Redis address, overriding the REDIS_ADDR environment variable")]
    redis_addr: Option<String>,

    #[clap(long, default_value_t = 5, help = "Number of jobs to publish")]
    count: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .init();

    let mut queue_config = QueueConfig::from_env();
    if let Some(addr) = cli.redis_addr {
        queue_config = queue_config.with_redis_addr(addr);
    }

    let queue = RedisJobQueue::connect(queue_config)
        .await
        .context("failed to connect to redis")?;

    for i in 1..=cli.count {
        let job = Job::new(
            format!("job-{}", i),
            format!("print('Hello from job {}')", i),
            "python",
        );
        log::info!("Publishing job {}", job.id);
        let entry_id = queue
            .publish(&job)
            .await
            .with_context(|| format!("failed to publish job {}", job.id))?;
        log::debug!("Job {} appended as entry {}", job.id, entry_id);
    }

    log::info!("Published {} jobs", cli.count);
    Ok(())
}
