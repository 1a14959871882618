//! goxec API server binary.
//!
//! Wires the ingress layer to the Redis-backed job stream and log bus. The
//! broker must be reachable at startup (fail-fast ping); runtime failures
//! after that are reported to clients and never take the process down.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use goxec_server::{shutdown_signal, ApiServer, ServerConfig};
use goxec_core::{JobQueue, LogBus, QueueConfig, RedisJobQueue};
use log::LevelFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about = "goxec API server - accept snippets and stream their output")]
struct Cli {
    #[clap(long, default_value = "0.0.0.0:8080")]
    bind_addr: String,

    #[clap(long, help = "Redis address, overriding the REDIS_ADDR environment variable")]
    redis_addr: Option<String>,

    #[clap(long, short, default_value = "info")]
    log_level: String,

    #[clap(long, default_value_t = 65536, help = "Maximum accepted snippet length in bytes")]
    max_code_len: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level_filter = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    let mut queue_config = QueueConfig::from_env();
    if let Some(addr) = cli.redis_addr {
        queue_config = queue_config.with_redis_addr(addr);
    }

    log::info!("Connecting to redis at {}", queue_config.redis_addr);
    let queue = Arc::new(
        RedisJobQueue::connect(queue_config)
            .await
            .context("failed to connect to redis")?,
    );

    let server_config = ServerConfig::default()
        .with_bind_addr_str(&cli.bind_addr)?
        .with_max_code_len(cli.max_code_len);

    let server = ApiServer::with_config(
        queue.clone() as Arc<dyn JobQueue>,
        queue as Arc<dyn LogBus>,
        server_config,
    );

    server.serve_with_shutdown(shutdown_signal()).await?;
    Ok(())
}
