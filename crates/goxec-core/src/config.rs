//! Shared configuration for the pipeline components.
//!
//! Stream, group, and channel names are fixed wire-level identifiers; the
//! broker address comes from the `REDIS_ADDR` environment variable with a
//! local default. Runtime tunables (concurrency, deadlines, recovery
//! cadence) live in builder-style structs so binaries can override them
//! from CLI flags.

use std::time::Duration;

/// Stream holding accepted jobs.
pub const JOB_STREAM: &str = "goxec:jobs";
/// Consumer group the worker nodes join.
pub const WORKER_GROUP: &str = "goxec:workers";
/// Pub/sub channel carrying log and status frames.
pub const LOG_CHANNEL: &str = "goxec:logs";
/// Stream receiving entries that exhausted their retries.
pub const DEAD_LETTER_STREAM: &str = "goxec:jobs:dead";

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub redis_addr: String,
    pub stream: String,
    pub group: String,
    pub log_channel: String,
    pub dead_letter_stream: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_addr: "localhost:6379".to_string(),
            stream: JOB_STREAM.to_string(),
            group: WORKER_GROUP.to_string(),
            log_channel: LOG_CHANNEL.to_string(),
            dead_letter_stream: DEAD_LETTER_STREAM.to_string(),
        }
    }
}

impl QueueConfig {
    /// Read the broker address from `REDIS_ADDR`, keeping defaults for the
    /// rest.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("REDIS_ADDR") {
            if !addr.is_empty() {
                config.redis_addr = addr;
            }
        }
        config
    }

    pub fn with_redis_addr(mut self, addr: impl Into<String>) -> Self {
        self.redis_addr = addr.into();
        self
    }
}

/// Tunables for the worker node.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent container executions.
    pub concurrency: usize,
    /// Hard deadline per job.
    pub job_timeout: Duration,
    /// How often the recovery agent scans the pending list.
    pub recovery_interval: Duration,
    /// Pending idle time after which an entry is considered abandoned.
    pub max_idle: Duration,
    /// Delivery count beyond which an entry is dead-lettered.
    pub max_retries: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            job_timeout: Duration::from_secs(30),
            recovery_interval: Duration::from_secs(30),
            max_idle: Duration::from_secs(60),
            max_retries: 5,
        }
    }
}

impl WorkerConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = interval;
        self
    }

    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }
}
