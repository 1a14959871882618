//! Error types for the execution pipeline
//!
//! Two error families cover the core: `RunnerError` for container lifecycle
//! failures and `QueueError` for broker interactions. The split matters
//! because their dispositions differ: a runner failure becomes a `failed`
//! status frame and the stream entry is still acknowledged, while queue
//! errors are either surfaced to the submitting client (publish) or retried
//! with back-off (reads and acks).

use thiserror::Error;

/// Failures surfaced by a container runner.
///
/// A non-zero exit code inside the container is deliberately absent here:
/// the snippet's own failure is reported through the captured stderr and
/// the exit code on [`crate::RunOutput`], not as a runner error.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("unsupported language: {0}")]
    LanguageUnsupported(String),
    #[error("failed to pull image {image}: {source}")]
    ImagePullFailed {
        image: String,
        source: bollard::errors::Error,
    },
    #[error("failed to create container: {0}")]
    ContainerCreateFailed(bollard::errors::Error),
    #[error("failed to start container: {0}")]
    ContainerStartFailed(bollard::errors::Error),
    #[error("execution timed out")]
    Timeout,
    #[error("container runtime error: {0}")]
    RuntimeError(String),
}

/// Failures surfaced by the job stream and log bus adapters.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("queue is shut down")]
    Closed,
}
