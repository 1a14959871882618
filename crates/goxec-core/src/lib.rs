//! Core job-dispatch and execution pipeline for the goxec engine.
//!
//! This crate holds everything shared by the ingress server and the worker
//! nodes: the wire-level data model, the durable job stream with its
//! consumer group and recovery agent, the bounded worker pool, the
//! container runner, and the log bus that binds execution output back to
//! the submitting client.
//!
//! # Architecture Overview
//!
//! A submission accepted by the ingress server becomes exactly one stream
//! entry. A worker node pulls entries through a consumer group into a
//! bounded in-memory channel, executes each snippet in an ephemeral
//! resource-capped container, publishes the captured output and a terminal
//! status frame on the log bus, and acknowledges the entry. Entries
//! abandoned by a crashed worker are reclaimed by the recovery agent and
//! either redelivered or dead-lettered once their retries are exhausted.
//!
//! The queue and runner are capability traits so tests can substitute the
//! deterministic in-memory implementations.

pub mod config;
pub mod core_types;
pub mod errors;
pub mod pool;
pub mod queue;
pub mod runner;

pub use config::{QueueConfig, WorkerConfig};
pub use core_types::{Frame, Job, JobStatus, RunOutput};
pub use errors::{QueueError, RunnerError};
pub use pool::WorkerPool;
pub use queue::{InMemoryLogBus, InMemoryQueue, JobQueue, LogBus, RedisJobQueue};
pub use runner::{ContainerRunner, DockerRunner, Language, RunnerConfig};
