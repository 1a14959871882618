//! Durable job handoff and ephemeral log fan-out.
//!
//! Two capability contracts decouple the pipeline from the broker: a
//! [`JobQueue`] for the durable, consumer-group-based job stream, and a
//! [`LogBus`] for best-effort frame fan-out. Production uses the Redis
//! adapter ([`RedisJobQueue`]); tests substitute the deterministic
//! in-memory implementations from [`memory`].

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core_types::{Frame, Job};
use crate::errors::QueueError;

pub mod memory;
pub mod recovery;
mod redis;

pub use self::memory::{InMemoryLogBus, InMemoryQueue};
pub use self::recovery::{recovery_action, RecoveryAction};
pub use self::redis::RedisJobQueue;

/// Durable handoff between ingress and workers.
///
/// Delivery is at-least-once: a subscribed job that is never acknowledged
/// stays on the pending list and is eventually reclaimed by the recovery
/// agent.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Append one job to the stream, returning the broker-assigned entry id.
    async fn publish(&self, job: &Job) -> Result<String, QueueError>;

    /// Join the consumer group and stream newly delivered jobs.
    ///
    /// Each delivered job carries its `stream_entry_id` for later
    /// acknowledgement. Dropping the receiver stops the subscription within
    /// the bounded poll interval.
    async fn subscribe(&self) -> Result<mpsc::Receiver<Job>, QueueError>;

    /// Remove an entry from the pending list.
    async fn acknowledge(&self, entry_id: &str) -> Result<(), QueueError>;
}

/// Ephemeral, best-effort frame fan-out.
///
/// Not a system of record: a failed broadcast is logged and dropped, and a
/// subscriber that connects late has no way to recover missed frames.
#[async_trait]
pub trait LogBus: Send + Sync {
    /// Publish one frame to the shared log topic.
    async fn broadcast(&self, frame: &Frame) -> Result<(), QueueError>;

    /// Stream every frame on the topic, across all jobs.
    async fn subscribe_logs(&self) -> Result<mpsc::Receiver<Frame>, QueueError>;
}
