//! Redis Streams adapter for the job queue and log bus.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::mpsc;

use crate::config::QueueConfig;
use crate::core_types::{Frame, Job};
use crate::errors::QueueError;
use crate::queue::{JobQueue, LogBus};

/// Stream entry field holding the serialized job payload.
pub(crate) const JOB_FIELD: &str = "job";

/// Bound on a single blocking read, so shutdown is observed promptly.
const READ_BLOCK: Duration = Duration::from_secs(2);
/// Fixed back-off applied after a transient read error.
const READ_BACKOFF: Duration = Duration::from_secs(1);

/// Redis-backed implementation of [`JobQueue`] and [`LogBus`].
///
/// Jobs travel on a stream consumed through a consumer group; frames travel
/// on a fire-and-forget pub/sub channel. The connection manager reconnects
/// transparently and is cheap to clone, so one adapter is shared by the
/// ingress server, every worker, and the recovery agent.
#[derive(Clone)]
pub struct RedisJobQueue {
    client: redis::Client,
    conn: ConnectionManager,
    config: QueueConfig,
}

impl RedisJobQueue {
    /// Connect to the broker and fail fast if it is unreachable.
    pub async fn connect(config: QueueConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(format!("redis://{}", config.redis_addr))?;
        let mut conn = ConnectionManager::new(client.clone()).await?;

        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        log::debug!("Connected to redis at {} ({})", config.redis_addr, pong);

        Ok(Self {
            client,
            conn,
            config,
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub(crate) fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Create the consumer group, tolerating a group that already exists.
    async fn ensure_group(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let created: Result<String, redis::RedisError> = conn
            .xgroup_create_mkstream(&self.config.stream, &self.config.group, "$")
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Unique consumer name for this process, derived from the hostname.
    fn consumer_name() -> String {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| format!("consumer-{}", uuid::Uuid::new_v4()))
    }

    pub(crate) fn decode_job(entry_id: &str, payload: &str) -> Option<Job> {
        match serde_json::from_str::<Job>(payload) {
            Ok(mut job) => {
                job.stream_entry_id = Some(entry_id.to_string());
                Some(job)
            }
            Err(e) => {
                log::error!("Failed to decode job payload for entry {}: {}", entry_id, e);
                None
            }
        }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn publish(&self, job: &Job) -> Result<String, QueueError> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        let entry_id: String = conn
            .xadd(&self.config.stream, "*", &[(JOB_FIELD, payload.as_str())])
            .await?;
        Ok(entry_id)
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<Job>, QueueError> {
        self.ensure_group().await?;

        let consumer = Self::consumer_name();
        log::info!(
            "Joining consumer group {} on {} as {}",
            self.config.group,
            self.config.stream,
            consumer
        );

        // Capacity 1: pull at most one entry ahead of an available worker,
        // so back-pressure from the pool reaches the broker read loop.
        let (tx, rx) = mpsc::channel(1);
        // Blocking reads get their own connection; on the shared multiplexed
        // one they would stall every concurrent ack and publish.
        let mut conn = ConnectionManager::new(self.client.clone()).await?;
        let config = self.config.clone();

        tokio::spawn(async move {
            let options = StreamReadOptions::default()
                .group(&config.group, &consumer)
                .count(1)
                .block(READ_BLOCK.as_millis() as usize);

            while !tx.is_closed() {
                let reply: Result<Option<StreamReadReply>, redis::RedisError> = conn
                    .xread_options(&[config.stream.as_str()], &[">"], &options)
                    .await;

                let reply = match reply {
                    Ok(Some(reply)) => reply,
                    // Poll timed out with no new entries.
                    Ok(None) => continue,
                    Err(e) => {
                        log::error!("Stream read failed, backing off: {}", e);
                        tokio::time::sleep(READ_BACKOFF).await;
                        continue;
                    }
                };

                for key in reply.keys {
                    for entry in key.ids {
                        let payload: Option<String> = entry.get(JOB_FIELD);
                        let Some(payload) = payload else {
                            log::error!("Stream entry {} has no job field, skipping", entry.id);
                            continue;
                        };
                        // Malformed payloads stay on the pending list; the
                        // recovery agent dead-letters them once their
                        // retries are exhausted.
                        let Some(job) = Self::decode_job(&entry.id, &payload) else {
                            continue;
                        };
                        if tx.send(job).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn acknowledge(&self, entry_id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(&self.config.stream, &self.config.group, &[entry_id])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LogBus for RedisJobQueue {
    async fn broadcast(&self, frame: &Frame) -> Result<(), QueueError> {
        let payload = serde_json::to_string(frame)?;
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(&self.config.log_channel, payload).await?;
        Ok(())
    }

    async fn subscribe_logs(&self) -> Result<mpsc::Receiver<Frame>, QueueError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.config.log_channel).await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::error!("Failed to read log bus message: {}", e);
                        continue;
                    }
                };
                let frame: Frame = match serde_json::from_str(&payload) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::error!("Failed to decode log bus frame: {}", e);
                        continue;
                    }
                };
                if tx.send(frame).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}
