//! Recovery agent: reclaims jobs abandoned by crashed workers.
//!
//! A worker that dies mid-job leaves its stream entry on the pending list.
//! The recovery agent periodically claims entries whose idle time exceeds a
//! threshold, then routes each one by its delivery count: entries with
//! retries remaining are re-delivered to the local pool as fresh in-memory
//! jobs (the entry stays pending until a worker acknowledges it), while
//! entries past the retry limit are copied to the dead-letter stream and
//! acknowledged so they stop circulating.

use std::time::Duration;

use redis::streams::{StreamAutoClaimOptions, StreamAutoClaimReply, StreamPendingCountReply};
use redis::AsyncCommands;
use tokio::sync::mpsc;

use crate::core_types::Job;
use crate::errors::QueueError;
use crate::queue::redis::JOB_FIELD;
use crate::queue::RedisJobQueue;

/// Consumer name the recovery agent claims entries under.
const RECOVERY_CONSUMER: &str = "recovery-agent";
/// Entries claimed per XAUTOCLAIM call.
const CLAIM_BATCH: usize = 10;

/// What to do with a claimed pending entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Deliver the job to a worker again.
    Redeliver,
    /// Move the raw payload to the dead-letter stream and acknowledge.
    DeadLetter,
}

/// Route a claimed entry by how many times it has already been delivered.
pub fn recovery_action(delivery_count: usize, max_retries: usize) -> RecoveryAction {
    if delivery_count > max_retries {
        RecoveryAction::DeadLetter
    } else {
        RecoveryAction::Redeliver
    }
}

impl RedisJobQueue {
    /// Run the recovery loop until the redelivery channel closes.
    ///
    /// At each tick, claims entries idle longer than `max_idle` into the
    /// recovery consumer, following the returned cursor in batches.
    pub async fn run_recovery(
        &self,
        redeliver: mpsc::Sender<Job>,
        interval: Duration,
        max_idle: Duration,
        max_retries: usize,
    ) {
        log::info!(
            "Starting recovery agent (interval {:?}, max idle {:?}, max retries {})",
            interval,
            max_idle,
            max_retries
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if redeliver.is_closed() {
                return;
            }
            if let Err(e) = self
                .reclaim_stale(&redeliver, max_idle, max_retries)
                .await
            {
                log::error!("Recovery pass failed: {}", e);
            }
        }
    }

    async fn reclaim_stale(
        &self,
        redeliver: &mpsc::Sender<Job>,
        max_idle: Duration,
        max_retries: usize,
    ) -> Result<(), QueueError> {
        let config = self.config().clone();
        let mut conn = self.connection();
        let mut cursor = "0-0".to_string();

        loop {
            let reply: StreamAutoClaimReply = conn
                .xautoclaim_options(
                    &config.stream,
                    &config.group,
                    RECOVERY_CONSUMER,
                    max_idle.as_millis() as u64,
                    &cursor,
                    StreamAutoClaimOptions::default().count(CLAIM_BATCH),
                )
                .await?;

            if reply.claimed.is_empty() {
                return Ok(());
            }
            log::warn!("Claimed {} stale stream entries", reply.claimed.len());

            for entry in &reply.claimed {
                let payload: Option<String> = entry.get(JOB_FIELD);
                let Some(payload) = payload else {
                    log::error!("Claimed entry {} has no job field", entry.id);
                    continue;
                };

                // The claim itself bumped the delivery counter, so the
                // count read here includes this recovery pass.
                let pending: StreamPendingCountReply = conn
                    .xpending_count(&config.stream, &config.group, &entry.id, &entry.id, 1)
                    .await?;
                let delivery_count = pending
                    .ids
                    .first()
                    .map(|p| p.times_delivered)
                    .unwrap_or(1);

                match recovery_action(delivery_count, max_retries) {
                    RecoveryAction::DeadLetter => {
                        log::warn!(
                            "Entry {} exceeded {} deliveries, moving to dead-letter stream",
                            entry.id,
                            max_retries
                        );
                        let _: String = conn
                            .xadd(
                                &config.dead_letter_stream,
                                "*",
                                &[(JOB_FIELD, payload.as_str())],
                            )
                            .await?;
                        let _: i64 = conn
                            .xack(&config.stream, &config.group, &[&entry.id])
                            .await?;
                    }
                    RecoveryAction::Redeliver => {
                        // Undecodable payloads stay pending; each pass bumps
                        // their delivery count until they dead-letter above.
                        let Some(mut job) = Self::decode_job(&entry.id, &payload) else {
                            continue;
                        };
                        job.delivery_count = delivery_count as u64;
                        log::info!(
                            "Redelivering job {} (entry {}, delivery {})",
                            job.id,
                            entry.id,
                            delivery_count
                        );
                        if redeliver.send(job).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }

            cursor = reply.next_stream_id.clone();
            if cursor == "0-0" {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redelivers_while_retries_remain() {
        for count in 1..=5 {
            assert_eq!(recovery_action(count, 5), RecoveryAction::Redeliver);
        }
    }

    #[test]
    fn test_dead_letters_past_max_retries() {
        assert_eq!(recovery_action(6, 5), RecoveryAction::DeadLetter);
        assert_eq!(recovery_action(100, 5), RecoveryAction::DeadLetter);
    }

    #[test]
    fn test_boundary_is_inclusive() {
        // A count equal to the limit still gets one more chance.
        assert_eq!(recovery_action(5, 5), RecoveryAction::Redeliver);
    }
}
