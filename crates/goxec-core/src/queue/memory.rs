//! Deterministic in-memory queue and log bus for tests.
//!
//! These doubles honor the same contracts as the Redis adapter (entry ids
//! assigned on publish, payloads round-tripping through the serialized
//! form, idempotent acknowledgement) without needing a broker.
//! Both are handles around shared state, so cloning one yields a view onto
//! the same queue.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::core_types::{Frame, Job};
use crate::errors::QueueError;
use crate::queue::{JobQueue, LogBus};

#[derive(Default)]
struct QueueState {
    seq: u64,
    ready: VecDeque<Job>,
    published: Vec<String>,
    acked: Vec<String>,
}

/// In-memory stand-in for the durable job stream.
#[derive(Clone, Default)]
pub struct InMemoryQueue {
    state: Arc<Mutex<QueueState>>,
    wakeup: Arc<Notify>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry ids assigned so far, in publish order.
    pub async fn published(&self) -> Vec<String> {
        self.state.lock().await.published.clone()
    }

    /// Entry ids acknowledged so far.
    pub async fn acked(&self) -> Vec<String> {
        self.state.lock().await.acked.clone()
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn publish(&self, job: &Job) -> Result<String, QueueError> {
        // Round-trip through the wire form so the delivered job matches
        // what a broker would hand back.
        let payload = serde_json::to_string(job)?;
        let mut delivered: Job = serde_json::from_str(&payload)?;

        let mut state = self.state.lock().await;
        state.seq += 1;
        let entry_id = format!("{}-0", state.seq);
        delivered.stream_entry_id = Some(entry_id.clone());
        state.published.push(entry_id.clone());
        state.ready.push_back(delivered);
        drop(state);

        self.wakeup.notify_one();
        Ok(entry_id)
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<Job>, QueueError> {
        let (tx, rx) = mpsc::channel(1);
        let state = self.state.clone();
        let wakeup = self.wakeup.clone();

        tokio::spawn(async move {
            loop {
                let next = state.lock().await.ready.pop_front();
                match next {
                    Some(job) => {
                        if tx.send(job).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = wakeup.notified() => {}
                            _ = tx.closed() => return,
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn acknowledge(&self, entry_id: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if !state.acked.iter().any(|id| id == entry_id) {
            state.acked.push(entry_id.to_string());
        }
        Ok(())
    }
}

#[derive(Default)]
struct BusState {
    frames: Vec<Frame>,
    subscribers: Vec<mpsc::Sender<Frame>>,
}

/// In-memory stand-in for the pub/sub log bus.
#[derive(Clone, Default)]
pub struct InMemoryLogBus {
    state: Arc<Mutex<BusState>>,
}

impl InMemoryLogBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every frame broadcast so far, in order.
    pub async fn frames(&self) -> Vec<Frame> {
        self.state.lock().await.frames.clone()
    }
}

#[async_trait]
impl LogBus for InMemoryLogBus {
    async fn broadcast(&self, frame: &Frame) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.frames.push(frame.clone());
        state
            .subscribers
            .retain(|tx| tx.try_send(frame.clone()).is_ok());
        Ok(())
    }

    async fn subscribe_logs(&self) -> Result<mpsc::Receiver<Frame>, QueueError> {
        let (tx, rx) = mpsc::channel(64);
        self.state.lock().await.subscribers.push(tx);
        Ok(rx)
    }
}
