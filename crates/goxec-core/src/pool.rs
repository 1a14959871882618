//! Fixed-size worker pool driving per-job container executions.
//!
//! A bounded channel of the same capacity as the worker count carries jobs
//! from the dispatch loop to the workers, so `submit` blocks once every
//! worker is busy and one job is queued per slot. That blocking is the
//! pipeline's back-pressure, reaching all the way to the broker read loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::core_types::{Frame, Job, JobStatus};
use crate::queue::{JobQueue, LogBus};
use crate::runner::ContainerRunner;

/// Fixed-size pool of cooperating workers.
pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `concurrency` workers sharing one bounded work channel.
    pub fn start(
        concurrency: usize,
        runner: Arc<dyn ContainerRunner>,
        queue: Arc<dyn JobQueue>,
        bus: Arc<dyn LogBus>,
        job_timeout: Duration,
    ) -> Self {
        log::info!("Starting worker pool with concurrency {}", concurrency);

        let (tx, rx) = mpsc::channel(concurrency.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..concurrency)
            .map(|id| {
                let rx = rx.clone();
                let runner = runner.clone();
                let queue = queue.clone();
                let bus = bus.clone();
                tokio::spawn(async move {
                    worker_loop(id, rx, runner, queue, bus, job_timeout).await;
                })
            })
            .collect();

        Self { tx, workers }
    }

    /// Hand a job to the pool, blocking while all workers are saturated.
    pub async fn submit(&self, job: Job) {
        if self.tx.send(job).await.is_err() {
            log::error!("Worker pool is stopped, dropping job");
        }
    }

    /// Graceful shutdown: close the channel and wait for every worker to
    /// finish its current job.
    pub async fn stop(self) {
        log::info!("Stopping worker pool, draining in-flight jobs");
        drop(self.tx);
        for worker in self.workers {
            if let Err(e) = worker.await {
                log::error!("Worker task failed: {}", e);
            }
        }
        log::info!("Worker pool stopped");
    }
}

async fn worker_loop(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    runner: Arc<dyn ContainerRunner>,
    queue: Arc<dyn JobQueue>,
    bus: Arc<dyn LogBus>,
    job_timeout: Duration,
) {
    log::debug!("Worker {} started", id);
    loop {
        let job = rx.lock().await.recv().await;
        let Some(job) = job else { break };

        log::debug!("Worker {} picked up job {}", id, job.id);
        process_job(job, runner.as_ref(), queue.as_ref(), bus.as_ref(), job_timeout).await;
    }
    log::debug!("Worker {} stopped", id);
}

/// Run one job end to end: execute, publish frames, acknowledge.
///
/// Soft failures (timeout, unsupported language, runtime errors) become a
/// `failed` terminal frame and the entry is still acknowledged; they are
/// never re-driven through the queue. Only a crashed worker, which never
/// reaches the acknowledgement, causes redelivery.
async fn process_job(
    job: Job,
    runner: &dyn ContainerRunner,
    queue: &dyn JobQueue,
    bus: &dyn LogBus,
    job_timeout: Duration,
) {
    let deadline = Instant::now() + job_timeout;

    let status = match runner.run(&job.id, &job.code, &job.language, deadline).await {
        Ok(run) => {
            if !run.output.is_empty() {
                broadcast(bus, &Frame::log(&job.id, &run.output)).await;
            }
            if run.exit_code == 0 {
                JobStatus::Completed
            } else {
                log::info!("Job {} exited with code {}", job.id, run.exit_code);
                JobStatus::Failed
            }
        }
        Err(e) => {
            log::error!("Job {} execution failed: {}", job.id, e);
            broadcast(bus, &Frame::log(&job.id, format!("Error: {}", e))).await;
            JobStatus::Failed
        }
    };

    broadcast(bus, &Frame::status(&job.id, status)).await;

    if let Some(entry_id) = &job.stream_entry_id {
        // An ack failure is not fatal: the recovery agent will eventually
        // reclaim the entry, bounded by the retry limit.
        if let Err(e) = queue.acknowledge(entry_id).await {
            log::error!("Failed to acknowledge entry {}: {}", entry_id, e);
        }
    }
}

async fn broadcast(bus: &dyn LogBus, frame: &Frame) {
    if let Err(e) = bus.broadcast(frame).await {
        log::error!("Failed to broadcast frame for job {}: {}", frame.job_id(), e);
    }
}
