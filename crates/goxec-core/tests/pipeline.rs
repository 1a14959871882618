//! Cross-component pipeline tests over the in-memory queue and log bus.
//!
//! These exercise the dispatch path the way the worker binary wires it:
//! publish → subscribe → pool → frames → acknowledge, asserting the no-loss
//! and terminal-frame properties without a broker or a container runtime.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use goxec_core::{
    ContainerRunner, Frame, InMemoryLogBus, InMemoryQueue, Job, JobQueue, JobStatus, LogBus,
    RunOutput, RunnerError, WorkerPool,
};
use tokio::time::Instant;

/// Pretends every snippet prints one line and exits cleanly.
struct PrintRunner;

#[async_trait]
impl ContainerRunner for PrintRunner {
    async fn run(
        &self,
        job_id: &str,
        _code: &str,
        _language: &str,
        _deadline: Instant,
    ) -> Result<RunOutput, RunnerError> {
        Ok(RunOutput {
            output: format!("output of {}\n", job_id),
            exit_code: 0,
        })
    }
}

/// Fails every third job with a runner error.
struct FlakyRunner;

#[async_trait]
impl ContainerRunner for FlakyRunner {
    async fn run(
        &self,
        job_id: &str,
        _code: &str,
        _language: &str,
        _deadline: Instant,
    ) -> Result<RunOutput, RunnerError> {
        let n: usize = job_id
            .rsplit('-')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        if n % 3 == 0 {
            Err(RunnerError::Timeout)
        } else {
            Ok(RunOutput {
                output: String::new(),
                exit_code: 0,
            })
        }
    }
}

/// Drive `count` published jobs through a pool of `concurrency` workers and
/// wait until every job has produced its terminal frame.
async fn drive(
    queue: &InMemoryQueue,
    bus: &InMemoryLogBus,
    runner: Arc<dyn ContainerRunner>,
    concurrency: usize,
    count: usize,
) {
    let mut frames_rx = bus.subscribe_logs().await.unwrap();
    let mut jobs_rx = queue.subscribe().await.unwrap();

    let pool = WorkerPool::start(
        concurrency,
        runner,
        Arc::new(queue.clone()),
        Arc::new(bus.clone()),
        Duration::from_secs(5),
    );

    let dispatch = tokio::spawn(async move {
        for _ in 0..count {
            let job = jobs_rx.recv().await.expect("queue closed early");
            pool.submit(job).await;
        }
        pool.stop().await;
    });

    let mut terminals = 0;
    while terminals < count {
        let frame = tokio::time::timeout(Duration::from_secs(5), frames_rx.recv())
            .await
            .expect("timed out waiting for frames")
            .expect("bus closed early");
        if frame.is_terminal() {
            terminals += 1;
        }
    }
    dispatch.await.unwrap();
}

#[tokio::test]
async fn test_every_published_entry_is_acknowledged() {
    let queue = InMemoryQueue::new();
    let bus = InMemoryLogBus::new();

    for i in 0..10 {
        let job = Job::new(format!("job-{}", i), "print('hi')", "python");
        queue.publish(&job).await.unwrap();
    }
    drive(&queue, &bus, Arc::new(PrintRunner), 3, 10).await;

    let published: HashSet<String> = queue.published().await.into_iter().collect();
    let acked: HashSet<String> = queue.acked().await.into_iter().collect();
    assert_eq!(published, acked);
}

#[tokio::test]
async fn test_failures_still_terminate_and_acknowledge() {
    let queue = InMemoryQueue::new();
    let bus = InMemoryLogBus::new();

    for i in 0..9 {
        let job = Job::new(format!("job-{}", i), "x", "python");
        queue.publish(&job).await.unwrap();
    }
    drive(&queue, &bus, Arc::new(FlakyRunner), 2, 9).await;

    // Soft failures are acknowledged like successes; nothing is lost.
    assert_eq!(queue.acked().await.len(), 9);

    let frames = bus.frames().await;
    let failed = frames
        .iter()
        .filter(|f| matches!(f, Frame::Status { status: JobStatus::Failed, .. }))
        .count();
    let completed = frames
        .iter()
        .filter(|f| matches!(f, Frame::Status { status: JobStatus::Completed, .. }))
        .count();
    assert_eq!(failed, 3);
    assert_eq!(completed, 6);
}

#[tokio::test]
async fn test_frames_per_job_end_with_status() {
    let queue = InMemoryQueue::new();
    let bus = InMemoryLogBus::new();

    for i in 0..5 {
        let job = Job::new(format!("job-{}", i), "print('hi')", "python");
        queue.publish(&job).await.unwrap();
    }
    drive(&queue, &bus, Arc::new(PrintRunner), 2, 5).await;

    let frames = bus.frames().await;
    for i in 0..5 {
        let id = format!("job-{}", i);
        let own: Vec<&Frame> = frames.iter().filter(|f| f.job_id() == id).collect();
        assert_eq!(own.len(), 2, "log then status for {}", id);
        assert!(!own[0].is_terminal());
        assert!(own[1].is_terminal());
    }
}
