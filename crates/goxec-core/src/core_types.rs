//! Core type definitions for the job-dispatch and execution pipeline
//!
//! This module defines the data structures shared by every stage of the
//! pipeline: the job payload carried on the durable stream, the frames
//! published on the log bus, and the output captured from a container run.
//! The serialized shapes are the wire contract between the ingress server,
//! the worker nodes, and the browser clients, so they change rarely and
//! deliberately.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A unit of work accepted by the ingress server.
///
/// The payload (`id`, `code`, `language`) is serialized as UTF-8 JSON into
/// the single `job` field of a stream entry and never mutated after append.
/// `stream_entry_id` and `delivery_count` are stream metadata attached on
/// delivery; they are not part of the payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub code: String,
    pub language: String,
    #[serde(skip)]
    pub stream_entry_id: Option<String>,
    #[serde(skip)]
    pub delivery_count: u64,
}

impl Job {
    pub fn new(id: impl Into<String>, code: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code: code.into(),
            language: language.into(),
            stream_entry_id: None,
            delivery_count: 0,
        }
    }
}

/// Terminal outcome of a job, as reported to clients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Completed,
    Failed,
}

/// A single message on the log bus.
///
/// Zero or more `log` frames stream a job's captured output; exactly one
/// `status` frame terminates the sequence for a given `job_id`. Frames are
/// forwarded verbatim (as JSON text) to the WebSocket session bound to the
/// job, which filters on `job_id` client-side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Log {
        job_id: String,
        output: String,
        timestamp: DateTime<Utc>,
    },
    Status {
        job_id: String,
        status: JobStatus,
        timestamp: DateTime<Utc>,
    },
}

impl Frame {
    pub fn log(job_id: impl Into<String>, output: impl Into<String>) -> Self {
        Frame::Log {
            job_id: job_id.into(),
            output: output.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn status(job_id: impl Into<String>, status: JobStatus) -> Self {
        Frame::Status {
            job_id: job_id.into(),
            status,
            timestamp: Utc::now(),
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            Frame::Log { job_id, .. } | Frame::Status { job_id, .. } => job_id,
        }
    }

    /// A `status` frame ends the sequence for its job.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Frame::Status { .. })
    }
}

/// What a container run produced.
///
/// `output` is the concatenation of the captured stdout followed by the
/// captured stderr; the order is fixed and relied on by clients. A non-zero
/// `exit_code` is not an execution error; the worker pool maps it to a
/// `failed` terminal status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub output: String,
    pub exit_code: i64,
}
