//! In-process publish/subscribe for job lifecycle events.
//!
//! Every status transition the queue applies is published as a [`JobEvent`]
//! on a `tokio::sync::broadcast` channel. Slow subscribers lag and drop
//! events; publishing never blocks the queue.

use imgserv_core::error::ErrorKind;
use imgserv_core::fingerprint::Fingerprint;
use imgserv_core::scheduling::JobStatus;
use imgserv_core::types::{JobId, Timestamp};
use serde::Serialize;
use tokio::sync::broadcast;

pub const JOB_QUEUED: &str = "job_queued";
pub const JOB_RUNNING: &str = "job_running";
pub const JOB_COMPLETED: &str = "job_completed";
pub const JOB_FAILED: &str = "job_failed";
pub const JOB_CANCELLED: &str = "job_cancelled";

/// Event name for a job that just entered `status`.
pub fn event_type_for(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Queued => JOB_QUEUED,
        JobStatus::Running => JOB_RUNNING,
        JobStatus::Succeeded => JOB_COMPLETED,
        JobStatus::Failed => JOB_FAILED,
        JobStatus::Cancelled => JOB_CANCELLED,
    }
}

/// A job status transition.
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub event_type: &'static str,
    pub job_id: JobId,
    pub fingerprint: Fingerprint,
    pub status: JobStatus,
    pub error_kind: Option<ErrorKind>,
    pub result_location: Option<String>,
    pub timestamp: Timestamp,
}

impl JobEvent {
    pub fn new(job_id: JobId, fingerprint: Fingerprint, status: JobStatus) -> Self {
        Self {
            event_type: event_type_for(status),
            job_id,
            fingerprint,
            status,
            error_kind: None,
            result_location: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn with_error(mut self, kind: ErrorKind) -> Self {
        self.error_kind = Some(kind);
        self
    }

    pub fn with_result(mut self, location: impl Into<String>) -> Self {
        self.result_location = Some(location.into());
        self
    }
}

const DEFAULT_CAPACITY: usize = 1024;

pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers. Having none is fine.
    pub fn publish(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
