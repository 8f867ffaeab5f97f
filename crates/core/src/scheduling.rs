//! Cutout job status and state machine.
//!
//! Lives in `core` so the worker queue and any outward-facing layer agree on
//! the same transitions and the same status payload.

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::types::JobId;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        valid_transitions(self).is_empty()
    }

    /// Queued or Running: new submissions attach instead of starting over.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Statuses reachable from `from`. Terminal statuses return an empty slice.
pub fn valid_transitions(from: JobStatus) -> &'static [JobStatus] {
    match from {
        // Queued -> Running, Failed, Cancelled
        JobStatus::Queued => &[JobStatus::Running, JobStatus::Failed, JobStatus::Cancelled],
        // Running -> Succeeded, Failed, Cancelled
        JobStatus::Running => &[JobStatus::Succeeded, JobStatus::Failed, JobStatus::Cancelled],
        JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled => &[],
    }
}

pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    valid_transitions(from).contains(&to)
}

pub fn validate_transition(from: JobStatus, to: JobStatus) -> Result<(), String> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(format!(
            "Invalid transition: {} -> {}",
            from.as_str(),
            to.as_str()
        ))
    }
}

// ---------------------------------------------------------------------------
// Outward representation
// ---------------------------------------------------------------------------

/// Job status as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub result_location: Option<String>,
    pub error_kind: Option<ErrorKind>,
}
