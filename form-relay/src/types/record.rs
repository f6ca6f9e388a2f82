use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use super::{JobPriority, Payload};
use crate::{QueueError, QueueResult};

/// Row lifecycle from ingestion to a terminal outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Produced by ingestion, not yet handed to the scheduler
    Pending,

    /// Waiting on a timer for its ETA
    Scheduled,

    /// Published to the broker
    Enqueued,

    /// An executor call is in flight
    Processing,

    Succeeded,

    Failed,
}

impl JobStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Scheduled => 1,
            Self::Enqueued => 2,
            Self::Processing => 3,
            Self::Succeeded | Self::Failed => 4,
        }
    }

    /// Check if the status is terminal (succeeded or failed)
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Forward-only, except `Failed -> Enqueued` for a retry
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self == Self::Failed && next == Self::Enqueued {
            return true;
        }
        !self.is_terminal() && next.rank() > self.rank()
    }

    /// Get the status name as a string
    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Enqueued => "enqueued",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One spreadsheet row on its way to the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// 1-based row number, unique within its batch
    pub row_id: u64,

    /// Opaque field values passed through to the executor
    pub payload: Payload,

    #[serde(default)]
    pub priority: JobPriority,

    /// Earliest dispatch instant; `None` means immediately
    #[serde(default)]
    pub eta: Option<DateTime<FixedOffset>>,

    #[serde(default = "default_status")]
    pub status: JobStatus,
}

fn default_status() -> JobStatus {
    JobStatus::Pending
}

impl JobRecord {
    /// Create a pending record with no ETA and normal priority
    pub fn new(row_id: u64, payload: Payload) -> Self {
        Self {
            row_id,
            payload,
            priority: JobPriority::default(),
            eta: None,
            status: JobStatus::Pending,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_eta(mut self, eta: DateTime<FixedOffset>) -> Self {
        self.eta = Some(eta);
        self
    }

    /// Move to `next`, rejecting backwards moves
    pub fn transition(&mut self, next: JobStatus) -> QueueResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(QueueError::InvalidTransition {
                row_id: self.row_id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        let mut record = JobRecord::new(1, Payload::new());
        record.transition(JobStatus::Scheduled).unwrap();
        record.transition(JobStatus::Enqueued).unwrap();
        record.transition(JobStatus::Processing).unwrap();
        record.transition(JobStatus::Succeeded).unwrap();
        assert!(record.status.is_terminal());
    }

    #[test]
    fn test_retry_is_the_only_backward_move() {
        let mut record = JobRecord::new(7, Payload::new());
        record.transition(JobStatus::Enqueued).unwrap();
        record.transition(JobStatus::Processing).unwrap();
        record.transition(JobStatus::Failed).unwrap();
        record.transition(JobStatus::Enqueued).unwrap();

        assert!(record.transition(JobStatus::Pending).is_err());
        record.transition(JobStatus::Processing).unwrap();
        record.transition(JobStatus::Succeeded).unwrap();

        let err = record.transition(JobStatus::Enqueued).unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { row_id: 7, .. }));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&JobStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
    }
}
