use thiserror::Error;

use crate::tracker::JobState;
use crate::types::JobStatus;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Result type for job tracker operations
pub type TrackerResult<T> = Result<T, TrackerError>;

/// Infrastructure errors for broker, scheduler and dispatch operations
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("Could not connect to broker after {attempts} attempts: {reason}")]
    Connection { attempts: u32, reason: String },

    #[error("Failed to publish row {row_id} after {attempts} attempts: {reason}")]
    Publish {
        row_id: u64,
        attempts: u32,
        reason: String,
    },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Queue exists with incompatible parameters: {0}")]
    IncompatibleQueue(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Invalid status transition for row {row_id}: {from} -> {to}")]
    InvalidTransition {
        row_id: u64,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Batch contains no rows")]
    EmptyBatch,

    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Worker shutdown")]
    WorkerShutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Errors that a reconnect may cure
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionLost(_) | Self::Broker(_)
        )
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Executor outcome other than a clean submit
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// The form accepted the request but reported a failure
    #[error("Submission rejected")]
    Rejected,

    #[error("Submission failed: {0}")]
    Failed(String),

    #[error("Executor panicked: {0}")]
    Panicked(String),

    #[error("Submission cancelled")]
    Cancelled,
}

impl ExecutorError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Job tracker errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobState,
        to: JobState,
    },
}
