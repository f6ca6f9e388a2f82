use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Structured lifecycle events broadcast by the observability layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    /// Timer armed for a future ETA
    Scheduled {
        row_id: u64,
        fire_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    /// Message durably handed to the broker
    Published {
        row_id: u64,
        batch_id: Option<String>,
        retry_count: u32,
        at: DateTime<Utc>,
    },

    /// Publish failed after all retries
    PublishFailed {
        row_id: u64,
        batch_id: Option<String>,
        error: String,
        at: DateTime<Utc>,
    },

    /// Consumer pulled the message and queued it for a worker
    Delivered {
        row_id: u64,
        at: DateTime<Utc>,
    },

    Succeeded {
        row_id: u64,
        batch_id: Option<String>,
        at: DateTime<Utc>,
    },

    /// Executor failed, message will be redelivered
    Retrying {
        row_id: u64,
        batch_id: Option<String>,
        retry_count: u32,
        error: String,
        at: DateTime<Utc>,
    },

    /// Executor failed and retries are exhausted
    Failed {
        row_id: u64,
        batch_id: Option<String>,
        error: String,
        at: DateTime<Utc>,
    },

    /// Poison message rejected without requeue
    Dropped {
        reason: String,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Scheduled { .. } => "scheduled",
            Self::Published { .. } => "published",
            Self::PublishFailed { .. } => "publish_failed",
            Self::Delivered { .. } => "delivered",
            Self::Succeeded { .. } => "succeeded",
            Self::Retrying { .. } => "retrying",
            Self::Failed { .. } => "failed",
            Self::Dropped { .. } => "dropped",
        }
    }

    /// Row the event refers to, if any
    pub fn row_id(&self) -> Option<u64> {
        match self {
            Self::Scheduled { row_id, .. }
            | Self::Published { row_id, .. }
            | Self::PublishFailed { row_id, .. }
            | Self::Delivered { row_id, .. }
            | Self::Succeeded { row_id, .. }
            | Self::Retrying { row_id, .. }
            | Self::Failed { row_id, .. } => Some(*row_id),
            Self::Dropped { .. } => None,
        }
    }

    pub fn batch_id(&self) -> Option<&str> {
        match self {
            Self::Published { batch_id, .. }
            | Self::PublishFailed { batch_id, .. }
            | Self::Succeeded { batch_id, .. }
            | Self::Retrying { batch_id, .. }
            | Self::Failed { batch_id, .. } => batch_id.as_deref(),
            _ => None,
        }
    }

    /// Final outcome for a row (it will not be processed again)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded { .. } | Self::Failed { .. } | Self::PublishFailed { .. }
        )
    }

    /// Get the timestamp from any event
    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Scheduled { at, .. }
            | Self::Published { at, .. }
            | Self::PublishFailed { at, .. }
            | Self::Delivered { at, .. }
            | Self::Succeeded { at, .. }
            | Self::Retrying { at, .. }
            | Self::Failed { at, .. }
            | Self::Dropped { at, .. } => at,
        }
    }
}
