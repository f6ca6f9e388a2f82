use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobRecord, JobStatus, MessageId};

/// Wire representation of a job record plus delivery metadata.
///
/// Self-contained: a consumer can rebuild the record without any other state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub message_id: MessageId,

    #[serde(flatten)]
    pub record: JobRecord,

    pub sent_at: DateTime<Utc>,

    /// Number of redeliveries so far (0 on first publish)
    #[serde(default)]
    pub retry_count: u32,

    pub max_retries: u32,

    /// Ask the broker to persist the message to disk
    #[serde(default = "default_persistent")]
    pub persistent: bool,

    /// Tracked batch this row belongs to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

fn default_persistent() -> bool {
    true
}

impl QueueMessage {
    /// Wrap a record for its first publish
    pub fn new(mut record: JobRecord, max_retries: u32) -> Self {
        record.status = JobStatus::Enqueued;
        Self {
            message_id: MessageId::new(),
            record,
            sent_at: Utc::now(),
            retry_count: 0,
            max_retries,
            persistent: true,
            batch_id: None,
        }
    }

    pub fn with_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn row_id(&self) -> u64 {
        self.record.row_id
    }

    /// Whether another delivery attempt is allowed after a failure
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Next attempt: bumps `retry_count`, refreshes `sent_at` and puts the
    /// record back to `enqueued`
    pub fn next_attempt(&self) -> Self {
        let mut next = self.clone();
        next.retry_count += 1;
        next.sent_at = Utc::now();
        next.record.status = JobStatus::Enqueued;
        next
    }

    pub fn into_record(self) -> JobRecord {
        self.record
    }
}
