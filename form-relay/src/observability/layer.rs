use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use crate::types::{JobEvent, QueueMessage};

const DEFAULT_CAPACITY: usize = 10_000;

/// Broadcasts job lifecycle events to any number of subscribers.
///
/// Sending never blocks; with no subscribers the event is dropped, and a slow
/// subscriber loses the oldest events.
///
/// Terminal outcomes of watched batches are also kept in a ledger, so a
/// subscriber that lagged can reconcile what it missed.
#[derive(Clone)]
pub struct ObservabilityLayer {
    event_broadcaster: broadcast::Sender<JobEvent>,
    /// batch id -> row id -> succeeded; first outcome per row wins
    outcomes: Arc<DashMap<String, HashMap<u64, bool>>>,
}

impl ObservabilityLayer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (event_broadcaster, _) = broadcast::channel(capacity);
        Self {
            event_broadcaster,
            outcomes: Arc::new(DashMap::new()),
        }
    }

    pub fn emit(&self, event: JobEvent) {
        debug!(event = event.event_name(), row_id = ?event.row_id(), "job event");
        // Ledger before broadcast: anything a subscriber saw is already recorded
        if event.is_terminal() {
            if let (Some(batch_id), Some(row_id)) = (event.batch_id(), event.row_id()) {
                if let Some(mut ledger) = self.outcomes.get_mut(batch_id) {
                    let succeeded = matches!(event, JobEvent::Succeeded { .. });
                    ledger.entry(row_id).or_insert(succeeded);
                }
            }
        }
        let _ = self.event_broadcaster.send(event);
    }

    /// Start keeping terminal outcomes for `batch_id`
    pub fn watch_batch(&self, batch_id: &str) {
        self.outcomes.entry(batch_id.to_string()).or_default();
    }

    /// Outcomes recorded so far for a watched batch (row id -> succeeded)
    pub fn batch_outcomes(&self, batch_id: &str) -> HashMap<u64, bool> {
        self.outcomes
            .get(batch_id)
            .map(|ledger| ledger.clone())
            .unwrap_or_default()
    }

    pub fn unwatch_batch(&self, batch_id: &str) {
        self.outcomes.remove(batch_id);
    }

    pub fn record_scheduled(&self, row_id: u64, fire_at: DateTime<Utc>) {
        self.emit(JobEvent::Scheduled {
            row_id,
            fire_at,
            at: Utc::now(),
        });
    }

    pub fn record_published(&self, message: &QueueMessage) {
        self.emit(JobEvent::Published {
            row_id: message.row_id(),
            batch_id: message.batch_id.clone(),
            retry_count: message.retry_count,
            at: Utc::now(),
        });
    }

    pub fn record_publish_failed(&self, message: &QueueMessage, error: &str) {
        self.emit(JobEvent::PublishFailed {
            row_id: message.row_id(),
            batch_id: message.batch_id.clone(),
            error: error.to_string(),
            at: Utc::now(),
        });
    }

    pub fn record_delivered(&self, message: &QueueMessage) {
        self.emit(JobEvent::Delivered {
            row_id: message.row_id(),
            at: Utc::now(),
        });
    }

    pub fn record_succeeded(&self, message: &QueueMessage) {
        self.emit(JobEvent::Succeeded {
            row_id: message.row_id(),
            batch_id: message.batch_id.clone(),
            at: Utc::now(),
        });
    }

    /// `message` is the next attempt, with its `retry_count` already bumped
    pub fn record_retrying(&self, message: &QueueMessage, error: &str) {
        self.emit(JobEvent::Retrying {
            row_id: message.row_id(),
            batch_id: message.batch_id.clone(),
            retry_count: message.retry_count,
            error: error.to_string(),
            at: Utc::now(),
        });
    }

    pub fn record_failed(&self, message: &QueueMessage, error: &str) {
        self.emit(JobEvent::Failed {
            row_id: message.row_id(),
            batch_id: message.batch_id.clone(),
            error: error.to_string(),
            at: Utc::now(),
        });
    }

    pub fn record_dropped(&self, reason: &str) {
        self.emit(JobEvent::Dropped {
            reason: reason.to_string(),
            at: Utc::now(),
        });
    }

    /// Raw receiver
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.event_broadcaster.subscribe()
    }

    /// Event stream; events lost to lag are skipped
    pub fn event_stream(&self) -> impl Stream<Item = JobEvent> + Send + 'static {
        BroadcastStream::new(self.event_broadcaster.subscribe()).filter_map(|event| event.ok())
    }

    pub fn subscriber_count(&self) -> usize {
        self.event_broadcaster.receiver_count()
    }
}

impl Default for ObservabilityLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobRecord, Payload};

    #[tokio::test]
    async fn test_stream_sees_events_in_order() {
        let layer = ObservabilityLayer::new();
        let mut stream = Box::pin(layer.event_stream());

        let message = QueueMessage::new(JobRecord::new(9, Payload::new()), 3).with_batch("b");
        layer.record_published(&message);
        layer.record_succeeded(&message);

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(first.event_name(), "published");
        assert_eq!(second.event_name(), "succeeded");
        assert!(second.is_terminal());
        assert_eq!(second.batch_id(), Some("b"));
        assert_eq!(second.row_id(), Some(9));
    }

    #[test]
    fn test_ledger_keeps_first_outcome_of_watched_batches() {
        let layer = ObservabilityLayer::with_capacity(1);
        let watched = QueueMessage::new(JobRecord::new(1, Payload::new()), 3).with_batch("b");
        let other = QueueMessage::new(JobRecord::new(2, Payload::new()), 3).with_batch("x");

        layer.watch_batch("b");
        layer.record_retrying(&watched, "timeout");
        layer.record_publish_failed(&watched, "broker down");
        layer.record_succeeded(&watched);
        layer.record_succeeded(&other);

        assert_eq!(layer.batch_outcomes("b"), HashMap::from([(1, false)]));
        assert!(layer.batch_outcomes("x").is_empty());

        layer.unwatch_batch("b");
        assert!(layer.batch_outcomes("b").is_empty());
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let layer = ObservabilityLayer::with_capacity(4);
        layer.record_dropped("bad json");
        assert_eq!(layer.subscriber_count(), 0);
    }
}
