use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::broker::Broker;
use crate::client::QueueClient;
use crate::config::SchedulerConfig;
use crate::types::{JobRecord, JobStatus, QueueMessage};
use crate::{QueueError, QueueResult};

/// A job whose publish has not happened yet
struct PendingJob {
    row_id: u64,
    fire_at: DateTime<FixedOffset>,
    /// Whoever flips this first decides: fire or cancel
    claim: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl PendingJob {
    /// Returns false if the timer already claimed the job
    fn revoke(&self) -> bool {
        if self.claim.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        true
    }
}

/// Receipt for one `schedule_jobs` call.
///
/// Dropping it detaches the timers; they still fire.
pub struct ScheduledBatch {
    batch_id: Option<String>,
    scheduled: usize,
    immediate: usize,
    handles: Vec<(u64, JoinHandle<QueueResult<()>>)>,
    keys: Vec<u64>,
    pending: Arc<DashMap<u64, PendingJob>>,
}

impl ScheduledBatch {
    pub fn batch_id(&self) -> Option<&str> {
        self.batch_id.as_deref()
    }

    /// Jobs waiting on a future ETA
    pub fn scheduled_count(&self) -> usize {
        self.scheduled
    }

    /// Jobs published after the minimal delay
    pub fn immediate_count(&self) -> usize {
        self.immediate
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn row_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.handles.iter().map(|(row_id, _)| *row_id)
    }

    /// Cancel this batch's unfired timers; returns how many were stopped
    pub fn cancel(&self) -> usize {
        self.keys
            .iter()
            .filter_map(|key| self.pending.remove(key))
            .filter(|(_, job)| job.revoke())
            .count()
    }

    /// Wait for every publish; `Err(Cancelled)` marks a job that was cleared
    pub async fn join(self) -> Vec<(u64, QueueResult<()>)> {
        let mut results = Vec::with_capacity(self.handles.len());
        for (row_id, handle) in self.handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(QueueError::Internal(format!("publish task failed: {}", e))),
            };
            results.push((row_id, result));
        }
        results
    }
}

/// Turns job records into publishes, now or at their ETA
pub struct Scheduler<B: Broker> {
    client: Arc<QueueClient<B>>,
    config: SchedulerConfig,
    tz: Tz,
    max_retries: u32,
    pending: Arc<DashMap<u64, PendingJob>>,
    next_key: AtomicU64,
    shutdown: CancellationToken,
}

impl<B: Broker> Scheduler<B> {
    pub fn new(
        client: Arc<QueueClient<B>>,
        config: SchedulerConfig,
        max_retries: u32,
    ) -> QueueResult<Self> {
        let tz = config.tz()?;
        Ok(Self {
            client,
            config,
            tz,
            max_retries,
            pending: Arc::new(DashMap::new()),
            next_key: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn client(&self) -> &Arc<QueueClient<B>> {
        &self.client
    }

    /// Current time in the scheduler's timezone
    pub fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.tz)
    }

    pub async fn schedule_jobs(&self, jobs: Vec<JobRecord>) -> QueueResult<ScheduledBatch> {
        self.schedule_batch(jobs, None).await
    }

    /// Arm a timer per record. Messages are tagged with `batch_id` when given.
    ///
    /// Nothing is published inside this call; a record that is not `pending`
    /// rejects the whole batch before any timer is armed.
    #[instrument(skip(self, jobs), fields(jobs = jobs.len(), batch_id = ?batch_id))]
    pub async fn schedule_batch(
        &self,
        jobs: Vec<JobRecord>,
        batch_id: Option<String>,
    ) -> QueueResult<ScheduledBatch> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::WorkerShutdown);
        }
        if let Some(job) = jobs.iter().find(|job| job.status != JobStatus::Pending) {
            return Err(QueueError::InvalidTransition {
                row_id: job.row_id,
                from: job.status,
                to: JobStatus::Enqueued,
            });
        }

        let mut batch = ScheduledBatch {
            batch_id: batch_id.clone(),
            scheduled: 0,
            immediate: 0,
            handles: Vec::with_capacity(jobs.len()),
            keys: Vec::with_capacity(jobs.len()),
            pending: self.pending.clone(),
        };

        for mut record in jobs {
            let now = self.now().fixed_offset();
            let row_id = record.row_id;

            let (delay, fire_at, detached) = match record.eta {
                Some(eta) if eta > now => {
                    record.transition(JobStatus::Scheduled)?;
                    let delay = (eta - now).to_std().unwrap_or(Duration::ZERO);
                    self.client
                        .observability()
                        .record_scheduled(row_id, eta.with_timezone(&Utc));
                    info!(row_id, eta = %eta, "Scheduled job for {:?} from now", delay);
                    batch.scheduled += 1;
                    (delay, eta, true)
                }
                eta => {
                    if let Some(eta) = eta {
                        warn!(
                            row_id,
                            eta = %eta,
                            now = %now,
                            "ETA already passed, scheduling immediately"
                        );
                    }
                    batch.immediate += 1;
                    let delay = self.config.immediate_delay;
                    let fire_at = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                    (delay, fire_at, false)
                }
            };

            let mut message = QueueMessage::new(record, self.max_retries);
            message.batch_id = batch_id.clone();
            let (key, handle) = self.arm(message, delay, fire_at, detached);
            batch.keys.push(key);
            batch.handles.push((row_id, handle));
        }

        debug!(
            scheduled = batch.scheduled,
            immediate = batch.immediate,
            "Batch armed"
        );
        Ok(batch)
    }

    fn arm(
        &self,
        mut message: QueueMessage,
        delay: Duration,
        fire_at: DateTime<FixedOffset>,
        detached: bool,
    ) -> (u64, JoinHandle<QueueResult<()>>) {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let claim = Arc::new(AtomicBool::new(false));
        let cancel = self.shutdown.child_token();

        self.pending.insert(
            key,
            PendingJob {
                row_id: message.row_id(),
                fire_at,
                claim: claim.clone(),
                cancel: cancel.clone(),
            },
        );

        let client = self.client.clone();
        let pending = self.pending.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(row_id = message.row_id(), "Timer cancelled before firing");
                    return Err(QueueError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if claim.swap(true, Ordering::SeqCst) {
                return Err(QueueError::Cancelled);
            }
            pending.remove(&key);

            message.sent_at = Utc::now();
            if detached {
                client.publish_detached(&message).await
            } else {
                client.publish(&message).await
            }
        });
        (key, handle)
    }

    /// Jobs not yet published, soonest first
    pub fn pending_jobs(&self) -> Vec<(u64, DateTime<FixedOffset>)> {
        let mut jobs: Vec<_> = self
            .pending
            .iter()
            .map(|entry| (entry.row_id, entry.fire_at))
            .collect();
        jobs.sort_by_key(|(_, fire_at)| *fire_at);
        jobs
    }

    /// Cancel every timer that has not fired; returns how many were stopped
    pub fn clear_pending(&self) -> usize {
        let keys: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut cleared = 0;
        for key in keys {
            if let Some((_, job)) = self.pending.remove(&key) {
                if job.revoke() {
                    cleared += 1;
                }
            }
        }
        if cleared > 0 {
            info!(cleared, "Cleared pending jobs");
        }
        cleared
    }

    /// Stop accepting work and cancel every unfired timer
    pub fn shutdown(&self) -> usize {
        let cleared = self.clear_pending();
        self.shutdown.cancel();
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::BrokerConfig;
    use crate::types::{JobPriority, Payload};
    use tracing_test::traced_test;

    fn scheduler(broker: &MemoryBroker) -> Scheduler<MemoryBroker> {
        let client = Arc::new(QueueClient::new(
            broker.clone(),
            BrokerConfig {
                queue: "jobs".to_string(),
                ..Default::default()
            },
        ));
        Scheduler::new(client, SchedulerConfig::default(), 3).unwrap()
    }

    fn record(row_id: u64) -> JobRecord {
        JobRecord::new(row_id, Payload::new().with_field("entry.1", "x"))
    }

    fn in_future(s: &Scheduler<MemoryBroker>, offset: Duration) -> DateTime<FixedOffset> {
        (s.now() + chrono::Duration::from_std(offset).unwrap()).fixed_offset()
    }

    #[tokio::test(start_paused = true)]
    async fn test_future_eta_does_not_fire_early() {
        let broker = MemoryBroker::new();
        let s = scheduler(&broker);
        let start = tokio::time::Instant::now();

        let job = record(1)
            .with_eta(in_future(&s, Duration::from_secs(2)))
            .with_priority(JobPriority::High);
        let batch = s.schedule_jobs(vec![job]).await.unwrap();
        assert_eq!(batch.scheduled_count(), 1);
        assert_eq!(s.pending_jobs().len(), 1);

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert!(broker.published().is_empty());

        let results = batch.join().await;
        assert!(results[0].1.is_ok());

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert!(published[0].at.duration_since(start) >= Duration::from_millis(1900));
        assert!(s.pending_jobs().is_empty());

        let message: QueueMessage = serde_json::from_slice(&published[0].body).unwrap();
        assert_eq!(message.record.priority, JobPriority::High);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_jobs_wait_the_minimal_delay() {
        let broker = MemoryBroker::new();
        let s = scheduler(&broker);
        let start = tokio::time::Instant::now();

        let batch = s.schedule_jobs(vec![record(1), record(2)]).await.unwrap();
        assert_eq!(batch.immediate_count(), 2);
        assert!(broker.published().is_empty());

        for (_, result) in batch.join().await {
            result.unwrap();
        }
        for publish in broker.published() {
            assert!(publish.at.duration_since(start) >= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_past_eta_warns_and_publishes_now() {
        let broker = MemoryBroker::new();
        let s = scheduler(&broker);
        let past = (s.now() - chrono::Duration::hours(1)).fixed_offset();

        let batch = s.schedule_jobs(vec![record(5).with_eta(past)]).await.unwrap();
        assert_eq!(batch.immediate_count(), 1);
        batch.join().await[0].1.as_ref().unwrap();

        assert!(logs_contain("ETA already passed"));
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_jobs_never_publish() {
        let broker = MemoryBroker::new();
        let s = scheduler(&broker);

        let far = in_future(&s, Duration::from_secs(3600));
        let batch = s
            .schedule_jobs(vec![record(1).with_eta(far), record(2).with_eta(far)])
            .await
            .unwrap();
        assert_eq!(s.clear_pending(), 2);

        let results = batch.join().await;
        assert!(results
            .iter()
            .all(|(_, r)| matches!(r, Err(QueueError::Cancelled))));

        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert!(broker.published().is_empty());
        assert_eq!(s.clear_pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_cancel_leaves_other_batches_alone() {
        let broker = MemoryBroker::new();
        let s = scheduler(&broker);
        let soon = in_future(&s, Duration::from_secs(10));

        let first = s
            .schedule_batch(vec![record(1).with_eta(soon)], Some("a".into()))
            .await
            .unwrap();
        let second = s
            .schedule_batch(vec![record(2).with_eta(soon)], Some("b".into()))
            .await
            .unwrap();

        assert_eq!(first.cancel(), 1);
        assert_eq!(first.cancel(), 0);
        assert_eq!(s.pending_jobs(), vec![(2, soon)]);

        second.join().await[0].1.as_ref().unwrap();
        let published = broker.published();
        assert_eq!(published.len(), 1);
        let message: QueueMessage = serde_json::from_slice(&published[0].body).unwrap();
        assert_eq!(message.batch_id.as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_error_reaches_only_its_row() {
        let broker = MemoryBroker::new();
        let s = scheduler(&broker);
        broker.fail_next_publishes(3);

        let results = s
            .schedule_jobs(vec![record(1), record(2)])
            .await
            .unwrap()
            .join()
            .await;

        let failures = results
            .iter()
            .filter(|(_, r)| matches!(r, Err(QueueError::Publish { .. })))
            .count();
        assert_eq!(failures, 1);
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_non_pending_records() {
        let broker = MemoryBroker::new();
        let s = scheduler(&broker);
        let mut done = record(1);
        done.status = JobStatus::Succeeded;

        let err = s.schedule_jobs(vec![record(2), done]).await.err().unwrap();
        assert!(matches!(err, QueueError::InvalidTransition { row_id: 1, .. }));
        assert!(s.pending_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let broker = MemoryBroker::new();
        let s = scheduler(&broker);
        s.shutdown();
        assert!(matches!(
            s.schedule_jobs(vec![record(1)]).await,
            Err(QueueError::WorkerShutdown)
        ));
    }
}
