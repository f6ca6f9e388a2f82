//! Runs one uploaded batch as a tracked background job.
//!
//! Rows without any ETA go straight through the in-process executor path
//! ("batch mode"). If any row carries an ETA the whole batch goes through the
//! broker ("scheduled mode") and completion is observed through job events.
//! Scheduled mode needs the bridge's worker pool to be running.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::bridge::DispatchBridge;
use crate::error::ExecutorError;
use crate::broker::Broker;
use crate::scheduler::{ScheduledBatch, Scheduler};
use crate::tracker::JobTracker;
use crate::types::{JobEvent, JobId, JobRecord};
use crate::{QueueError, QueueResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Batch,
    Scheduled,
}

impl Mode {
    fn name(self) -> &'static str {
        match self {
            Mode::Batch => "batch",
            Mode::Scheduled => "scheduled",
        }
    }
}

enum Outcome {
    Completed(Value),
    /// Cancel observed at a checkpoint
    Cancelled,
    /// Cancelled while still pending; nothing ran
    NeverStarted,
}

#[derive(Default)]
struct Tally {
    done: usize,
    succeeded: usize,
    failed: usize,
}

fn row_progress(done: usize, total: usize) -> i64 {
    (30 + (done * 60 / total.max(1)) as i64).min(95)
}

/// Drives batches through the tracker, scheduler and bridge
pub struct BatchRunner<B: Broker> {
    tracker: Arc<JobTracker>,
    scheduler: Arc<Scheduler<B>>,
    bridge: Arc<DispatchBridge<B>>,
    workers: usize,
}

impl<B: Broker> Clone for BatchRunner<B> {
    fn clone(&self) -> Self {
        Self {
            tracker: self.tracker.clone(),
            scheduler: self.scheduler.clone(),
            bridge: self.bridge.clone(),
            workers: self.workers,
        }
    }
}

impl<B: Broker> BatchRunner<B> {
    /// `workers` caps rows in flight in batch mode; the bridge's own limit
    /// still bounds executor calls.
    ///
    /// The scheduler and the bridge must share one [`QueueClient`], since
    /// scheduled mode watches the events published on it.
    ///
    /// [`QueueClient`]: crate::client::QueueClient
    pub fn new(
        tracker: Arc<JobTracker>,
        scheduler: Arc<Scheduler<B>>,
        bridge: Arc<DispatchBridge<B>>,
        workers: usize,
    ) -> QueueResult<Self> {
        if !Arc::ptr_eq(scheduler.client(), bridge.client()) {
            return Err(QueueError::Config(
                "scheduler and dispatch bridge must share one queue client".to_string(),
            ));
        }
        Ok(Self {
            tracker,
            scheduler,
            bridge,
            workers: workers.max(1),
        })
    }

    pub fn tracker(&self) -> &Arc<JobTracker> {
        &self.tracker
    }

    /// Create a tracker entry and process `records` in the background
    pub fn submit(&self, job_type: &str, params: Value, records: Vec<JobRecord>) -> JobId {
        self.submit_with_handle(job_type, params, records).0
    }

    pub fn submit_with_handle(
        &self,
        job_type: &str,
        params: Value,
        records: Vec<JobRecord>,
    ) -> (JobId, JoinHandle<()>) {
        let job_id = self.tracker.create_job(job_type, params);
        let runner = self.clone();
        let id = job_id.clone();
        let handle = tokio::spawn(async move { runner.run(id, records).await });
        (job_id, handle)
    }

    /// Process `records` under an existing tracker entry, settling its status
    #[instrument(skip(self, records), fields(job_id = %job_id, rows = records.len()))]
    pub async fn run(&self, job_id: JobId, records: Vec<JobRecord>) {
        let settled = match self.execute(&job_id, records).await {
            Ok(Outcome::Completed(result)) => self.tracker.complete(&job_id, result),
            Ok(Outcome::Cancelled) => {
                info!("Batch cancelled");
                self.tracker.mark_cancelled(&job_id)
            }
            Ok(Outcome::NeverStarted) => {
                info!("Batch was cancelled before it started");
                Ok(())
            }
            Err(e) => self.tracker.fail(&job_id, &e.to_string()),
        };

        if let Err(e) = settled {
            warn!("Could not settle batch job: {}", e);
        }
    }

    fn cancelled(&self, job_id: &JobId) -> bool {
        self.tracker.is_cancel_requested(job_id)
    }

    async fn execute(&self, job_id: &JobId, records: Vec<JobRecord>) -> QueueResult<Outcome> {
        if !self.tracker.start(job_id)? {
            return Ok(Outcome::NeverStarted);
        }

        if self.cancelled(job_id) {
            return Ok(Outcome::Cancelled);
        }
        let total = records.len();
        self.tracker
            .update_progress(job_id, 10, &format!("Validating {} rows", total))?;
        if records.is_empty() {
            return Err(QueueError::EmptyBatch);
        }

        if self.cancelled(job_id) {
            return Ok(Outcome::Cancelled);
        }
        let mode = if records.iter().any(|r| r.eta.is_some()) {
            Mode::Scheduled
        } else {
            Mode::Batch
        };
        self.tracker.update_progress(
            job_id,
            20,
            &format!("{} rows loaded, using {} mode", total, mode.name()),
        )?;

        if self.cancelled(job_id) {
            return Ok(Outcome::Cancelled);
        }
        self.tracker
            .update_progress(job_id, 30, "Starting form processing")?;

        let tally = match mode {
            Mode::Batch => self.run_batch_mode(job_id, records).await?,
            Mode::Scheduled => self.run_scheduled_mode(job_id, records).await?,
        };
        let Some(tally) = tally else {
            return Ok(Outcome::Cancelled);
        };

        self.tracker
            .update_progress(job_id, 95, "Processing completed, finalizing")?;

        Ok(Outcome::Completed(json!({
            "mode": mode.name(),
            "rows": total,
            "succeeded": tally.succeeded,
            "failed": tally.failed,
            "stats": self.bridge.stats_snapshot(),
        })))
    }

    /// `None` when cancelled midway
    async fn run_batch_mode(
        &self,
        job_id: &JobId,
        records: Vec<JobRecord>,
    ) -> QueueResult<Option<Tally>> {
        let total = records.len();
        let token = self.tracker.cancellation_token(job_id)?;
        let bridge = &self.bridge;

        let mut outcomes = stream::iter(records)
            .map(|record| {
                let token = token.clone();
                async move {
                    // Checkpoint before every row
                    if token.is_cancelled() {
                        return None;
                    }
                    match bridge.execute_direct(record, token.clone()).await {
                        Ok(()) => Some(true),
                        Err(ExecutorError::Cancelled) if token.is_cancelled() => None,
                        Err(_) => Some(false),
                    }
                }
            })
            .buffer_unordered(self.workers);

        let mut tally = Tally::default();
        while let Some(outcome) = outcomes.next().await {
            let Some(ok) = outcome else {
                continue;
            };
            tally.done += 1;
            if ok {
                tally.succeeded += 1;
            } else {
                tally.failed += 1;
            }
            self.tracker.update_progress(
                job_id,
                row_progress(tally.done, total),
                &format!("Processing row {}/{}", tally.done, total),
            )?;
        }

        if self.cancelled(job_id) {
            return Ok(None);
        }
        Ok(Some(tally))
    }

    async fn run_scheduled_mode(
        &self,
        job_id: &JobId,
        records: Vec<JobRecord>,
    ) -> QueueResult<Option<Tally>> {
        let token = self.tracker.cancellation_token(job_id)?;
        let batch_id = job_id.to_string();

        let purged = self.bridge.purge_pending().await?;
        if purged > 0 {
            warn!(purged, "Purged stale messages before scheduling");
        }

        // Watch and subscribe before anything can be published
        let observability = self.scheduler.client().observability().clone();
        observability.watch_batch(&batch_id);
        let events = observability.subscribe();

        let result = match self
            .scheduler
            .schedule_batch(records, Some(batch_id.clone()))
            .await
        {
            Ok(batch) => {
                info!(
                    scheduled = batch.scheduled_count(),
                    immediate = batch.immediate_count(),
                    "Batch handed to scheduler"
                );
                self.await_outcomes(job_id, &batch, events, &token).await
            }
            Err(e) => Err(e),
        };

        observability.unwatch_batch(&batch_id);
        result
    }

    /// Count one terminal outcome per row of `batch`.
    ///
    /// Repeated outcomes for a row are ignored. Events lost to a lagging
    /// subscription are reconciled from the observability ledger.
    async fn await_outcomes(
        &self,
        job_id: &JobId,
        batch: &ScheduledBatch,
        mut events: broadcast::Receiver<JobEvent>,
        token: &CancellationToken,
    ) -> QueueResult<Option<Tally>> {
        let batch_id = batch.batch_id().unwrap_or_default();
        let expected: HashSet<u64> = batch.row_ids().collect();
        let total = expected.len();
        let observability = self.scheduler.client().observability();
        let mut outcomes: HashMap<u64, bool> = HashMap::new();

        while outcomes.len() < total {
            let event = tokio::select! {
                _ = token.cancelled() => {
                    let revoked = batch.cancel();
                    info!(revoked, "Revoked unfired timers of cancelled batch");
                    return Ok(None);
                }
                event = events.recv() => event,
            };

            let before = outcomes.len();
            match event {
                Ok(event) => {
                    if !event.is_terminal() || event.batch_id() != Some(batch_id) {
                        continue;
                    }
                    let Some(row_id) = event.row_id().filter(|id| expected.contains(id)) else {
                        continue;
                    };
                    if outcomes.contains_key(&row_id) {
                        debug!(row_id, event = event.event_name(), "Ignoring repeated outcome");
                        continue;
                    }
                    outcomes.insert(row_id, matches!(event, JobEvent::Succeeded { .. }));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged, reconciling from ledger");
                    for (row_id, succeeded) in observability.batch_outcomes(batch_id) {
                        if expected.contains(&row_id) {
                            outcomes.entry(row_id).or_insert(succeeded);
                        }
                    }
                }
                Err(RecvError::Closed) => {
                    return Err(QueueError::Internal("event channel closed".to_string()));
                }
            }

            if outcomes.len() > before {
                self.tracker.update_progress(
                    job_id,
                    row_progress(outcomes.len(), total),
                    &format!("Processing row {}/{}", outcomes.len(), total),
                )?;
            }
        }

        let succeeded = outcomes.values().filter(|ok| **ok).count();
        Ok(Some(Tally {
            done: total,
            succeeded,
            failed: total - succeeded,
        }))
    }
}
