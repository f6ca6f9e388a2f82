//! In-memory registry of background jobs with progress, audit log and
//! cooperative cancellation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::TrackerConfig;
use crate::types::JobId;
use crate::{TrackerError, TrackerResult};

/// Background job lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One audit log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub at: DateTime<Utc>,
    pub progress: u8,
    pub message: String,
}

/// Snapshot of a tracked job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: JobId,
    pub job_type: String,
    pub params: Value,
    pub status: JobState,
    /// 0..=100
    pub progress: u8,
    pub message: String,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Sticky once set
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub logs: Vec<ProgressEntry>,
}

impl JobInfo {
    fn record_progress(&mut self, progress: i64, message: &str) {
        self.progress = progress.clamp(0, 100) as u8;
        self.message = message.to_string();
        self.logs.push(ProgressEntry {
            at: Utc::now(),
            progress: self.progress,
            message: self.message.clone(),
        });
    }

    fn finish(&mut self, status: JobState) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}

struct JobEntry {
    info: JobInfo,
    cancel: CancellationToken,
}

/// Shared job registry; clone the `Arc`, not the tracker
#[derive(Default)]
pub struct JobTracker {
    jobs: RwLock<HashMap<JobId, JobEntry>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_job(&self, job_type: impl Into<String>, params: Value) -> JobId {
        let job_id = JobId::new();
        let job_type = job_type.into();
        let info = JobInfo {
            job_id: job_id.clone(),
            job_type: job_type.clone(),
            params,
            status: JobState::Pending,
            progress: 0,
            message: String::new(),
            result: None,
            error: None,
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            logs: Vec::new(),
        };

        self.jobs.write().insert(
            job_id.clone(),
            JobEntry {
                info,
                cancel: CancellationToken::new(),
            },
        );
        info!(job_id = %job_id, job_type, "Created job");
        job_id
    }

    pub fn get_job(&self, job_id: &JobId) -> Option<JobInfo> {
        self.jobs.read().get(job_id).map(|entry| entry.info.clone())
    }

    fn with_job<T>(
        &self,
        job_id: &JobId,
        f: impl FnOnce(&mut JobEntry) -> TrackerResult<T>,
    ) -> TrackerResult<T> {
        let mut jobs = self.jobs.write();
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| TrackerError::NotFound(job_id.to_string()))?;
        f(entry)
    }

    /// Set progress (clamped to 0..=100) and message, appending to the log
    pub fn update_progress(&self, job_id: &JobId, percent: i64, message: &str) -> TrackerResult<()> {
        self.with_job(job_id, |entry| {
            entry.info.record_progress(percent, message);
            debug!(job_id = %job_id, progress = entry.info.progress, "{}", message);
            Ok(())
        })
    }

    /// `pending -> processing`.
    ///
    /// `Ok(false)` means the job was cancelled before it started and must not
    /// run.
    pub fn start(&self, job_id: &JobId) -> TrackerResult<bool> {
        self.with_job(job_id, |entry| match entry.info.status {
            JobState::Cancelled => Ok(false),
            JobState::Pending => {
                entry.info.status = JobState::Processing;
                entry.info.started_at = Some(Utc::now());
                entry.info.record_progress(0, "Job started");
                info!(job_id = %job_id, "Job started");
                Ok(true)
            }
            from => Err(TrackerError::InvalidTransition {
                job_id: job_id.to_string(),
                from,
                to: JobState::Processing,
            }),
        })
    }

    /// `processing -> completed`
    pub fn complete(&self, job_id: &JobId, result: Value) -> TrackerResult<()> {
        self.with_job(job_id, |entry| {
            if entry.info.status != JobState::Processing {
                return Err(TrackerError::InvalidTransition {
                    job_id: job_id.to_string(),
                    from: entry.info.status,
                    to: JobState::Completed,
                });
            }
            entry.info.result = Some(result);
            entry.info.finish(JobState::Completed);
            entry.info.record_progress(100, "Job completed successfully");
            info!(job_id = %job_id, "Job completed");
            Ok(())
        })
    }

    /// `pending | processing -> failed`
    pub fn fail(&self, job_id: &JobId, error: &str) -> TrackerResult<()> {
        self.with_job(job_id, |entry| {
            if entry.info.status.is_terminal() {
                return Err(TrackerError::InvalidTransition {
                    job_id: job_id.to_string(),
                    from: entry.info.status,
                    to: JobState::Failed,
                });
            }
            entry.info.error = Some(error.to_string());
            entry.info.message = format!("Job failed: {}", error);
            entry.info.finish(JobState::Failed);
            error!(job_id = %job_id, "Job failed: {}", error);
            Ok(())
        })
    }

    /// Request cancellation; safe to call any number of times.
    ///
    /// A pending job is cancelled on the spot. A processing job only gets the
    /// flag and its token fired; the worker acknowledges with
    /// [`mark_cancelled`](Self::mark_cancelled). Terminal jobs are left alone.
    pub fn cancel(&self, job_id: &JobId) -> TrackerResult<JobState> {
        self.with_job(job_id, |entry| {
            match entry.info.status {
                JobState::Pending => {
                    entry.info.cancel_requested = true;
                    entry.info.message = "Job cancelled by user".to_string();
                    entry.info.finish(JobState::Cancelled);
                    entry.cancel.cancel();
                    info!(job_id = %job_id, "Pending job cancelled");
                }
                JobState::Processing => {
                    if !entry.info.cancel_requested {
                        info!(job_id = %job_id, "Cancellation requested");
                    }
                    entry.info.cancel_requested = true;
                    entry.cancel.cancel();
                }
                _ => {}
            }
            Ok(entry.info.status)
        })
    }

    /// Worker acknowledgement of a requested cancel: `processing -> cancelled`
    pub fn mark_cancelled(&self, job_id: &JobId) -> TrackerResult<()> {
        self.with_job(job_id, |entry| {
            if entry.info.status != JobState::Processing || !entry.info.cancel_requested {
                return Err(TrackerError::InvalidTransition {
                    job_id: job_id.to_string(),
                    from: entry.info.status,
                    to: JobState::Cancelled,
                });
            }
            entry.info.message = "Job cancelled by user".to_string();
            entry.info.finish(JobState::Cancelled);
            info!(job_id = %job_id, "Job cancelled");
            Ok(())
        })
    }

    pub fn is_cancel_requested(&self, job_id: &JobId) -> bool {
        self.jobs
            .read()
            .get(job_id)
            .is_some_and(|entry| entry.info.cancel_requested)
    }

    /// Token handed to the executor; fires on `cancel`
    pub fn cancellation_token(&self, job_id: &JobId) -> TrackerResult<CancellationToken> {
        self.jobs
            .read()
            .get(job_id)
            .map(|entry| entry.cancel.clone())
            .ok_or_else(|| TrackerError::NotFound(job_id.to_string()))
    }

    /// All jobs, oldest first
    pub fn list_jobs(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self
            .jobs
            .read()
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        jobs.sort_by_key(|info| info.created_at);
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }

    /// Evict terminal jobs that finished before `cutoff`
    pub fn cleanup_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs.write();
        let before = jobs.len();
        jobs.retain(|job_id, entry| {
            let expired = entry.info.status.is_terminal()
                && entry.info.completed_at.is_some_and(|at| at < cutoff);
            if expired {
                debug!(job_id = %job_id, "Evicting finished job");
            }
            !expired
        });
        before - jobs.len()
    }

    /// Evict terminal jobs that finished more than `age` ago
    pub fn cleanup_older_than(&self, age: Duration) -> usize {
        let age = chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let cutoff = Utc::now()
            .checked_sub_signed(age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.cleanup_finished_before(cutoff)
    }
}

/// Periodic eviction of finished jobs
pub struct TrackerJanitor {
    tracker: Arc<JobTracker>,
    interval: Duration,
    retention: Duration,
}

impl TrackerJanitor {
    pub fn new(tracker: Arc<JobTracker>, config: &TrackerConfig) -> Self {
        Self {
            tracker,
            interval: config.sweep_interval,
            retention: config.retention,
        }
    }

    /// Run one sweep
    pub fn sweep(&self) -> usize {
        self.tracker.cleanup_older_than(self.retention)
    }

    /// Sweep every interval until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.interval);
        info!("Starting tracker janitor with interval: {:?}", self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let evicted = self.sweep();
            if evicted > 0 {
                info!("Evicted {} finished jobs", evicted);
            } else {
                debug!("No finished jobs to evict");
            }
        }
        debug!("Tracker janitor stopped");
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn tracker_with_job() -> (JobTracker, JobId) {
        let tracker = JobTracker::new();
        let id = tracker.create_job("form_submission", json!({"rows": 3}));
        (tracker, id)
    }

    #[test]
    fn test_happy_path() {
        let (tracker, id) = tracker_with_job();
        assert!(tracker.start(&id).unwrap());
        tracker.update_progress(&id, 50, "Halfway").unwrap();
        tracker.complete(&id, json!({"ok": true})).unwrap();

        let info = tracker.get_job(&id).unwrap();
        assert_eq!(info.status, JobState::Completed);
        assert_eq!(info.progress, 100);
        assert!(info.started_at.is_some() && info.completed_at.is_some());
        let messages: Vec<_> = info.logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["Job started", "Halfway", "Job completed successfully"]);
    }

    #[test]
    fn test_fail_sets_message() {
        let (tracker, id) = tracker_with_job();
        tracker.fail(&id, "empty batch").unwrap();
        let info = tracker.get_job(&id).unwrap();
        assert_eq!(info.status, JobState::Failed);
        assert_eq!(info.message, "Job failed: empty batch");
        assert_eq!(info.error.as_deref(), Some("empty batch"));
    }

    #[test]
    fn test_cancel_pending_is_immediate_and_blocks_start() {
        let (tracker, id) = tracker_with_job();
        let token = tracker.cancellation_token(&id).unwrap();

        assert_eq!(tracker.cancel(&id).unwrap(), JobState::Cancelled);
        assert!(token.is_cancelled());
        assert!(!tracker.start(&id).unwrap());
        assert_eq!(tracker.get_job(&id).unwrap().status, JobState::Cancelled);
    }

    #[test]
    fn test_cancel_processing_is_cooperative_and_idempotent() {
        let (tracker, id) = tracker_with_job();
        tracker.start(&id).unwrap();
        let token = tracker.cancellation_token(&id).unwrap();

        assert_eq!(tracker.cancel(&id).unwrap(), JobState::Processing);
        assert_eq!(tracker.cancel(&id).unwrap(), JobState::Processing);
        assert!(token.is_cancelled());
        assert!(tracker.is_cancel_requested(&id));

        tracker.mark_cancelled(&id).unwrap();
        assert_eq!(tracker.cancel(&id).unwrap(), JobState::Cancelled);
        let info = tracker.get_job(&id).unwrap();
        assert!(info.cancel_requested);
        assert!(info.completed_at.is_some());
    }

    #[test]
    fn test_terminal_jobs_reject_transitions() {
        let (tracker, id) = tracker_with_job();
        tracker.start(&id).unwrap();
        tracker.complete(&id, Value::Null).unwrap();

        assert_eq!(tracker.cancel(&id).unwrap(), JobState::Completed);
        assert!(matches!(
            tracker.fail(&id, "late"),
            Err(TrackerError::InvalidTransition { from: JobState::Completed, .. })
        ));
        assert!(tracker.mark_cancelled(&id).is_err());
        assert!(tracker.start(&id).is_err());
    }

    #[test]
    fn test_unknown_job() {
        let tracker = JobTracker::new();
        let missing = JobId::from("nope");
        assert!(tracker.get_job(&missing).is_none());
        assert!(matches!(tracker.cancel(&missing), Err(TrackerError::NotFound(_))));
        assert!(tracker.cancellation_token(&missing).is_err());
    }

    #[test]
    fn test_cleanup_only_evicts_old_terminal_jobs() {
        let tracker = JobTracker::new();
        let done = tracker.create_job("a", Value::Null);
        let running = tracker.create_job("b", Value::Null);
        tracker.start(&done).unwrap();
        tracker.complete(&done, Value::Null).unwrap();
        tracker.start(&running).unwrap();

        assert_eq!(tracker.cleanup_older_than(Duration::from_secs(3600)), 0);
        let evicted = tracker.cleanup_finished_before(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(evicted, 1);
        assert!(tracker.get_job(&done).is_none());
        assert!(tracker.get_job(&running).is_some());
    }

    #[test]
    fn test_list_jobs_oldest_first() {
        let tracker = JobTracker::new();
        let first = tracker.create_job("a", Value::Null);
        std::thread::sleep(Duration::from_millis(2));
        let second = tracker.create_job("b", Value::Null);

        let ids: Vec<_> = tracker.list_jobs().into_iter().map(|j| j.job_id).collect();
        assert_eq!(ids, vec![first, second]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_janitor_sweeps_until_shutdown() {
        let tracker = Arc::new(JobTracker::new());
        let id = tracker.create_job("a", Value::Null);
        tracker.fail(&id, "x").unwrap();

        let config = TrackerConfig {
            retention: Duration::ZERO,
            sweep_interval: Duration::from_secs(600),
        };
        let shutdown = CancellationToken::new();
        std::thread::sleep(Duration::from_millis(2));
        let handle = TrackerJanitor::new(tracker.clone(), &config).spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(tracker.is_empty());

        shutdown.cancel();
        handle.await.unwrap();
    }

    proptest! {
        #[test]
        fn progress_is_always_clamped(percent in any::<i64>()) {
            let (tracker, id) = tracker_with_job();
            tracker.update_progress(&id, percent, "step").unwrap();
            let info = tracker.get_job(&id).unwrap();
            prop_assert!(info.progress <= 100);
            prop_assert_eq!(info.progress as i64, percent.clamp(0, 100));
            prop_assert_eq!(info.logs.len(), 1);
        }
    }
}
