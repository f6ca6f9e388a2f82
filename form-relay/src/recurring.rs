//! Recurring re-submission of a fixed set of rows.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono_tz::Tz;
use cron::Schedule;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::Broker;
use crate::scheduler::Scheduler;
use crate::types::{JobRecord, JobStatus};
use crate::{QueueError, QueueResult};

/// When a recurring batch fires
#[derive(Debug, Clone)]
pub enum Cadence {
    /// Cron expression with a seconds field, e.g. `0 30 9 * * Mon-Fri`
    Cron(Schedule),
    Every(Duration),
}

/// A fixed list of rows submitted again at every occurrence.
///
/// Each run publishes immediately; per-row ETAs are dropped.
#[derive(Debug, Clone)]
pub struct RecurringBatch {
    name: String,
    cadence: Cadence,
    records: Vec<JobRecord>,
}

impl RecurringBatch {
    pub fn cron(name: impl Into<String>, expr: &str, records: Vec<JobRecord>) -> QueueResult<Self> {
        let schedule = Schedule::from_str(expr)
            .map_err(|e| QueueError::Config(format!("Invalid cron expression '{}': {}", expr, e)))?;
        Ok(Self {
            name: name.into(),
            cadence: Cadence::Cron(schedule),
            records,
        })
    }

    pub fn every(name: impl Into<String>, interval: Duration, records: Vec<JobRecord>) -> Self {
        Self {
            name: name.into(),
            cadence: Cadence::Every(interval),
            records,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next occurrence strictly after `after`
    pub fn next_fire(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        match &self.cadence {
            Cadence::Cron(schedule) => schedule.after(after).next(),
            Cadence::Every(interval) => chrono::Duration::from_std(*interval)
                .ok()
                .and_then(|step| after.checked_add_signed(step)),
        }
    }

    fn fresh_records(&self) -> Vec<JobRecord> {
        self.records
            .iter()
            .cloned()
            .map(|mut record| {
                record.status = JobStatus::Pending;
                record.eta = None;
                record
            })
            .collect()
    }

    /// Submit through `scheduler` at every occurrence until `shutdown` fires
    pub fn spawn<B: Broker>(
        self,
        scheduler: Arc<Scheduler<B>>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(scheduler, shutdown).await })
    }

    async fn run<B: Broker>(self, scheduler: Arc<Scheduler<B>>, shutdown: CancellationToken) {
        info!(name = %self.name, "Recurring batch started");
        let mut occurrence: u64 = 0;

        loop {
            let now = scheduler.now();
            let Some(next) = self.next_fire(&now) else {
                warn!(name = %self.name, "No further occurrences, stopping");
                break;
            };
            let delay = (next - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            occurrence += 1;
            let batch_id = format!("{}-{}", self.name, occurrence);
            match scheduler
                .schedule_batch(self.fresh_records(), Some(batch_id.clone()))
                .await
            {
                Ok(batch) => info!(batch_id, rows = batch.len(), "Recurring batch submitted"),
                Err(QueueError::WorkerShutdown) => break,
                Err(e) => error!(batch_id, "Recurring batch failed: {}", e),
            }
        }
        info!(name = %self.name, "Recurring batch stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::client::QueueClient;
    use crate::config::{BrokerConfig, SchedulerConfig};
    use crate::types::Payload;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_cron_next_fire_in_zone() {
        let batch = RecurringBatch::cron("morning", "0 30 9 * * *", Vec::new()).unwrap();
        let tz = chrono_tz::Asia::Jakarta;
        let after = tz.with_ymd_and_hms(2030, 1, 1, 10, 0, 0).unwrap();
        let next = batch.next_fire(&after).unwrap();
        assert_eq!((next.hour(), next.minute()), (9, 30));
        assert!(next > after);
    }

    #[test]
    fn test_invalid_cron_is_config_error() {
        assert!(matches!(
            RecurringBatch::cron("bad", "whenever", Vec::new()),
            Err(QueueError::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_resubmits_until_cancelled() {
        let broker = MemoryBroker::new();
        let client = Arc::new(QueueClient::new(
            broker.clone(),
            BrokerConfig {
                queue: "jobs".to_string(),
                ..Default::default()
            },
        ));
        let scheduler = Arc::new(Scheduler::new(client, SchedulerConfig::default(), 3).unwrap());
        let shutdown = CancellationToken::new();

        let records = vec![JobRecord::new(1, Payload::new())];
        let handle = RecurringBatch::every("tick", Duration::from_secs(60), records)
            .spawn(scheduler, shutdown.clone());

        tokio::time::sleep(Duration::from_secs(150)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(broker.published().len(), 2);
    }
}
