use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::info;

/// Terminal outcome counters for the dispatch pipeline
#[derive(Debug, Default)]
pub struct Stats {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`Stats`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Percentage, absent until something was processed
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub success_rate: Option<f64>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let succeeded = self.succeeded();
        let failed = self.failed();
        // processed is derived so a concurrent update cannot skew the rate
        let processed = succeeded + failed;
        let success_rate =
            (processed > 0).then(|| succeeded as f64 / processed as f64 * 100.0);

        StatsSnapshot {
            processed,
            succeeded,
            failed,
            success_rate,
        }
    }

    pub fn log_summary(&self) {
        let snapshot = self.snapshot();
        match snapshot.success_rate {
            Some(rate) => info!(
                processed = snapshot.processed,
                succeeded = snapshot.succeeded,
                failed = snapshot.failed,
                "Dispatch summary: {:.1}% success",
                rate
            ),
            None => info!("Dispatch summary: nothing processed yet"),
        }
    }
}
