//! # form-relay: scheduled form submission over a durable queue
//!
//! Spreadsheet rows become [`JobRecord`]s. The [`Scheduler`] publishes each
//! one to a durable broker queue, either right away or at its ETA. The
//! [`DispatchBridge`] consumes the queue with a bounded worker pool and hands
//! every message to a blocking [`Executor`] that fills in the web form.
//! Failed submissions are republished with exponential backoff until their
//! retry budget runs out.
//!
//! Long-running batches are tracked by the [`JobTracker`] so callers can poll
//! progress or request cancellation.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use form_relay::prelude::*;
//!
//! # async fn run() -> QueueResult<()> {
//! let config = RelayConfig::from_env(form_relay::config::ENV_PREFIX)?;
//! let client = Arc::new(QueueClient::new(MemoryBroker::new(), config.broker.clone()));
//!
//! let executor = Arc::new(FnExecutor::new(|record: &JobRecord, _cancel: &CancellationToken| {
//!     println!("submitting row {}", record.row_id);
//!     Ok(true)
//! }));
//! let bridge = DispatchBridge::new(client.clone(), executor, config.bridge.clone());
//! bridge.start_worker_pool(config.bridge.workers).await?;
//!
//! let scheduler = Scheduler::new(client, config.scheduler.clone(), config.bridge.max_retries)?;
//! let rows = vec![vec![
//!     "Ada".to_string(),
//!     "2030-01-01 09:00:00".to_string(),
//!     "high".to_string(),
//! ]];
//! let records = form_relay::ingest::records_from_rows(
//!     &["entry.1".to_string()],
//!     &rows,
//!     scheduler.timezone(),
//! );
//! scheduler.schedule_jobs(records).await?;
//! # Ok(())
//! # }
//! ```

pub mod types;
pub mod error;
pub mod codec;
pub mod broker;
pub mod config;
pub mod eta;
pub mod ingest;
pub mod client;
pub mod recoverer;
pub mod scheduler;
pub mod executor;
pub mod bridge;
pub mod stats;
pub mod tracker;
pub mod batch;
pub mod observability;

#[cfg(feature = "cron-scheduling")]
pub mod recurring;

pub use types::{
    DeliveryTag, FieldValue, JobEvent, JobId, JobPriority, JobRecord, JobStatus, MessageId,
    Payload, QueueMessage,
};
pub use error::{ExecutorError, QueueError, QueueResult, TrackerError, TrackerResult};
pub use codec::MessageCodec;
pub use codec::json::JsonCodec;
pub use broker::{Broker, BrokerConnection, MemoryBroker};
pub use config::{BridgeConfig, BrokerConfig, RelayConfig, SchedulerConfig, TrackerConfig};
pub use client::{DeliveryHandler, QueueClient};
pub use recoverer::Recoverer;
pub use scheduler::{ScheduledBatch, Scheduler};
pub use executor::{Executor, FnExecutor};
pub use bridge::DispatchBridge;
pub use stats::{Stats, StatsSnapshot};
pub use tracker::{JobInfo, JobState, JobTracker, TrackerJanitor};
pub use batch::BatchRunner;
pub use observability::ObservabilityLayer;

#[cfg(feature = "redis")]
pub use broker::RedisBroker;

#[cfg(feature = "cron-scheduling")]
pub use recurring::RecurringBatch;

pub mod prelude {
    pub use crate::{
        BatchRunner, DispatchBridge, JobTracker, QueueClient, Scheduler,
    };

    pub use crate::{
        Broker, Executor, ExecutorError, FnExecutor, JobEvent, JobId, JobPriority, JobRecord,
        JobStatus, Payload, QueueError, QueueMessage, QueueResult, RelayConfig,
    };

    pub use crate::MemoryBroker;

    #[cfg(feature = "redis")]
    pub use crate::RedisBroker;

    pub use crate::ObservabilityLayer;

    pub use async_trait::async_trait;
    pub use tokio_util::sync::CancellationToken;
}
