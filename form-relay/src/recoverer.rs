//! Periodic return of deliveries stranded by consumers that died mid-flight.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::client::QueueClient;
use crate::QueueResult;

/// Sweeps the queue for orphaned deliveries every `interval`
pub struct Recoverer<B: Broker> {
    client: Arc<QueueClient<B>>,
    interval: Duration,
}

impl<B: Broker> Recoverer<B> {
    pub fn new(client: Arc<QueueClient<B>>, interval: Duration) -> Self {
        Self {
            client,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Run one sweep
    pub async fn sweep(&self) -> QueueResult<u64> {
        self.client.recover_orphans().await
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(queue = self.client.queue_name(), "Starting recoverer with interval: {:?}", self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let sweep = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.sweep() => result,
            };
            match sweep {
                Ok(0) => debug!("No orphaned deliveries"),
                Ok(recovered) => info!(recovered, "Orphaned deliveries requeued"),
                Err(e) if e.is_connection_error() => debug!("Recoverer could not reach broker: {}", e),
                Err(e) => warn!("Recoverer sweep failed: {}", e),
            }
        }
        debug!("Recoverer stopped");
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
