use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::{Broker, BrokerConnection, PublishProperties};
use crate::codec::json::JsonCodec;
use crate::codec::MessageCodec;
use crate::config::BrokerConfig;
use crate::observability::ObservabilityLayer;
use crate::types::QueueMessage;
use crate::{QueueError, QueueResult};

/// Receives decoded messages from [`QueueClient::consume`].
///
/// `Ok` acknowledges the delivery, `Err` puts it back on the queue.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, message: QueueMessage) -> QueueResult<()>;
}

/// Connection management, publishing and consuming on top of a [`Broker`]
pub struct QueueClient<B: Broker> {
    broker: B,
    config: BrokerConfig,
    codec: Arc<dyn MessageCodec>,
    observability: ObservabilityLayer,
    /// Long-lived connection for the immediate publish path
    publisher: Mutex<Option<B::Connection>>,
}

impl<B: Broker> QueueClient<B> {
    pub fn new(broker: B, config: BrokerConfig) -> Self {
        Self {
            broker,
            config,
            codec: Arc::new(JsonCodec),
            observability: ObservabilityLayer::new(),
            publisher: Mutex::new(None),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_observability(mut self, observability: ObservabilityLayer) -> Self {
        self.observability = observability;
        self
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn queue_name(&self) -> &str {
        &self.config.queue
    }

    pub fn observability(&self) -> &ObservabilityLayer {
        &self.observability
    }

    /// Open a connection with the queue declared, retrying with backoff
    #[instrument(skip(self), fields(broker = self.broker.name(), queue = %self.config.queue))]
    pub async fn connect(&self) -> QueueResult<B::Connection> {
        let attempts = self.config.connect_attempts.max(1);
        let mut delay = self.config.connect_backoff_base;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.open_and_declare().await {
                Ok(conn) => {
                    if attempt > 1 {
                        info!(attempt, "Connected to broker after retrying");
                    } else {
                        debug!("Connected to broker");
                    }
                    return Ok(conn);
                }
                Err(e) => {
                    warn!(attempt, attempts, "Broker connection failed: {}", e);
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(with_jitter(delay)).await;
                        delay = (delay * 2).min(self.config.connect_backoff_cap);
                    }
                }
            }
        }

        error!(attempts, "Giving up on broker connection");
        Err(QueueError::Connection {
            attempts,
            reason: last_error,
        })
    }

    async fn open_and_declare(&self) -> QueueResult<B::Connection> {
        let queue = &self.config.queue;
        let mut conn = self.broker.open().await?;

        match conn.declare_queue(queue, self.config.durable).await {
            Ok(_) => Ok(conn),
            Err(QueueError::IncompatibleQueue(reason)) => {
                warn!("Queue '{}' already exists with other parameters ({}), attaching passively", queue, reason);
                let _ = conn.close().await;
                let mut conn = self.broker.open().await?;
                conn.declare_queue_passive(queue).await?;
                Ok(conn)
            }
            Err(e) => Err(e),
        }
    }

    fn properties(&self, message: &QueueMessage) -> PublishProperties {
        PublishProperties {
            persistent: message.persistent,
            content_type: self.codec.content_type(),
            message_id: message.message_id.to_string(),
        }
    }

    /// Publish on the shared connection, reconnecting between attempts
    #[instrument(skip(self, message), fields(row_id = message.row_id(), retry_count = message.retry_count))]
    pub async fn publish(&self, message: &QueueMessage) -> QueueResult<()> {
        let mut slot = self.publisher.lock().await;
        self.publish_on(&mut slot, message).await
    }

    /// Publish on a short-lived connection of its own.
    ///
    /// Used by timers and pool workers so they never contend for the shared
    /// publisher.
    #[instrument(skip(self, message), fields(row_id = message.row_id(), retry_count = message.retry_count))]
    pub async fn publish_detached(&self, message: &QueueMessage) -> QueueResult<()> {
        let mut slot = None;
        let result = self.publish_on(&mut slot, message).await;
        if let Some(mut conn) = slot {
            if let Err(e) = conn.close().await {
                debug!("Error closing detached publisher: {}", e);
            }
        }
        result
    }

    async fn publish_on(
        &self,
        slot: &mut Option<B::Connection>,
        message: &QueueMessage,
    ) -> QueueResult<()> {
        let body = self.codec.encode(message)?;
        let properties = self.properties(message);
        let attempts = self.config.publish_retries.max(1);
        let mut delay = self.config.connect_backoff_base;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let outcome = match self.ensure_connected(slot).await {
                Ok(conn) => conn.publish(&self.config.queue, &body, &properties).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    debug!(attempt, "Published message");
                    self.observability.record_published(message);
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, attempts, "Publish failed: {}", e);
                    last_error = e.to_string();
                    // The connection may be half dead; start fresh next time
                    *slot = None;
                    if attempt < attempts {
                        tokio::time::sleep(with_jitter(delay)).await;
                        delay = (delay * 2).min(self.config.connect_backoff_cap);
                    }
                }
            }
        }

        error!(row_id = message.row_id(), "Giving up on publish: {}", last_error);
        self.observability.record_publish_failed(message, &last_error);
        Err(QueueError::Publish {
            row_id: message.row_id(),
            attempts,
            reason: last_error,
        })
    }

    async fn ensure_connected<'a>(
        &self,
        slot: &'a mut Option<B::Connection>,
    ) -> QueueResult<&'a mut B::Connection> {
        if slot.is_none() {
            *slot = Some(self.connect().await?);
        }
        slot.as_mut()
            .ok_or_else(|| QueueError::Internal("publisher connection missing".to_string()))
    }

    /// Deliver messages to `handler` until `shutdown` is cancelled.
    ///
    /// Survives connection loss by waiting `reconnect_delay` and attaching
    /// again. Malformed bodies are rejected without requeue.
    #[instrument(skip(self, handler, shutdown), fields(queue = %self.config.queue))]
    pub async fn consume<H>(
        &self,
        handler: &H,
        prefetch: u16,
        shutdown: CancellationToken,
    ) -> QueueResult<()>
    where
        H: DeliveryHandler + ?Sized,
    {
        info!(prefetch, "Consumer starting");

        while !shutdown.is_cancelled() {
            let connected = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.connect() => result,
            };

            let mut conn = match connected {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Consumer could not connect: {}", e);
                    if self.pause_before_reconnect(&shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            match self.consume_on(&mut conn, handler, prefetch, &shutdown).await {
                Ok(()) => {
                    let _ = conn.close().await;
                    break;
                }
                Err(e) => {
                    warn!(
                        "Consumer lost its connection, reconnecting in {:?}: {}",
                        self.config.reconnect_delay, e
                    );
                    drop(conn);
                    if self.pause_before_reconnect(&shutdown).await {
                        break;
                    }
                }
            }
        }

        info!("Consumer stopped");
        Ok(())
    }

    async fn consume_on<H>(
        &self,
        conn: &mut B::Connection,
        handler: &H,
        prefetch: u16,
        shutdown: &CancellationToken,
    ) -> QueueResult<()>
    where
        H: DeliveryHandler + ?Sized,
    {
        let queue = self.config.queue.as_str();

        while !shutdown.is_cancelled() {
            let Some(delivery) = conn
                .next_delivery(queue, prefetch, self.config.consume_wait)
                .await?
            else {
                continue;
            };

            let message = match self.codec.decode(&delivery.body) {
                Ok(message) => message,
                Err(e) => {
                    error!(tag = %delivery.tag, "Dropping malformed message: {}", e);
                    self.observability.record_dropped(&e.to_string());
                    conn.nack(&delivery.tag, false).await?;
                    continue;
                }
            };

            let row_id = message.row_id();
            if delivery.redelivered {
                debug!(row_id, "Redelivered message");
            }

            match handler.handle(message).await {
                Ok(()) => conn.ack(&delivery.tag).await?,
                Err(e) => {
                    warn!(row_id, "Handler refused message, requeueing: {}", e);
                    conn.nack(&delivery.tag, true).await?;
                }
            }
        }

        Ok(())
    }

    /// Returns true when shutdown fired during the pause
    async fn pause_before_reconnect(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => true,
            _ = tokio::time::sleep(self.config.reconnect_delay) => false,
        }
    }

    /// Remove every ready message, returning how many were dropped
    #[instrument(skip(self), fields(queue = %self.config.queue))]
    pub async fn purge(&self) -> QueueResult<u64> {
        let mut conn = self.connect().await?;
        let purged = conn.purge(&self.config.queue).await;
        let _ = conn.close().await;
        let purged = purged?;
        info!(purged, "Purged queue");
        Ok(purged)
    }

    /// Return deliveries held by dead consumers to the queue
    #[instrument(skip(self), fields(queue = %self.config.queue))]
    pub async fn recover_orphans(&self) -> QueueResult<u64> {
        let mut conn = self.connect().await?;
        let recovered = conn.recover_orphans(&self.config.queue).await;
        let _ = conn.close().await;
        let recovered = recovered?;
        if recovered > 0 {
            warn!(recovered, "Recovered deliveries stranded by dead consumers");
        }
        Ok(recovered)
    }

    /// Messages waiting in the queue
    pub async fn queue_depth(&self) -> QueueResult<u64> {
        let mut conn = self.connect().await?;
        let info = conn.declare_queue_passive(&self.config.queue).await;
        let _ = conn.close().await;
        Ok(info?.message_count)
    }

    /// Close the shared publisher connection
    pub async fn disconnect(&self) -> QueueResult<()> {
        if let Some(mut conn) = self.publisher.lock().await.take() {
            conn.close().await?;
            debug!("Shared publisher disconnected");
        }
        Ok(())
    }
}

/// Add up to 10% random jitter
fn with_jitter(delay: Duration) -> Duration {
    let max = (delay.as_millis() / 10) as u64;
    if max == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max))
}
