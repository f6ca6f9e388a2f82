//! Broker abstraction.
//!
//! A [`Broker`] opens connections; a [`BrokerConnection`] is owned by exactly
//! one task at a time (every primitive takes `&mut self`), so concurrent
//! publishers and consumers each hold their own connection.

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use std::time::Duration;

use crate::types::DeliveryTag;
use crate::QueueResult;

pub use memory::{MemoryBroker, MemoryConnection, PublishRecord};

#[cfg(feature = "redis")]
pub use self::redis::{RedisBroker, RedisConnection};

/// Properties attached to a published body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishProperties {
    /// Ask the broker to keep the message on disk
    pub persistent: bool,
    pub content_type: &'static str,
    pub message_id: String,
}

/// State of a declared queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub durable: bool,
    /// Messages ready for delivery
    pub message_count: u64,
}

/// One message handed to a consumer, unacknowledged until `ack`/`nack`
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
    /// Set when the broker delivered this body before without an ack
    pub redelivered: bool,
}

/// Factory for broker connections
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Open a fresh connection
    async fn open(&self) -> QueueResult<Self::Connection>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Connection primitives used by the queue client
#[async_trait]
pub trait BrokerConnection: Send + 'static {
    /// Declare (create or verify) a queue.
    ///
    /// An existing queue with different parameters yields
    /// `QueueError::IncompatibleQueue` and leaves the connection unusable.
    async fn declare_queue(&mut self, name: &str, durable: bool) -> QueueResult<QueueInfo>;

    /// Attach to an existing queue without asserting its parameters
    async fn declare_queue_passive(&mut self, name: &str) -> QueueResult<QueueInfo>;

    async fn publish(
        &mut self,
        queue: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> QueueResult<()>;

    /// Wait up to `wait` for the next delivery.
    ///
    /// Returns `Ok(None)` on timeout or while `prefetch` deliveries are
    /// still unacknowledged on this connection.
    async fn next_delivery(
        &mut self,
        queue: &str,
        prefetch: u16,
        wait: Duration,
    ) -> QueueResult<Option<Delivery>>;

    async fn ack(&mut self, tag: &DeliveryTag) -> QueueResult<()>;

    /// Reject a delivery, optionally putting it back at the head of the queue
    async fn nack(&mut self, tag: &DeliveryTag, requeue: bool) -> QueueResult<()>;

    /// Drop every ready message, returning how many were removed
    async fn purge(&mut self, queue: &str) -> QueueResult<u64>;

    /// Move deliveries stranded by dead consumers back onto `queue`.
    ///
    /// A consumer that vanishes without `close` (crash, severed socket) may
    /// leave bodies the broker cannot return on its own. Returns how many
    /// were moved.
    async fn recover_orphans(&mut self, queue: &str) -> QueueResult<u64>;

    /// Close the connection; unacknowledged deliveries go back to their queue
    async fn close(&mut self) -> QueueResult<()>;
}
