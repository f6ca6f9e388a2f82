use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::broker::{Broker, BrokerConnection, Delivery, PublishProperties, QueueInfo};
use crate::types::DeliveryTag;
use crate::{QueueError, QueueResult};

#[derive(Default)]
struct MemoryQueue {
    durable: bool,
    ready: VecDeque<ReadyMessage>,
    unacked: HashMap<String, Unacked>,
}

struct Unacked {
    owner: u64,
    /// Broker generation the owner was opened in
    generation: u64,
    message: ReadyMessage,
}

#[derive(Clone)]
struct ReadyMessage {
    body: Vec<u8>,
    redelivered: bool,
}

/// A body accepted by the broker, with the (tokio) instant it arrived
#[derive(Debug, Clone)]
pub struct PublishRecord {
    pub queue: String,
    pub body: Vec<u8>,
    pub persistent: bool,
    pub at: Instant,
}

struct Inner {
    queues: Mutex<HashMap<String, MemoryQueue>>,
    published: Mutex<Vec<PublishRecord>>,
    notify: Notify,
    next_connection: AtomicU64,
    next_tag: AtomicU64,
    opens: AtomicU64,
    /// Bumped by `drop_connections`; older connections become dead
    generation: AtomicU64,
    /// Generations killed by `crash_connections`; their deliveries stay stranded
    crashed: Mutex<HashSet<u64>>,
    fail_opens: AtomicU32,
    fail_publishes: AtomicU32,
}

impl Inner {
    fn requeue_owned_by(&self, connection_id: Option<u64>) -> usize {
        let mut queues = self.queues.lock();
        let mut moved = 0;
        for queue in queues.values_mut() {
            let tags: Vec<String> = queue
                .unacked
                .iter()
                .filter(|(_, entry)| connection_id.map_or(true, |id| entry.owner == id))
                .map(|(tag, _)| tag.clone())
                .collect();
            for tag in tags {
                if let Some(Unacked { mut message, .. }) = queue.unacked.remove(&tag) {
                    message.redelivered = true;
                    queue.ready.push_front(message);
                    moved += 1;
                }
            }
        }
        if moved > 0 {
            self.notify.notify_waiters();
        }
        moved
    }
}

/// In-process broker for tests and development.
///
/// Behaves like a single-node broker with per-connection unacknowledged
/// deliveries, and exposes knobs to inject the faults a real broker produces.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                published: Mutex::new(Vec::new()),
                notify: Notify::new(),
                next_connection: AtomicU64::new(1),
                next_tag: AtomicU64::new(1),
                opens: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                crashed: Mutex::new(HashSet::new()),
                fail_opens: AtomicU32::new(0),
                fail_publishes: AtomicU32::new(0),
            }),
        }
    }

    /// Make the next `n` calls to `open` fail
    pub fn fail_next_opens(&self, n: u32) {
        self.inner.fail_opens.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` publishes fail with a lost connection
    pub fn fail_next_publishes(&self, n: u32) {
        self.inner.fail_publishes.store(n, Ordering::SeqCst);
    }

    /// Kill every open connection; their unacknowledged deliveries are requeued
    pub fn drop_connections(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let requeued = self.inner.requeue_owned_by(None);
        debug!(requeued, "memory broker dropped all connections");
        self.inner.notify.notify_waiters();
    }

    /// Kill every open connection the way a crashed consumer process would:
    /// their unacknowledged deliveries stay stranded until
    /// [`BrokerConnection::recover_orphans`] returns them.
    pub fn crash_connections(&self) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.crashed.lock().insert(generation);
        self.inner.notify.notify_waiters();
    }

    /// Create `name` as a non-durable queue so a durable declare conflicts
    pub fn predeclare_incompatible(&self, name: &str) {
        self.inner.queues.lock().insert(
            name.to_string(),
            MemoryQueue {
                durable: false,
                ..Default::default()
            },
        );
    }

    /// Push a raw body, bypassing the codec
    pub fn inject_raw(&self, queue: &str, body: impl Into<Vec<u8>>) {
        self.inner
            .queues
            .lock()
            .entry(queue.to_string())
            .or_insert_with(|| MemoryQueue {
                durable: true,
                ..Default::default()
            })
            .ready
            .push_back(ReadyMessage {
                body: body.into(),
                redelivered: false,
            });
        self.inner.notify.notify_waiters();
    }

    /// Every accepted publish, in arrival order
    pub fn published(&self) -> Vec<PublishRecord> {
        self.inner.published.lock().clone()
    }

    pub fn ready_count(&self, queue: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    pub fn is_durable(&self, queue: &str) -> Option<bool> {
        self.inner.queues.lock().get(queue).map(|q| q.durable)
    }

    /// Number of successful `open` calls
    pub fn open_count(&self) -> u64 {
        self.inner.opens.load(Ordering::SeqCst)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Connection = MemoryConnection;

    async fn open(&self) -> QueueResult<MemoryConnection> {
        let remaining = self.inner.fail_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inner.fail_opens.store(remaining - 1, Ordering::SeqCst);
            return Err(QueueError::Broker("connection refused".to_string()));
        }

        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConnection {
            inner: self.inner.clone(),
            id: self.inner.next_connection.fetch_add(1, Ordering::SeqCst),
            generation: self.inner.generation.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Exclusive connection to a [`MemoryBroker`]
pub struct MemoryConnection {
    inner: Arc<Inner>,
    id: u64,
    generation: u64,
    closed: AtomicBool,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl MemoryConnection {
    fn ensure_open(&self) -> QueueResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::ConnectionLost("connection closed".to_string()));
        }
        if self.generation != self.inner.generation.load(Ordering::SeqCst) {
            return Err(QueueError::ConnectionLost(
                "connection reset by broker".to_string(),
            ));
        }
        Ok(())
    }

    fn try_take(&self, queue: &str, prefetch: u16) -> QueueResult<Option<Delivery>> {
        let mut queues = self.inner.queues.lock();
        let q = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::Broker(format!("no queue '{}'", queue)))?;

        let in_flight = q.unacked.values().filter(|entry| entry.owner == self.id).count();
        if prefetch > 0 && in_flight >= prefetch as usize {
            return Ok(None);
        }

        let Some(message) = q.ready.pop_front() else {
            return Ok(None);
        };
        let tag = DeliveryTag::from(self.inner.next_tag.fetch_add(1, Ordering::SeqCst));
        let delivery = Delivery {
            tag: tag.clone(),
            body: message.body.clone(),
            redelivered: message.redelivered,
        };
        q.unacked.insert(
            tag.0,
            Unacked {
                owner: self.id,
                generation: self.generation,
                message,
            },
        );
        Ok(Some(delivery))
    }

    fn settle(&self, tag: &DeliveryTag, requeue: bool) -> QueueResult<()> {
        let mut queues = self.inner.queues.lock();
        for queue in queues.values_mut() {
            if let Some(entry) = queue.unacked.remove(tag.as_str()) {
                if entry.owner != self.id {
                    queue.unacked.insert(tag.0.clone(), entry);
                    break;
                }
                let mut message = entry.message;
                if requeue {
                    message.redelivered = true;
                    queue.ready.push_front(message);
                    self.inner.notify.notify_waiters();
                }
                return Ok(());
            }
        }
        Err(QueueError::Broker(format!("unknown delivery tag {}", tag)))
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn declare_queue(&mut self, name: &str, durable: bool) -> QueueResult<QueueInfo> {
        self.ensure_open()?;
        let mut queues = self.inner.queues.lock();
        let queue = queues.entry(name.to_string()).or_insert_with(|| MemoryQueue {
            durable,
            ..Default::default()
        });

        if queue.durable != durable {
            self.closed.store(true, Ordering::SeqCst);
            return Err(QueueError::IncompatibleQueue(format!(
                "'{}' exists with durable={}, requested durable={}",
                name, queue.durable, durable
            )));
        }

        Ok(QueueInfo {
            name: name.to_string(),
            durable: queue.durable,
            message_count: queue.ready.len() as u64,
        })
    }

    async fn declare_queue_passive(&mut self, name: &str) -> QueueResult<QueueInfo> {
        self.ensure_open()?;
        let queues = self.inner.queues.lock();
        let queue = queues
            .get(name)
            .ok_or_else(|| QueueError::Broker(format!("no queue '{}'", name)))?;

        Ok(QueueInfo {
            name: name.to_string(),
            durable: queue.durable,
            message_count: queue.ready.len() as u64,
        })
    }

    async fn publish(
        &mut self,
        queue: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> QueueResult<()> {
        self.ensure_open()?;

        let remaining = self.inner.fail_publishes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inner.fail_publishes.store(remaining - 1, Ordering::SeqCst);
            self.closed.store(true, Ordering::SeqCst);
            return Err(QueueError::ConnectionLost("publish channel closed".to_string()));
        }

        {
            let mut queues = self.inner.queues.lock();
            let q = queues
                .get_mut(queue)
                .ok_or_else(|| QueueError::Broker(format!("no queue '{}'", queue)))?;
            q.ready.push_back(ReadyMessage {
                body: body.to_vec(),
                redelivered: false,
            });
        }

        self.inner.published.lock().push(PublishRecord {
            queue: queue.to_string(),
            body: body.to_vec(),
            persistent: properties.persistent,
            at: Instant::now(),
        });
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn next_delivery(
        &mut self,
        queue: &str,
        prefetch: u16,
        wait: Duration,
    ) -> QueueResult<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_open()?;
            if let Some(delivery) = self.try_take(queue, prefetch)? {
                return Ok(Some(delivery));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                self.ensure_open()?;
                return Ok(None);
            }
        }
    }

    async fn ack(&mut self, tag: &DeliveryTag) -> QueueResult<()> {
        self.ensure_open()?;
        self.settle(tag, false)
    }

    async fn nack(&mut self, tag: &DeliveryTag, requeue: bool) -> QueueResult<()> {
        self.ensure_open()?;
        self.settle(tag, requeue)
    }

    async fn purge(&mut self, queue: &str) -> QueueResult<u64> {
        self.ensure_open()?;
        let mut queues = self.inner.queues.lock();
        let q = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::Broker(format!("no queue '{}'", queue)))?;
        let purged = q.ready.len() as u64;
        q.ready.clear();
        Ok(purged)
    }

    async fn recover_orphans(&mut self, queue: &str) -> QueueResult<u64> {
        self.ensure_open()?;
        let current = self.inner.generation.load(Ordering::SeqCst);
        let mut queues = self.inner.queues.lock();
        let Some(q) = queues.get_mut(queue) else {
            return Ok(0);
        };

        let orphaned: Vec<String> = q
            .unacked
            .iter()
            .filter(|(_, entry)| entry.generation < current)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in &orphaned {
            if let Some(Unacked { mut message, .. }) = q.unacked.remove(tag) {
                message.redelivered = true;
                q.ready.push_front(message);
            }
        }
        if !orphaned.is_empty() {
            self.inner.notify.notify_waiters();
        }
        Ok(orphaned.len() as u64)
    }

    async fn close(&mut self) -> QueueResult<()> {
        self.release();
        Ok(())
    }
}

impl MemoryConnection {
    /// Requeue this connection's deliveries unless it died in a crash
    fn release(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.inner.crashed.lock().contains(&self.generation) {
            self.inner.requeue_owned_by(Some(self.id));
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.release();
    }
}
