//! Redis broker using the reliable queue pattern.
//!
//! Producers `LPUSH` onto the queue list. A consumer `BLMOVE`s the tail into
//! its own processing list, and an ack removes the body from there. Queue
//! parameters live in a `<queue>:meta` hash.
//!
//! Every consuming connection registers in `<queue>:consumers` and refreshes
//! a `<queue>:heartbeat:<id>` key with a TTL on each poll. A connection that
//! disappears without `close` stops refreshing; once its heartbeat expires,
//! `recover_orphans` moves its processing list back onto the queue.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerConnection, Delivery, PublishProperties, QueueInfo};
use crate::types::DeliveryTag;
use crate::{QueueError, QueueResult};

fn meta_key(queue: &str) -> String {
    format!("{}:meta", queue)
}

fn consumers_key(queue: &str) -> String {
    format!("{}:consumers", queue)
}

fn heartbeat_key(queue: &str, id: &str) -> String {
    format!("{}:heartbeat:{}", queue, id)
}

fn processing_key(queue: &str, id: &str) -> String {
    format!("{}:processing:{}", queue, id)
}

fn broker_err(err: redis::RedisError) -> QueueError {
    if err.is_connection_dropped() || err.is_io_error() || err.is_timeout() {
        QueueError::ConnectionLost(err.to_string())
    } else {
        QueueError::Broker(err.to_string())
    }
}

/// Redis-backed broker
#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    heartbeat_ttl: Duration,
}

impl RedisBroker {
    pub fn new(url: &str) -> QueueResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| QueueError::Config(format!("invalid redis url '{}': {}", url, e)))?;
        Ok(Self {
            client,
            heartbeat_ttl: Duration::from_secs(60),
        })
    }

    /// How long a silent consumer keeps its deliveries before they count as
    /// orphaned. Must exceed the consumer's poll interval.
    pub fn with_heartbeat_ttl(mut self, ttl: Duration) -> Self {
        self.heartbeat_ttl = ttl;
        self
    }
}

#[async_trait]
impl Broker for RedisBroker {
    type Connection = RedisConnection;

    async fn open(&self) -> QueueResult<RedisConnection> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(broker_err)?;

        Ok(RedisConnection {
            conn,
            id: Uuid::new_v4().to_string(),
            heartbeat_secs: self.heartbeat_ttl.as_secs().max(1),
            next_tag: 1,
            unacked: HashMap::new(),
            consuming: HashSet::new(),
        })
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

struct Unacked {
    queue: String,
    processing: String,
    body: Vec<u8>,
}

/// Exclusive Redis connection with its own processing lists
pub struct RedisConnection {
    conn: MultiplexedConnection,
    id: String,
    heartbeat_secs: u64,
    next_tag: u64,
    unacked: HashMap<String, Unacked>,
    /// Queues this connection has registered as a consumer of
    consuming: HashSet<String>,
}

impl RedisConnection {
    async fn heartbeat(&mut self, queue: &str) -> QueueResult<()> {
        let _: () = redis::pipe()
            .atomic()
            .set_ex(heartbeat_key(queue, &self.id), 1, self.heartbeat_secs)
            .ignore()
            .sadd(consumers_key(queue), &self.id)
            .ignore()
            .query_async(&mut self.conn)
            .await
            .map_err(broker_err)?;
        self.consuming.insert(queue.to_string());
        Ok(())
    }

    async fn deregister(&mut self, queue: &str) -> QueueResult<()> {
        let _: () = redis::pipe()
            .atomic()
            .del(heartbeat_key(queue, &self.id))
            .ignore()
            .srem(consumers_key(queue), &self.id)
            .ignore()
            .query_async(&mut self.conn)
            .await
            .map_err(broker_err)?;
        Ok(())
    }

    async fn queue_info(&mut self, name: &str, durable: bool) -> QueueResult<QueueInfo> {
        let message_count: u64 = self.conn.llen(name).await.map_err(broker_err)?;
        Ok(QueueInfo {
            name: name.to_string(),
            durable,
            message_count,
        })
    }

    async fn settle(&mut self, tag: &DeliveryTag, requeue: bool) -> QueueResult<()> {
        let entry = self
            .unacked
            .remove(tag.as_str())
            .ok_or_else(|| QueueError::Broker(format!("unknown delivery tag {}", tag)))?;

        let mut pipe = redis::pipe();
        pipe.atomic().lrem(&entry.processing, 1, &entry.body).ignore();
        if requeue {
            // The consume end is the tail
            pipe.rpush(&entry.queue, &entry.body).ignore();
        }
        let _: () = pipe.query_async(&mut self.conn).await.map_err(broker_err)?;
        Ok(())
    }
}

#[async_trait]
impl BrokerConnection for RedisConnection {
    async fn declare_queue(&mut self, name: &str, durable: bool) -> QueueResult<QueueInfo> {
        let key = meta_key(name);
        let existing: Option<String> = self.conn.hget(&key, "durable").await.map_err(broker_err)?;

        match existing {
            Some(flag) if flag != durable.to_string() => {
                return Err(QueueError::IncompatibleQueue(format!(
                    "'{}' exists with durable={}, requested durable={}",
                    name, flag, durable
                )));
            }
            Some(_) => {}
            None => {
                let _: () = self
                    .conn
                    .hset(&key, "durable", durable.to_string())
                    .await
                    .map_err(broker_err)?;
            }
        }

        self.queue_info(name, durable).await
    }

    async fn declare_queue_passive(&mut self, name: &str) -> QueueResult<QueueInfo> {
        let flag: Option<String> = self
            .conn
            .hget(meta_key(name), "durable")
            .await
            .map_err(broker_err)?;
        let Some(flag) = flag else {
            return Err(QueueError::Broker(format!("no queue '{}'", name)));
        };
        self.queue_info(name, flag == "true").await
    }

    async fn publish(
        &mut self,
        queue: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> QueueResult<()> {
        // Durability is a server setting (AOF/RDB) in Redis
        let _: () = self.conn.lpush(queue, body).await.map_err(broker_err)?;
        debug!(queue, message_id = %properties.message_id, "published to redis");
        Ok(())
    }

    async fn next_delivery(
        &mut self,
        queue: &str,
        prefetch: u16,
        wait: Duration,
    ) -> QueueResult<Option<Delivery>> {
        let in_flight = self.unacked.values().filter(|u| u.queue == queue).count();
        if prefetch > 0 && in_flight >= prefetch as usize {
            return Ok(None);
        }

        self.heartbeat(queue).await?;
        let processing = processing_key(queue, &self.id);
        // BLMOVE with a zero timeout would block forever
        let timeout = wait.as_secs_f64().max(0.1);
        let body: Option<Vec<u8>> = redis::cmd("BLMOVE")
            .arg(queue)
            .arg(&processing)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(timeout)
            .query_async(&mut self.conn)
            .await
            .map_err(broker_err)?;

        let Some(body) = body else {
            return Ok(None);
        };

        let tag = DeliveryTag::from(self.next_tag);
        self.next_tag += 1;
        self.unacked.insert(
            tag.0.clone(),
            Unacked {
                queue: queue.to_string(),
                processing,
                body: body.clone(),
            },
        );

        Ok(Some(Delivery {
            tag,
            body,
            redelivered: false,
        }))
    }

    async fn ack(&mut self, tag: &DeliveryTag) -> QueueResult<()> {
        self.settle(tag, false).await
    }

    async fn nack(&mut self, tag: &DeliveryTag, requeue: bool) -> QueueResult<()> {
        self.settle(tag, requeue).await
    }

    async fn purge(&mut self, queue: &str) -> QueueResult<u64> {
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .llen(queue)
            .del(queue)
            .ignore()
            .query_async(&mut self.conn)
            .await
            .map_err(broker_err)?;
        Ok(count)
    }

    async fn recover_orphans(&mut self, queue: &str) -> QueueResult<u64> {
        let members: Vec<String> = self
            .conn
            .smembers(consumers_key(queue))
            .await
            .map_err(broker_err)?;

        let mut recovered = 0;
        for id in members {
            if id == self.id {
                continue;
            }
            let alive: bool = self
                .conn
                .exists(heartbeat_key(queue, &id))
                .await
                .map_err(broker_err)?;
            if alive {
                continue;
            }

            // Newest first onto the consume end keeps the oldest in front
            let processing = processing_key(queue, &id);
            loop {
                let moved: Option<Vec<u8>> = redis::cmd("LMOVE")
                    .arg(&processing)
                    .arg(queue)
                    .arg("LEFT")
                    .arg("RIGHT")
                    .query_async(&mut self.conn)
                    .await
                    .map_err(broker_err)?;
                if moved.is_none() {
                    break;
                }
                recovered += 1;
            }
            let _: () = self
                .conn
                .srem(consumers_key(queue), &id)
                .await
                .map_err(broker_err)?;
            debug!(queue, consumer = %id, "Cleared dead consumer");
        }
        Ok(recovered)
    }

    async fn close(&mut self) -> QueueResult<()> {
        let tags: Vec<String> = self.unacked.keys().cloned().collect();
        for tag in tags {
            if let Err(e) = self.settle(&DeliveryTag(tag), true).await {
                warn!("Failed to return unacked delivery on close: {}", e);
            }
        }
        let queues: Vec<String> = self.consuming.drain().collect();
        for queue in queues {
            if let Err(e) = self.deregister(&queue).await {
                warn!(queue, "Failed to deregister consumer on close: {}", e);
            }
        }
        Ok(())
    }
}
