//! Dispatch bridge: broker consumer feeding a bounded pool of executor workers.
//!
//! The consumer never runs executor work. It pushes each decoded message onto
//! an in-process queue and acks right away, so a slow submission cannot stall
//! the broker connection. Failed submissions are redelivered by republishing
//! with a bumped `retry_count`.
//!
//! Every executor call, whether it comes from a pool worker or from
//! [`DispatchBridge::execute_direct`], holds a permit of one shared semaphore
//! sized to the pool, so at most N submissions run at once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::{Broker, BrokerConnection};
use crate::client::{DeliveryHandler, QueueClient};
use crate::config::{BridgeConfig, MAX_WORKERS};
use crate::error::ExecutorError;
use crate::executor::{run_blocking, Executor};
use crate::recoverer::Recoverer;
use crate::observability::ObservabilityLayer;
use crate::stats::{Stats, StatsSnapshot};
use crate::types::{JobRecord, JobStatus, QueueMessage};
use crate::{QueueError, QueueResult};

type WorkReceiver = Arc<Mutex<mpsc::UnboundedReceiver<QueueMessage>>>;

/// Everything a worker needs, shared by the whole pool
struct WorkerContext<B: Broker> {
    client: Arc<QueueClient<B>>,
    executor: Arc<dyn Executor>,
    config: BridgeConfig,
    stats: Arc<Stats>,
    /// Delayed republishes waiting out their backoff
    retries: parking_lot::Mutex<JoinSet<()>>,
    /// Executor slots shared by workers and direct execution
    permits: Arc<Semaphore>,
    /// Permits `permits` was sized to; only changed under the pool lock
    capacity: Arc<AtomicUsize>,
}

/// Consumer-side handler: enqueue locally, then ack
struct Intake {
    tx: mpsc::UnboundedSender<QueueMessage>,
    depth: Arc<AtomicUsize>,
    config: BridgeConfig,
    shutdown: CancellationToken,
    observability: ObservabilityLayer,
}

#[async_trait]
impl DeliveryHandler for Intake {
    async fn handle(&self, message: QueueMessage) -> QueueResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::WorkerShutdown);
        }

        self.observability.record_delivered(&message);
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if self.tx.send(message).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueError::WorkerShutdown);
        }

        if depth >= self.config.high_water {
            warn!(
                depth,
                low_water = self.config.low_water,
                "Work queue full, pausing consumption"
            );
            while self.depth.load(Ordering::SeqCst) > self.config.low_water
                && !self.shutdown.is_cancelled()
            {
                tokio::time::sleep(self.config.flow_poll).await;
            }
            info!("Work queue drained, resuming consumption");
        }
        Ok(())
    }
}

struct WorkerPool {
    size: usize,
    shutdown: CancellationToken,
    consumer: JoinHandle<QueueResult<()>>,
    recoverer: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    work_rx: WorkReceiver,
    depth: Arc<AtomicUsize>,
}

/// Connects the broker queue to a pool of executor workers
pub struct DispatchBridge<B: Broker> {
    ctx: Arc<WorkerContext<B>>,
    prefetch: u16,
    pool: Mutex<Option<WorkerPool>>,
}

impl<B: Broker> DispatchBridge<B> {
    pub fn new(client: Arc<QueueClient<B>>, executor: Arc<dyn Executor>, config: BridgeConfig) -> Self {
        let prefetch = client.config().prefetch;
        let capacity = config.workers.clamp(1, MAX_WORKERS);
        Self {
            ctx: Arc::new(WorkerContext {
                client,
                executor,
                config,
                stats: Arc::new(Stats::new()),
                retries: parking_lot::Mutex::new(JoinSet::new()),
                permits: Arc::new(Semaphore::new(capacity)),
                capacity: Arc::new(AtomicUsize::new(capacity)),
            }),
            prefetch,
            pool: Mutex::new(None),
        }
    }

    /// Share an existing stats aggregator
    pub fn with_stats(self, stats: Arc<Stats>) -> Self {
        let ctx = WorkerContext {
            client: self.ctx.client.clone(),
            executor: self.ctx.executor.clone(),
            config: self.ctx.config.clone(),
            stats,
            retries: parking_lot::Mutex::new(JoinSet::new()),
            permits: self.ctx.permits.clone(),
            capacity: self.ctx.capacity.clone(),
        };
        Self {
            ctx: Arc::new(ctx),
            prefetch: self.prefetch,
            pool: self.pool,
        }
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.ctx.stats
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    pub fn client(&self) -> &Arc<QueueClient<B>> {
        &self.ctx.client
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.ctx.config
    }

    pub async fn is_running(&self) -> bool {
        self.pool.lock().await.is_some()
    }

    /// Executor calls allowed to run at once
    pub fn concurrency_limit(&self) -> usize {
        self.ctx.capacity.load(Ordering::SeqCst)
    }

    /// Workers in the running pool, 0 when stopped
    pub async fn worker_count(&self) -> usize {
        self.pool.lock().await.as_ref().map_or(0, |pool| pool.size)
    }

    /// Messages acked but not yet picked up by a worker
    pub async fn work_queue_depth(&self) -> usize {
        self.pool
            .lock()
            .await
            .as_ref()
            .map_or(0, |pool| pool.depth.load(Ordering::SeqCst))
    }

    /// Start `workers` workers (clamped to 1..=5) plus the consumer.
    ///
    /// Connects eagerly so an unreachable broker is reported here. Returns the
    /// effective pool size.
    #[instrument(skip(self))]
    pub async fn start_worker_pool(&self, workers: usize) -> QueueResult<usize> {
        let mut pool = self.pool.lock().await;
        if let Some(running) = pool.as_ref() {
            warn!(size = running.size, "Worker pool already running");
            return Ok(running.size);
        }

        let size = workers.clamp(1, MAX_WORKERS);
        if size != workers {
            warn!(requested = workers, size, "Worker count clamped");
        }

        let mut conn = self.ctx.client.connect().await?;
        let _ = conn.close().await;
        self.resize_limit(size).await;

        let shutdown = CancellationToken::new();
        let depth = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        let work_rx: WorkReceiver = Arc::new(Mutex::new(rx));

        let handles = (0..size)
            .map(|id| {
                let ctx = self.ctx.clone();
                let rx = work_rx.clone();
                let depth = depth.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { ctx.run_worker(id, rx, depth, shutdown).await })
            })
            .collect();

        let intake = Intake {
            tx,
            depth: depth.clone(),
            config: self.ctx.config.clone(),
            shutdown: shutdown.clone(),
            observability: self.ctx.client.observability().clone(),
        };
        let client = self.ctx.client.clone();
        let prefetch = self.prefetch;
        let consumer_shutdown = shutdown.clone();
        let consumer =
            tokio::spawn(async move { client.consume(&intake, prefetch, consumer_shutdown).await });
        let recoverer = Recoverer::new(
            self.ctx.client.clone(),
            self.ctx.client.config().recover_interval,
        )
        .spawn(shutdown.clone());

        info!(size, queue = self.ctx.client.queue_name(), "Worker pool started");
        *pool = Some(WorkerPool {
            size,
            shutdown,
            consumer,
            recoverer,
            workers: handles,
            work_rx,
            depth,
        });
        Ok(size)
    }

    /// Stop the consumer and the workers.
    ///
    /// In-flight submissions finish first. Messages still in the local queue
    /// were already acked, so they are published back to the broker. Returns
    /// how many were returned that way.
    #[instrument(skip(self))]
    pub async fn stop_worker_pool(&self) -> QueueResult<usize> {
        let Some(pool) = self.pool.lock().await.take() else {
            return Ok(0);
        };

        info!(size = pool.size, "Stopping worker pool");
        pool.shutdown.cancel();

        match pool.consumer.await {
            Ok(Err(e)) => warn!("Consumer ended with error: {}", e),
            Err(e) => error!("Consumer task failed: {}", e),
            Ok(Ok(())) => {}
        }
        for worker in pool.workers {
            if let Err(e) = worker.await {
                error!("Worker task failed: {}", e);
            }
        }
        if let Err(e) = pool.recoverer.await {
            error!("Recoverer task failed: {}", e);
        }

        // Pending retries skip the rest of their backoff on shutdown
        let mut retries = std::mem::take(&mut *self.ctx.retries.lock());
        while let Some(result) = retries.join_next().await {
            if let Err(e) = result {
                error!("Retry task failed: {}", e);
            }
        }

        let mut returned = 0;
        let mut rx = pool.work_rx.lock().await;
        while let Ok(message) = rx.try_recv() {
            match self.ctx.client.publish_detached(&message).await {
                Ok(()) => returned += 1,
                Err(e) => error!(row_id = message.row_id(), "Could not return message to broker: {}", e),
            }
        }

        if returned > 0 {
            info!(returned, "Returned undispatched messages to the broker");
        }
        info!("Worker pool stopped");
        Ok(returned)
    }

    /// Grow or shrink the executor semaphore to `size` permits.
    ///
    /// Shrinking waits for in-flight calls to hand their permits back.
    async fn resize_limit(&self, size: usize) {
        let current = self.ctx.capacity.load(Ordering::SeqCst);
        if size > current {
            self.ctx.permits.add_permits(size - current);
        } else if size < current {
            match self.ctx.permits.acquire_many((current - size) as u32).await {
                Ok(surplus) => surplus.forget(),
                Err(e) => {
                    warn!("Could not shrink executor limit: {}", e);
                    return;
                }
            }
        }
        self.ctx.capacity.store(size, Ordering::SeqCst);
    }

    /// Drop everything waiting in the broker queue
    pub async fn purge_pending(&self) -> QueueResult<u64> {
        self.ctx.client.purge().await
    }

    /// Run one record through the executor in-process, without the broker.
    ///
    /// Counts toward stats like a broker delivery but is never retried. Shares
    /// the pool's concurrency limit. A call stopped by `cancel` is not a
    /// failure and leaves stats alone.
    pub async fn execute_direct(
        &self,
        mut record: JobRecord,
        cancel: CancellationToken,
    ) -> Result<(), ExecutorError> {
        let row_id = record.row_id;
        if let Err(e) = record.transition(JobStatus::Processing) {
            debug!(row_id, "{}", e);
        }

        let result = self.ctx.run_limited(record, &cancel).await;
        match &result {
            Ok(()) => {
                self.ctx.stats.record_success();
                info!(row_id, "Row submitted");
            }
            Err(ExecutorError::Cancelled) if cancel.is_cancelled() => {
                info!(row_id, "Row cancelled before completion");
            }
            Err(e) => {
                self.ctx.stats.record_failure();
                warn!(row_id, "Row failed: {}", e);
            }
        }
        result
    }
}

impl<B: Broker> WorkerContext<B> {
    /// Run one submission once an executor permit is free
    async fn run_limited(
        &self,
        record: JobRecord,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
            permit = self.permits.acquire() => permit,
        };
        let _permit = permit.map_err(|_| ExecutorError::Cancelled)?;
        run_blocking(self.executor.clone(), record, cancel.clone()).await
    }

    async fn run_worker(
        self: Arc<Self>,
        id: usize,
        rx: WorkReceiver,
        depth: Arc<AtomicUsize>,
        shutdown: CancellationToken,
    ) {
        debug!(worker = id, "Worker started");
        loop {
            let next = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => None,
                    message = rx.recv() => message,
                }
            };
            let Some(message) = next else {
                break;
            };
            depth.fetch_sub(1, Ordering::SeqCst);

            if shutdown.is_cancelled() {
                if let Err(e) = self.client.publish_detached(&message).await {
                    error!(row_id = message.row_id(), "Could not return message to broker: {}", e);
                }
                break;
            }

            self.process(id, message, &shutdown).await;
        }
        debug!(worker = id, "Worker stopped");
    }

    #[instrument(skip(self, message, shutdown), fields(row_id = message.row_id(), retry_count = message.retry_count))]
    async fn process(self: &Arc<Self>, worker: usize, mut message: QueueMessage, shutdown: &CancellationToken) {
        let row_id = message.row_id();
        if let Err(e) = message.record.transition(JobStatus::Processing) {
            debug!("{}", e);
            message.record.status = JobStatus::Processing;
        }

        let started = Instant::now();
        let outcome = self
            .run_limited(message.record.clone(), &shutdown.child_token())
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            // Stopped by the pool shutting down: hand the message back as it was
            Err(ExecutorError::Cancelled) if shutdown.is_cancelled() => {
                message.record.status = JobStatus::Enqueued;
                info!(worker, elapsed_ms, "Job interrupted by shutdown, returning to broker");
                if let Err(e) = self.client.publish_detached(&message).await {
                    self.stats.record_failure();
                    error!("Could not return interrupted job to broker: {}", e);
                }
            }
            Ok(()) => {
                message.record.status = JobStatus::Succeeded;
                self.stats.record_success();
                self.client.observability().record_succeeded(&message);
                info!(worker, elapsed_ms, "Job succeeded");
            }
            Err(e) => {
                message.record.status = JobStatus::Failed;
                let reason = e.to_string();
                if message.can_retry() {
                    self.schedule_retry(message.next_attempt(), reason, shutdown);
                } else {
                    self.stats.record_failure();
                    self.client.observability().record_failed(&message, &reason);
                    error!(worker, elapsed_ms, "Job failed permanently: {}", reason);
                }
            }
        }
    }

    /// Republish `next` after its backoff; not a terminal outcome
    fn schedule_retry(self: &Arc<Self>, next: QueueMessage, reason: String, shutdown: &CancellationToken) {
        let backoff = self.config.retry_backoff(next.retry_count);
        warn!(
            row_id = next.row_id(),
            retry_count = next.retry_count,
            max_retries = next.max_retries,
            "Job failed, retrying in {:?}: {}",
            backoff,
            reason
        );
        self.client.observability().record_retrying(&next, &reason);

        let ctx = self.clone();
        let shutdown = shutdown.clone();
        let mut retries = self.retries.lock();
        while retries.try_join_next().is_some() {}
        retries.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(backoff) => {}
            }
            // publish_detached already emitted the terminal PublishFailed event
            if let Err(e) = ctx.client.publish_detached(&next).await {
                ctx.stats.record_failure();
                error!(row_id = next.row_id(), "Retry could not be published: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::BrokerConfig;
    use crate::executor::FnExecutor;
    use crate::types::{JobEvent, Payload};
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::time::Duration;

    fn client(broker: &MemoryBroker) -> Arc<QueueClient<MemoryBroker>> {
        Arc::new(QueueClient::new(
            broker.clone(),
            BrokerConfig {
                queue: "jobs".to_string(),
                ..Default::default()
            },
        ))
    }

    fn message(row_id: u64, max_retries: u32) -> QueueMessage {
        QueueMessage::new(JobRecord::new(row_id, Payload::new()), max_retries)
    }

    async fn wait_for_processed(bridge: &DispatchBridge<MemoryBroker>, n: u64) {
        while bridge.stats().processed() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_counts_once() {
        let broker = MemoryBroker::new();
        let client = client(&broker);
        let executor = Arc::new(FnExecutor::new(|_, _| Ok(true)));
        let bridge = DispatchBridge::new(client.clone(), executor, BridgeConfig::default());

        assert_eq!(bridge.start_worker_pool(2).await.unwrap(), 2);
        client.publish(&message(1, 3)).await.unwrap();
        wait_for_processed(&bridge, 1).await;
        bridge.stop_worker_pool().await.unwrap();

        let snapshot = bridge.stats_snapshot();
        assert_eq!(snapshot.succeeded, 1);
        assert_eq!(snapshot.success_rate, Some(100.0));
        assert_eq!(broker.ready_count("jobs"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_retried_with_backoff() {
        let broker = MemoryBroker::new();
        let client = client(&broker);
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let executor = Arc::new(FnExecutor::new(move |_, _| {
            Ok(seen.fetch_add(1, Ordering::SeqCst) > 0)
        }));
        let bridge = DispatchBridge::new(client.clone(), executor, BridgeConfig::default());
        let mut events = client.observability().subscribe();

        bridge.start_worker_pool(1).await.unwrap();
        client.publish(&message(7, 3)).await.unwrap();
        wait_for_processed(&bridge, 1).await;
        bridge.stop_worker_pool().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let snapshot = bridge.stats_snapshot();
        assert_eq!((snapshot.processed, snapshot.succeeded, snapshot.failed), (1, 1, 0));

        let mut retried = false;
        while let Ok(event) = events.try_recv() {
            if let JobEvent::Retrying { retry_count, .. } = event {
                assert_eq!(retry_count, 1);
                retried = true;
            }
        }
        assert!(retried);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_once() {
        let broker = MemoryBroker::new();
        let client = client(&broker);
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let executor = Arc::new(FnExecutor::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Err(ExecutorError::failed("field not found"))
        }));
        let bridge = DispatchBridge::new(client.clone(), executor, BridgeConfig::default());

        bridge.start_worker_pool(1).await.unwrap();
        client.publish(&message(3, 2)).await.unwrap();
        wait_for_processed(&bridge, 1).await;
        bridge.stop_worker_pool().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let snapshot = bridge.stats_snapshot();
        assert_eq!((snapshot.processed, snapshot.failed), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_executor_does_not_kill_worker() {
        let broker = MemoryBroker::new();
        let client = client(&broker);
        let executor = Arc::new(FnExecutor::new(|record: &JobRecord, _: &CancellationToken| {
            if record.row_id == 1 {
                panic!("boom");
            }
            Ok(true)
        }));
        let bridge = DispatchBridge::new(client.clone(), executor, BridgeConfig::default());

        bridge.start_worker_pool(1).await.unwrap();
        client.publish(&message(1, 0)).await.unwrap();
        client.publish(&message(2, 0)).await.unwrap();
        wait_for_processed(&bridge, 2).await;
        bridge.stop_worker_pool().await.unwrap();

        let snapshot = bridge.stats_snapshot();
        assert_eq!((snapshot.succeeded, snapshot.failed), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_reports_unreachable_broker() {
        let broker = MemoryBroker::new();
        broker.fail_next_opens(100);
        let bridge = DispatchBridge::new(
            client(&broker),
            Arc::new(FnExecutor::new(|_, _| Ok(true))),
            BridgeConfig::default(),
        );

        assert!(matches!(
            bridge.start_worker_pool(1).await,
            Err(QueueError::Connection { .. })
        ));
        assert!(!bridge.is_running().await);
    }

    #[tokio::test]
    async fn test_worker_count_is_clamped() {
        let broker = MemoryBroker::new();
        let bridge = DispatchBridge::new(
            client(&broker),
            Arc::new(FnExecutor::new(|_, _| Ok(true))),
            BridgeConfig::default(),
        );

        assert_eq!(bridge.start_worker_pool(12).await.unwrap(), MAX_WORKERS);
        assert_eq!(bridge.worker_count().await, MAX_WORKERS);
        bridge.stop_worker_pool().await.unwrap();

        assert_eq!(bridge.start_worker_pool(0).await.unwrap(), 1);
        bridge.stop_worker_pool().await.unwrap();
        assert_eq!(bridge.worker_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_returns_undispatched_messages() {
        let broker = MemoryBroker::new();
        let client = client(&broker);
        let release = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicU32::new(0));
        let (gate, seen) = (release.clone(), calls.clone());
        let executor = Arc::new(FnExecutor::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            while !gate.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(true)
        }));
        let bridge = Arc::new(DispatchBridge::new(client.clone(), executor, BridgeConfig::default()));

        bridge.start_worker_pool(1).await.unwrap();
        for row_id in 1..=3 {
            client.publish(&message(row_id, 3)).await.unwrap();
        }
        while bridge.work_queue_depth().await < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let stopping = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.stop_worker_pool().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        release.store(true, Ordering::SeqCst);

        assert_eq!(stopping.await.unwrap().unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.stats().succeeded(), 1);
        assert_eq!(broker.ready_count("jobs"), 2);
    }

    #[tokio::test]
    async fn test_flow_control_pauses_intake() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let intake = Arc::new(Intake {
            tx,
            depth: depth.clone(),
            config: BridgeConfig {
                high_water: 3,
                low_water: 1,
                flow_poll: Duration::from_millis(5),
                ..Default::default()
            },
            shutdown: CancellationToken::new(),
            observability: ObservabilityLayer::new(),
        });

        intake.handle(message(1, 0)).await.unwrap();
        intake.handle(message(2, 0)).await.unwrap();

        let blocked = {
            let intake = intake.clone();
            tokio::spawn(async move { intake.handle(message(3, 0)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!blocked.is_finished());
        assert_eq!(depth.load(Ordering::SeqCst), 3);

        // Simulate two workers taking messages
        for _ in 0..2 {
            rx.recv().await.unwrap();
            depth.fetch_sub(1, Ordering::SeqCst);
        }
        blocked.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_pool_size_sets_executor_limit() {
        let broker = MemoryBroker::new();
        let bridge = DispatchBridge::new(
            client(&broker),
            Arc::new(FnExecutor::new(|_, _| Ok(true))),
            BridgeConfig {
                workers: 3,
                ..Default::default()
            },
        );
        assert_eq!(bridge.concurrency_limit(), 3);

        bridge.start_worker_pool(1).await.unwrap();
        assert_eq!(bridge.concurrency_limit(), 1);
        bridge.stop_worker_pool().await.unwrap();

        bridge.start_worker_pool(4).await.unwrap();
        assert_eq!(bridge.concurrency_limit(), 4);
        bridge.stop_worker_pool().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_returns_interrupted_job_unchanged() {
        let broker = MemoryBroker::new();
        let client = client(&broker);
        let started = Arc::new(AtomicBool::new(false));
        let flag = started.clone();
        let executor = Arc::new(FnExecutor::new(move |_, cancel: &CancellationToken| {
            flag.store(true, Ordering::SeqCst);
            while !cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(ExecutorError::Cancelled)
        }));
        let bridge = DispatchBridge::new(
            client.clone(),
            executor,
            BridgeConfig {
                max_retries: 0,
                ..Default::default()
            },
        );
        let mut events = client.observability().subscribe();

        bridge.start_worker_pool(1).await.unwrap();
        client.publish(&message(5, 0)).await.unwrap();
        while !started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        bridge.stop_worker_pool().await.unwrap();

        let snapshot = bridge.stats_snapshot();
        assert_eq!((snapshot.processed, snapshot.failed), (0, 0));
        assert_eq!(broker.ready_count("jobs"), 1);
        while let Ok(event) = events.try_recv() {
            assert!(!event.is_terminal(), "unexpected {}", event.event_name());
            assert!(!matches!(event, JobEvent::Retrying { .. }));
        }

        let returned = broker.published().pop().unwrap();
        let message: QueueMessage = serde_json::from_slice(&returned.body).unwrap();
        assert_eq!(message.row_id(), 5);
        assert_eq!(message.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpublishable_retry_is_one_terminal_outcome() {
        let broker = MemoryBroker::new();
        let client = client(&broker);
        let executor = Arc::new(FnExecutor::new(|_, _| Ok(false)));
        let bridge = DispatchBridge::new(client.clone(), executor, BridgeConfig::default());
        let mut events = client.observability().subscribe();

        bridge.start_worker_pool(1).await.unwrap();
        client.publish(&message(9, 1)).await.unwrap();
        loop {
            if let JobEvent::Retrying { .. } = events.recv().await.unwrap() {
                broker.fail_next_publishes(3);
                break;
            }
        }
        wait_for_processed(&bridge, 1).await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        bridge.stop_worker_pool().await.unwrap();

        let mut terminal = Vec::new();
        while let Ok(event) = events.try_recv() {
            if event.is_terminal() {
                terminal.push(event.event_name());
            }
        }
        assert_eq!(terminal, vec!["publish_failed"]);
        let snapshot = bridge.stats_snapshot();
        assert_eq!((snapshot.processed, snapshot.failed), (1, 1));
    }
}
