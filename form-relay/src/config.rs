//! Relay configuration.
//!
//! Values live in a flat string store keyed like `bridge.workers`. Environment
//! variables override the defaults:
//!
//! ```bash
//! export FORM_RELAY__BRIDGE__WORKERS=3
//! export FORM_RELAY__SCHEDULER__TIMEZONE=Europe/Berlin
//! ```
//!
//! Durations use a `_ms` or `_secs` suffix in the key.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

use crate::{QueueError, QueueResult};

/// Default environment prefix
pub const ENV_PREFIX: &str = "FORM_RELAY__";

/// Largest worker pool the bridge will start
pub const MAX_WORKERS: usize = 5;

/// Flat string key/value configuration store
#[derive(Debug, Default, Clone)]
pub struct ConfigStore {
    values: HashMap<String, String>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect every variable starting with `prefix`.
    ///
    /// `FORM_RELAY__BRIDGE__WORKERS` becomes `bridge.workers`.
    pub fn from_env(prefix: &str) -> Self {
        Self::from_vars(prefix, std::env::vars())
    }

    pub fn from_vars<I>(prefix: &str, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut store = Self::new();
        for (key, value) in vars {
            if let Some(stripped) = key.strip_prefix(prefix) {
                let normalized = stripped.to_lowercase().replace("__", ".");
                store.set(normalized, value);
            }
        }
        store
    }

    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Parse `key` if present; a present but unparseable value is an error
    pub fn parse<T: FromStr>(&self, key: &str) -> QueueResult<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
                QueueError::Config(format!("invalid value '{}' for {}", raw, key))
            }),
        }
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).map(str::to_string)
    }

    pub fn get_millis(&self, key: &str) -> QueueResult<Option<Duration>> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }

    pub fn get_secs(&self, key: &str) -> QueueResult<Option<Duration>> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_secs))
    }
}

/// Broker connection and delivery settings
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub url: String,
    pub queue: String,
    pub durable: bool,
    /// Connect attempts before giving up
    pub connect_attempts: u32,
    pub connect_backoff_base: Duration,
    pub connect_backoff_cap: Duration,
    /// Publish attempts before a `PublishError`
    pub publish_retries: u32,
    /// Fixed pause before the consumer reconnects
    pub reconnect_delay: Duration,
    pub prefetch: u16,
    /// How long one `next_delivery` call may block
    pub consume_wait: Duration,
    /// How often the pool sweeps deliveries stranded by dead consumers
    pub recover_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            queue: "google_forms_jobs".to_string(),
            durable: true,
            connect_attempts: 5,
            connect_backoff_base: Duration::from_secs(1),
            connect_backoff_cap: Duration::from_secs(30),
            publish_retries: 3,
            reconnect_delay: Duration::from_secs(5),
            prefetch: 1,
            consume_wait: Duration::from_secs(1),
            recover_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// IANA zone used to interpret ETAs and compute "now"
    pub timezone: String,
    /// Minimal non-zero delay before an immediate publish
    pub immediate_delay: Duration,
}

impl SchedulerConfig {
    pub fn tz(&self) -> QueueResult<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| QueueError::Config(format!("unknown timezone '{}'", self.timezone)))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: "Asia/Jakarta".to_string(),
            immediate_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub workers: usize,
    pub max_retries: u32,
    pub retry_backoff_base: Duration,
    pub retry_backoff_cap: Duration,
    /// Work queue depth at which the consumer stops pulling
    pub high_water: usize,
    /// Depth at which it resumes
    pub low_water: usize,
    pub flow_poll: Duration,
}

impl BridgeConfig {
    /// Delay before republishing after the `retry_count`-th failure
    pub fn retry_backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.retry_backoff_base
            .checked_mul(factor)
            .unwrap_or(self.retry_backoff_cap)
            .min(self.retry_backoff_cap)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            max_retries: 3,
            retry_backoff_base: Duration::from_secs(30),
            retry_backoff_cap: Duration::from_secs(300),
            high_water: 1000,
            low_water: 100,
            flow_poll: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Terminal jobs older than this are evicted
    pub retention: Duration,
    pub sweep_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(10 * 60),
        }
    }
}

/// Complete relay configuration
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    pub broker: BrokerConfig,
    pub scheduler: SchedulerConfig,
    pub bridge: BridgeConfig,
    pub tracker: TrackerConfig,
}

impl RelayConfig {
    /// Defaults overridden by `<prefix>SECTION__KEY` environment variables
    pub fn from_env(prefix: &str) -> QueueResult<Self> {
        Self::from_store(&ConfigStore::from_env(prefix))
    }

    pub fn from_store(store: &ConfigStore) -> QueueResult<Self> {
        let mut config = Self::default();

        let b = &mut config.broker;
        if let Some(v) = store.get_string("broker.url") {
            b.url = v;
        }
        if let Some(v) = store.get_string("broker.queue") {
            b.queue = v;
        }
        if let Some(v) = store.parse("broker.durable")? {
            b.durable = v;
        }
        if let Some(v) = store.parse("broker.connect_attempts")? {
            b.connect_attempts = v;
        }
        if let Some(v) = store.get_millis("broker.connect_backoff_base_ms")? {
            b.connect_backoff_base = v;
        }
        if let Some(v) = store.get_millis("broker.connect_backoff_cap_ms")? {
            b.connect_backoff_cap = v;
        }
        if let Some(v) = store.parse("broker.publish_retries")? {
            b.publish_retries = v;
        }
        if let Some(v) = store.get_millis("broker.reconnect_delay_ms")? {
            b.reconnect_delay = v;
        }
        if let Some(v) = store.parse("broker.prefetch")? {
            b.prefetch = v;
        }
        if let Some(v) = store.get_secs("broker.recover_interval_secs")? {
            b.recover_interval = v;
        }

        let s = &mut config.scheduler;
        if let Some(v) = store.get_string("scheduler.timezone") {
            s.timezone = v;
        }
        if let Some(v) = store.get_millis("scheduler.immediate_delay_ms")? {
            s.immediate_delay = v;
        }

        let w = &mut config.bridge;
        if let Some(v) = store.parse("bridge.workers")? {
            w.workers = v;
        }
        if let Some(v) = store.parse("bridge.max_retries")? {
            w.max_retries = v;
        }
        if let Some(v) = store.get_secs("bridge.retry_backoff_base_secs")? {
            w.retry_backoff_base = v;
        }
        if let Some(v) = store.get_secs("bridge.retry_backoff_cap_secs")? {
            w.retry_backoff_cap = v;
        }
        if let Some(v) = store.parse("bridge.high_water")? {
            w.high_water = v;
        }
        if let Some(v) = store.parse("bridge.low_water")? {
            w.low_water = v;
        }

        let t = &mut config.tracker;
        if let Some(v) = store.get_secs("tracker.retention_secs")? {
            t.retention = v;
        }
        if let Some(v) = store.get_secs("tracker.sweep_interval_secs")? {
            t.sweep_interval = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> QueueResult<()> {
        if !(1..=MAX_WORKERS).contains(&self.bridge.workers) {
            return Err(QueueError::Config(format!(
                "bridge.workers must be between 1 and {}, got {}",
                MAX_WORKERS, self.bridge.workers
            )));
        }
        if self.bridge.low_water >= self.bridge.high_water {
            return Err(QueueError::Config(format!(
                "bridge.low_water ({}) must be below bridge.high_water ({})",
                self.bridge.low_water, self.bridge.high_water
            )));
        }
        if self.broker.connect_attempts == 0 {
            return Err(QueueError::Config("broker.connect_attempts must be at least 1".into()));
        }
        if self.broker.publish_retries == 0 {
            return Err(QueueError::Config("broker.publish_retries must be at least 1".into()));
        }
        if self.broker.recover_interval.is_zero() {
            return Err(QueueError::Config("broker.recover_interval must be positive".into()));
        }
        if self.broker.queue.is_empty() {
            return Err(QueueError::Config("broker.queue must not be empty".into()));
        }
        self.scheduler.tz()?;
        Ok(())
    }
}
