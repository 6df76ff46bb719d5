//! Configuration for the sync engine.
//!
//! [`SyncConfig`] is plain data and loads from JSON. [`ConfigHandle`]
//! publishes updates to running components; each sync run takes a
//! snapshot when it starts and keeps it until it ends.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use wayfare_sync_protocol::{ConflictStrategy, EntityType, RouteId};

/// Which route the engine talks to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "route")]
pub enum RoutePreference {
    /// Pick the healthiest route.
    #[default]
    Automatic,
    /// Always use this route; sync waits while it is unavailable.
    Pinned(RouteId),
}

/// Configuration for sync operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Period of the scheduler's timer trigger.
    #[serde(with = "millis")]
    pub sync_interval: Duration,
    /// Retry behaviour of queued uploads.
    pub retry: RetryConfig,
    /// Conflict strategy for automatic resolution.
    pub conflict_strategy: ConflictStrategy,
    /// Route selection mode.
    pub route_preference: RoutePreference,
    /// Treat cellular connections as offline.
    pub wifi_only: bool,
    /// Concurrent pushes within one dependency wave.
    pub upload_concurrency: usize,
    /// Entries dequeued per upload batch.
    pub upload_batch_size: usize,
    /// Changes requested per pull page.
    pub pull_page_size: usize,
    /// Deadline for a single remote call.
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    /// Outcomes kept per route for health scoring.
    pub health_window: usize,
    /// Consecutive failures that put a route into cool-down.
    pub failure_threshold: u32,
    /// How long a demoted route waits before it is probed again.
    #[serde(with = "millis")]
    pub cool_down: Duration,
    /// Entity types pulled on each run, parents first.
    pub tracked_types: Vec<EntityType>,
    /// Ledger batches written before the ledger is compacted.
    pub compaction_threshold: usize,
}

impl SyncConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            sync_interval: Duration::from_secs(15 * 60),
            retry: RetryConfig::default(),
            conflict_strategy: ConflictStrategy::default(),
            route_preference: RoutePreference::Automatic,
            wifi_only: false,
            upload_concurrency: 4,
            upload_batch_size: 50,
            pull_page_size: 200,
            request_timeout: Duration::from_secs(30),
            health_window: 20,
            failure_threshold: 3,
            cool_down: Duration::from_secs(60),
            tracked_types: EntityType::ALL.to_vec(),
            compaction_threshold: 512,
        }
    }

    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values for consistency.
    pub fn validate(&self) -> SyncResult<()> {
        let fail = |reason: &str| Err(SyncError::Config(reason.to_string()));
        if self.upload_concurrency == 0 {
            return fail("upload_concurrency must be at least 1");
        }
        if self.upload_batch_size == 0 || self.pull_page_size == 0 {
            return fail("batch and page sizes must be at least 1");
        }
        if self.health_window == 0 {
            return fail("health_window must be at least 1");
        }
        if self.failure_threshold == 0 {
            return fail("failure_threshold must be at least 1");
        }
        if self.request_timeout.is_zero() {
            return fail("request_timeout must be positive");
        }
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be at least 1");
        }
        if self.retry.base_delay > self.retry.max_delay {
            return fail("retry.base_delay exceeds retry.max_delay");
        }
        Ok(())
    }

    /// Sets the timer interval.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the conflict strategy.
    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    /// Sets the route preference.
    pub fn with_route_preference(mut self, preference: RoutePreference) -> Self {
        self.route_preference = preference;
        self
    }

    /// Restricts sync to wifi.
    pub fn with_wifi_only(mut self, wifi_only: bool) -> Self {
        self.wifi_only = wifi_only;
        self
    }

    /// Sets the upload concurrency.
    pub fn with_upload_concurrency(mut self, concurrency: usize) -> Self {
        self.upload_concurrency = concurrency;
        self
    }

    /// Sets the upload batch size.
    pub fn with_upload_batch_size(mut self, size: usize) -> Self {
        self.upload_batch_size = size;
        self
    }

    /// Sets the pull page size.
    pub fn with_pull_page_size(mut self, size: usize) -> Self {
        self.pull_page_size = size;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the health scoring parameters.
    pub fn with_health(mut self, window: usize, failure_threshold: u32, cool_down: Duration) -> Self {
        self.health_window = window;
        self.failure_threshold = failure_threshold;
        self.cool_down = cool_down;
        self
    }

    /// Sets the pulled entity types.
    pub fn with_tracked_types(mut self, types: Vec<EntityType>) -> Self {
        self.tracked_types = types;
        self
    }

    /// Sets the ledger compaction threshold.
    pub fn with_compaction_threshold(mut self, batches: usize) -> Self {
        self.compaction_threshold = batches;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Failed attempts after which an entry stops being retried.
    pub max_attempts: u32,
    /// Base of the exponential delay.
    #[serde(with = "millis")]
    pub base_delay: Duration,
    /// Upper bound on any delay.
    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl RetryConfig {
    /// Creates a retry configuration with default delays.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(5 * 60),
        }
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before retrying an entry that failed `failures` times.
    ///
    /// Zero before the first failure, then `base * 2^failures` capped at
    /// `max_delay`.
    pub fn delay_after(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether an entry with `failures` failed attempts may be retried.
    pub fn allows(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Live configuration shared with running components.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<SyncConfig>>,
}

impl ConfigHandle {
    /// Creates a handle holding `config`.
    pub fn new(config: SyncConfig) -> Self {
        let (tx, _rx) = watch::channel(config);
        Self { tx: Arc::new(tx) }
    }

    /// Returns a copy of the current configuration.
    pub fn current(&self) -> SyncConfig {
        self.tx.borrow().clone()
    }

    /// Replaces the configuration after validating it.
    pub fn update(&self, config: SyncConfig) -> SyncResult<()> {
        config.validate()?;
        self.tx.send_replace(config);
        Ok(())
    }

    /// Subscribes to configuration changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncConfig> {
        self.tx.subscribe()
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(SyncConfig::default())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new()
            .with_upload_batch_size(25)
            .with_pull_page_size(400)
            .with_request_timeout(Duration::from_secs(5))
            .with_route_preference(RoutePreference::Pinned(RouteId::new("graphql")));

        assert_eq!(config.upload_batch_size, 25);
        assert_eq!(config.pull_page_size, 400);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let retry = RetryConfig::new(10)
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10));

        assert_eq!(retry.delay_after(0), Duration::ZERO);
        assert_eq!(retry.delay_after(1), Duration::from_secs(2));
        assert_eq!(retry.delay_after(2), Duration::from_secs(4));
        assert_eq!(retry.delay_after(3), Duration::from_secs(8));
        assert_eq!(retry.delay_after(4), Duration::from_secs(10));
        assert_eq!(retry.delay_after(31), Duration::from_secs(10));
        assert_eq!(retry.delay_after(200), Duration::from_secs(10));
    }

    #[test]
    fn backoff_is_monotonic() {
        let retry = RetryConfig::default();
        let mut previous = Duration::ZERO;
        for failures in 0..64 {
            let delay = retry.delay_after(failures);
            assert!(delay >= previous);
            assert!(delay <= retry.max_delay);
            previous = delay;
        }
    }

    #[test]
    fn loads_partial_json() {
        let config = SyncConfig::from_json(
            r#"{
                "wifi_only": true,
                "sync_interval": 60000,
                "route_preference": {"mode": "pinned", "route": "cloud"},
                "retry": {"max_attempts": 3}
            }"#,
        )
        .unwrap();

        assert!(config.wifi_only);
        assert_eq!(config.sync_interval, Duration::from_secs(60));
        assert_eq!(
            config.route_preference,
            RoutePreference::Pinned(RouteId::new("cloud"))
        );
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay, Duration::from_secs(2));
        assert_eq!(config.upload_concurrency, 4);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(SyncConfig::from_json(r#"{"upload_concurrency": 0}"#).is_err());
        assert!(SyncConfig::from_json("not json").is_err());
    }

    #[test]
    fn handle_publishes_updates() {
        let handle = ConfigHandle::default();
        let mut rx = handle.subscribe();

        handle
            .update(SyncConfig::new().with_wifi_only(true))
            .unwrap();
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().wifi_only);
        assert!(handle.current().wifi_only);

        assert!(handle
            .update(SyncConfig::new().with_upload_concurrency(0))
            .is_err());
        assert!(handle.current().wifi_only);
    }
}
