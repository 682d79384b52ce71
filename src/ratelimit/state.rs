//! Single-owner rate limiting engine.
//!
//! `LimiterState` holds every per-key record and mutates it through
//! `&mut self`. The [`RateLimiter`](super::RateLimiter) and
//! [`LimiterHandle`](super::LimiterHandle) front ends decide how callers get
//! exclusive access to it.

use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::window::{sub_duration, AttemptInfo, WindowConfig};
use crate::cache::BoundedCache;
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TurnstileError};

/// Default number of distinct keys tracked.
pub const DEFAULT_MAX_CACHE_SIZE: usize = 10_000;
/// Default growth factor for backoff.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Callback invoked with every check decision.
pub type MetricsCallback<K> = Arc<dyn Fn(&K, &RateLimitResult) + Send + Sync>;

/// Outcome of a single admission check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitResult {
    /// Whether the attempt was admitted
    pub is_allowed: bool,
    /// Attempts counted in the reporting window
    pub current_attempts: u32,
    /// Attempts left in the shortest window, zero on denial
    pub remaining_attempts: u32,
    /// When the violated window rolls over, set only on denial
    pub next_allowed_attempt: Option<DateTime<Utc>>,
    /// Advisory retry delay derived from consecutive failures, set only on denial
    #[serde(default, rename = "backoff_ms", with = "optional_millis")]
    pub backoff_interval: Option<Duration>,
}

/// `Option<Duration>` as whole milliseconds, saturating at `u64::MAX`.
mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => {
                serializer.serialize_some(&u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// Validated limiter parameters.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Windows, any order
    pub windows: Vec<WindowConfig>,
    /// Maximum distinct keys tracked
    pub max_cache_size: usize,
    /// Growth factor for backoff
    pub backoff_multiplier: f64,
}

impl LimiterConfig {
    /// Configuration with the given windows and default sizing.
    pub fn new(windows: Vec<WindowConfig>) -> Self {
        Self {
            windows,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    /// Override the maximum number of tracked keys.
    pub fn max_cache_size(mut self, max_cache_size: usize) -> Self {
        self.max_cache_size = max_cache_size;
        self
    }

    /// Override the backoff growth factor.
    pub fn backoff_multiplier(mut self, backoff_multiplier: f64) -> Self {
        self.backoff_multiplier = backoff_multiplier;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.windows.is_empty() {
            return Err(TurnstileError::Config(
                "at least one window must be configured".to_string(),
            ));
        }
        if self.max_cache_size == 0 {
            return Err(TurnstileError::Config(
                "max_cache_size must be positive".to_string(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(TurnstileError::Config(format!(
                "backoff_multiplier must be a finite value >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }
}

/// Everything the limiter knows about one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    /// One entry per configured window, index-aligned with the sorted windows
    pub windows: Vec<AttemptInfo>,
    /// Failures reported since the last success
    pub consecutive_failures: u32,
}

/// The rate limiting engine.
pub struct LimiterState<K> {
    windows: Vec<WindowConfig>,
    backoff_multiplier: f64,
    records: BoundedCache<K, KeyRecord>,
    clock: Arc<dyn Clock>,
    metrics: Option<MetricsCallback<K>>,
}

impl<K> LimiterState<K>
where
    K: Hash + Eq + Clone + Debug,
{
    /// Create an engine reading time from the system clock.
    pub fn new(config: LimiterConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create an engine reading time from `clock`.
    pub fn with_clock(config: LimiterConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let mut windows = config.windows;
        windows.sort_by_key(|w| w.duration());

        debug!(
            windows = ?windows,
            max_cache_size = config.max_cache_size,
            backoff_multiplier = config.backoff_multiplier,
            "Creating rate limiter"
        );

        Ok(Self {
            windows,
            backoff_multiplier: config.backoff_multiplier,
            records: BoundedCache::new(config.max_cache_size),
            clock,
            metrics: None,
        })
    }

    /// Attach a callback that observes every check decision.
    pub fn with_metrics(mut self, callback: MetricsCallback<K>) -> Self {
        self.metrics = Some(callback);
        self
    }

    /// The configured windows, shortest first.
    pub fn windows(&self) -> &[WindowConfig] {
        &self.windows
    }

    /// The current instant according to this engine's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Check and count an attempt for `key` at the clock's current time.
    pub fn check_limit_now(&mut self, key: &K) -> RateLimitResult {
        let now = self.now();
        self.check_limit(key, now)
    }

    /// Check and count an attempt for `key` at `timestamp`.
    ///
    /// Denied attempts leave the key's record untouched.
    pub fn check_limit(&mut self, key: &K, timestamp: DateTime<Utc>) -> RateLimitResult {
        self.prune_stale(timestamp);

        let mut record = self.resolve_record(key, timestamp);

        trace!(
            key = ?key,
            timestamp = %timestamp,
            "Checking rate limit"
        );

        let violation = self
            .windows
            .iter()
            .zip(&record.windows)
            .find(|(window, info)| info.attempts >= window.max_attempts());

        let result = match violation {
            Some((window, info)) => {
                let next_allowed = window.window_end(info.window_start);
                debug!(
                    key = ?key,
                    window = ?window.duration(),
                    attempts = info.attempts,
                    limit = window.max_attempts(),
                    next_allowed = %next_allowed,
                    "Rate limit exceeded"
                );
                RateLimitResult {
                    is_allowed: false,
                    current_attempts: info.attempts,
                    remaining_attempts: 0,
                    next_allowed_attempt: Some(next_allowed),
                    backoff_interval: self.backoff_for(record.consecutive_failures),
                }
            }
            None => {
                for info in &mut record.windows {
                    info.attempts += 1;
                    info.timestamp = timestamp;
                }
                let current = record.windows[0].attempts;
                let remaining = self.windows[0].max_attempts().saturating_sub(current);
                self.store(key, record);

                RateLimitResult {
                    is_allowed: true,
                    current_attempts: current,
                    remaining_attempts: remaining,
                    next_allowed_attempt: None,
                    backoff_interval: None,
                }
            }
        };

        self.report(key, &result);
        result
    }

    /// Count a failure against `key`. Untracked keys are ignored.
    pub fn record_failure(&mut self, key: &K) {
        let Some(mut record) = self.records.get(key).cloned() else {
            trace!(key = ?key, "Ignoring failure for untracked key");
            return;
        };
        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        trace!(
            key = ?key,
            consecutive_failures = record.consecutive_failures,
            "Recorded failure"
        );
        self.store(key, record);
    }

    /// Clear the failure streak for `key`. Untracked keys are ignored.
    pub fn record_success(&mut self, key: &K) {
        let Some(mut record) = self.records.get(key).cloned() else {
            return;
        };
        record.consecutive_failures = 0;
        self.store(key, record);
    }

    /// Forget everything about `key`.
    pub fn reset(&mut self, key: &K) {
        if self.records.remove(key).is_some() {
            debug!(key = ?key, "Reset rate limit state");
        }
    }

    /// Forget every key.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.records.len()
    }

    /// The stored record for `key`, if tracked.
    pub fn record(&self, key: &K) -> Option<&KeyRecord> {
        self.records.get(key)
    }

    /// Failures reported for `key` since its last success.
    pub fn consecutive_failures(&self, key: &K) -> Option<u32> {
        self.records.get(key).map(|r| r.consecutive_failures)
    }

    /// Advisory backoff after `failures` consecutive failures.
    pub fn backoff_for(&self, failures: u32) -> Option<Duration> {
        if failures == 0 {
            return None;
        }
        let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
        let secs = self.windows[0].duration().as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
    }

    /// Drop records whose shortest window was last written at or before
    /// `timestamp` minus the longest window.
    fn prune_stale(&mut self, timestamp: DateTime<Utc>) {
        let cutoff = self
            .windows
            .iter()
            .map(|w| sub_duration(timestamp, w.duration()))
            .min()
            .unwrap_or(timestamp);

        let before = self.records.len();
        self.records.retain(|_, record| {
            record
                .windows
                .first()
                .is_some_and(|info| info.timestamp > cutoff)
        });

        let pruned = before - self.records.len();
        if pruned > 0 {
            debug!(pruned, cutoff = %cutoff, "Pruned stale rate limit records");
        }
    }

    /// Re-align the stored record for `key` to the buckets containing `timestamp`.
    fn resolve_record(&self, key: &K, timestamp: DateTime<Utc>) -> KeyRecord {
        let existing = self.records.get(key);
        let windows = self
            .windows
            .iter()
            .enumerate()
            .map(|(index, window)| {
                let start = window.window_start(timestamp);
                existing
                    .and_then(|record| record.windows.get(index))
                    .filter(|info| info.window_start == start)
                    .copied()
                    .unwrap_or_else(|| AttemptInfo::fresh(window, timestamp))
            })
            .collect();

        KeyRecord {
            windows,
            consecutive_failures: existing.map_or(0, |r| r.consecutive_failures),
        }
    }

    fn store(&mut self, key: &K, record: KeyRecord) {
        if !self.records.contains_key(key) {
            debug!(key = ?key, "Tracking new key");
        }
        if let Some((evicted, _)) = self.records.insert(key.clone(), record) {
            debug!(key = ?evicted, "Evicted rate limit record at capacity");
        }
    }

    fn report(&self, key: &K, result: &RateLimitResult) {
        let Some(callback) = &self.metrics else {
            return;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| callback(key, result))).is_err() {
            warn!(key = ?key, "Metrics callback panicked; decision unaffected");
        }
    }
}
