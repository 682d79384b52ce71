//! Mutex-guarded rate limiter.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::backend::AdmissionBackend;
use super::state::{LimiterConfig, LimiterState, MetricsCallback, RateLimitResult};
use super::window::WindowConfig;
use crate::clock::Clock;
use crate::error::Result;

/// A multi-window rate limiter safe to share between threads.
///
/// Every operation runs inside one critical section, so the
/// read-modify-write of a check can never interleave with another call.
pub struct RateLimiter<K> {
    state: Mutex<LimiterState<K>>,
}

impl<K> RateLimiter<K>
where
    K: Hash + Eq + Clone + Debug,
{
    /// Create a rate limiter using the system clock.
    pub fn new(config: LimiterConfig) -> Result<Self> {
        Ok(Self::from_state(LimiterState::new(config)?))
    }

    /// Create a rate limiter using `clock` for default timestamps.
    pub fn with_clock(config: LimiterConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self::from_state(LimiterState::with_clock(config, clock)?))
    }

    /// Wrap an already configured engine.
    pub fn from_state(state: LimiterState<K>) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Attach a callback that observes every check decision.
    ///
    /// The callback runs while the limiter is locked, so it sees decisions
    /// in the order they were made. It must not call back into the limiter.
    pub fn with_metrics(self, callback: MetricsCallback<K>) -> Self {
        Self::from_state(self.state.into_inner().with_metrics(callback))
    }

    /// Check and count an attempt for `key` at the clock's current time.
    pub fn check_limit_now(&self, key: &K) -> RateLimitResult {
        self.state.lock().check_limit_now(key)
    }

    /// Check and count an attempt for `key` at `timestamp`.
    pub fn check_limit(&self, key: &K, timestamp: DateTime<Utc>) -> RateLimitResult {
        self.state.lock().check_limit(key, timestamp)
    }

    /// Count a failure against `key`.
    pub fn record_failure(&self, key: &K) {
        self.state.lock().record_failure(key);
    }

    /// Clear the failure streak for `key`.
    pub fn record_success(&self, key: &K) {
        self.state.lock().record_success(key);
    }

    /// Forget everything about `key`.
    pub fn reset(&self, key: &K) {
        self.state.lock().reset(key);
    }

    /// Forget every key.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.state.lock().clear();
    }

    /// Get the number of tracked keys.
    pub fn tracked_keys(&self) -> usize {
        self.state.lock().tracked_keys()
    }

    /// Failures reported for `key` since its last success.
    pub fn consecutive_failures(&self, key: &K) -> Option<u32> {
        self.state.lock().consecutive_failures(key)
    }

    /// The configured windows, shortest first.
    pub fn windows(&self) -> Vec<WindowConfig> {
        self.state.lock().windows().to_vec()
    }
}

#[async_trait]
impl<K> AdmissionBackend<K> for RateLimiter<K>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
{
    async fn check(&self, key: K) -> Result<RateLimitResult> {
        Ok(self.check_limit_now(&key))
    }

    async fn check_at(&self, key: K, timestamp: DateTime<Utc>) -> Result<RateLimitResult> {
        Ok(self.check_limit(&key, timestamp))
    }

    async fn record_failure(&self, key: K) -> Result<()> {
        RateLimiter::record_failure(self, &key);
        Ok(())
    }

    async fn record_success(&self, key: K) -> Result<()> {
        RateLimiter::record_success(self, &key);
        Ok(())
    }

    async fn reset(&self, key: K) -> Result<()> {
        RateLimiter::reset(self, &key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::window::TimeUnit;
    use chrono::TimeZone;
    use std::time::Duration;

    fn login_limiter(clock: Arc<ManualClock>) -> RateLimiter<String> {
        let config = LimiterConfig::new(vec![
            WindowConfig::per(TimeUnit::Minute, 5).unwrap(),
            WindowConfig::per(TimeUnit::Hour, 100).unwrap(),
        ]);
        RateLimiter::with_clock(config, clock).unwrap()
    }

    fn start() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_040, 0).unwrap()))
    }

    #[test]
    fn test_rate_limiter_creation() {
        let limiter = login_limiter(start());
        assert_eq!(limiter.tracked_keys(), 0);
        assert_eq!(limiter.windows().len(), 2);
    }

    #[test]
    fn test_keys_have_separate_counters() {
        let limiter = login_limiter(start());
        let alice = "alice".to_string();
        let bob = "bob".to_string();

        for _ in 0..5 {
            assert!(limiter.check_limit_now(&alice).is_allowed);
        }
        assert!(!limiter.check_limit_now(&alice).is_allowed);

        let result = limiter.check_limit_now(&bob);
        assert!(result.is_allowed);
        assert_eq!(result.remaining_attempts, 4);
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[test]
    fn test_failure_feedback_drives_backoff() {
        let clock = start();
        let limiter = login_limiter(clock.clone());
        let key = "10.0.0.7".to_string();

        for _ in 0..5 {
            limiter.check_limit_now(&key);
            limiter.record_failure(&key);
        }
        assert_eq!(limiter.consecutive_failures(&key), Some(5));

        let denied = limiter.check_limit_now(&key);
        assert_eq!(denied.backoff_interval, Some(Duration::from_secs(32 * 60)));

        limiter.record_success(&key);
        assert_eq!(limiter.consecutive_failures(&key), Some(0));
    }

    #[test]
    fn test_reset_and_clear() {
        let limiter = login_limiter(start());
        let key = "token".to_string();

        limiter.check_limit_now(&key);
        limiter.reset(&key);
        assert_eq!(limiter.tracked_keys(), 0);

        limiter.check_limit_now(&key);
        limiter.check_limit_now(&"other".to_string());
        limiter.clear();
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_concurrent_checks_never_over_admit() {
        let clock = start();
        let limiter = Arc::new(login_limiter(clock));
        let key = "shared".to_string();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                let key = key.clone();
                std::thread::spawn(move || {
                    (0..4)
                        .filter(|_| limiter.check_limit_now(&key).is_allowed)
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 5);
    }

    #[tokio::test]
    async fn test_backend_trait_delegates() {
        let limiter = login_limiter(start());
        let backend: &dyn AdmissionBackend<String> = &limiter;

        let result = backend.check("carol".to_string()).await.unwrap();
        assert!(result.is_allowed);
        backend.record_failure("carol".to_string()).await.unwrap();
        assert_eq!(limiter.consecutive_failures(&"carol".to_string()), Some(1));

        backend.reset("carol".to_string()).await.unwrap();
        assert_eq!(limiter.tracked_keys(), 0);
    }
}
