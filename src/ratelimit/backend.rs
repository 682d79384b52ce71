//! Admission trait for abstracting the locked and task-owned limiters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::state::RateLimitResult;
use crate::error::Result;

/// Trait for rate limiter front ends.
///
/// This trait abstracts over both the mutex-guarded `RateLimiter` and the
/// channel-driven `LimiterHandle` so callers can work with either.
#[async_trait]
pub trait AdmissionBackend<K>: Send + Sync
where
    K: Send + 'static,
{
    /// Check and count an attempt for `key` at the limiter's current time.
    async fn check(&self, key: K) -> Result<RateLimitResult>;

    /// Check and count an attempt for `key` at `timestamp`.
    async fn check_at(&self, key: K, timestamp: DateTime<Utc>) -> Result<RateLimitResult>;

    /// Report a failed attempt (for example a rejected password) for `key`.
    async fn record_failure(&self, key: K) -> Result<()>;

    /// Report a successful attempt for `key`, clearing its failure streak.
    async fn record_success(&self, key: K) -> Result<()>;

    /// Forget all state for `key`.
    async fn reset(&self, key: K) -> Result<()>;
}
