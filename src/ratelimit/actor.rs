//! Task-owned rate limiter driven over a channel.
//!
//! A single tokio task owns the [`LimiterState`] and applies commands one at
//! a time in arrival order. [`LimiterHandle`] is the cheap, cloneable front
//! door producers use to reach it.

use std::fmt::Debug;
use std::hash::Hash;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::backend::AdmissionBackend;
use super::state::{LimiterState, RateLimitResult};
use crate::error::{Result, TurnstileError};

/// Default number of commands that may queue before senders wait.
const DEFAULT_QUEUE_DEPTH: usize = 1024;

/// A request for the worker task.
enum Command<K> {
    Check {
        key: K,
        timestamp: Option<DateTime<Utc>>,
        reply: oneshot::Sender<RateLimitResult>,
    },
    RecordFailure {
        key: K,
        reply: oneshot::Sender<()>,
    },
    RecordSuccess {
        key: K,
        reply: oneshot::Sender<()>,
    },
    Reset {
        key: K,
        reply: oneshot::Sender<()>,
    },
    TrackedKeys {
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

/// Handle to a rate limiter running on its own task.
///
/// Clones share the same worker. The worker stops once every handle is
/// dropped or [`shutdown`](Self::shutdown) is called; after that every call
/// fails with [`TurnstileError::LimiterClosed`].
pub struct LimiterHandle<K> {
    tx: mpsc::Sender<Command<K>>,
}

impl<K> Clone for LimiterHandle<K> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<K> LimiterHandle<K>
where
    K: Hash + Eq + Clone + Debug + Send + 'static,
{
    /// Move `state` onto a new task and return a handle to it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(state: LimiterState<K>) -> Self {
        Self::spawn_with_queue_depth(state, DEFAULT_QUEUE_DEPTH)
    }

    /// Like [`spawn`](Self::spawn) with an explicit command queue depth.
    pub fn spawn_with_queue_depth(state: LimiterState<K>, depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(depth.max(1));
        tokio::spawn(run_worker(state, rx));
        Self { tx }
    }

    /// Check and count an attempt for `key` at the worker clock's current time.
    pub async fn check_limit_now(&self, key: K) -> Result<RateLimitResult> {
        self.request(|reply| Command::Check {
            key,
            timestamp: None,
            reply,
        })
        .await
    }

    /// Check and count an attempt for `key` at `timestamp`.
    pub async fn check_limit(&self, key: K, timestamp: DateTime<Utc>) -> Result<RateLimitResult> {
        self.request(|reply| Command::Check {
            key,
            timestamp: Some(timestamp),
            reply,
        })
        .await
    }

    /// Count a failure against `key`.
    pub async fn record_failure(&self, key: K) -> Result<()> {
        self.request(|reply| Command::RecordFailure { key, reply }).await
    }

    /// Clear the failure streak for `key`.
    pub async fn record_success(&self, key: K) -> Result<()> {
        self.request(|reply| Command::RecordSuccess { key, reply }).await
    }

    /// Forget everything about `key`.
    pub async fn reset(&self, key: K) -> Result<()> {
        self.request(|reply| Command::Reset { key, reply }).await
    }

    /// Get the number of tracked keys.
    pub async fn tracked_keys(&self) -> Result<usize> {
        self.request(|reply| Command::TrackedKeys { reply }).await
    }

    /// Stop the worker after it finishes the commands already queued.
    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(Command::Shutdown)
            .await
            .map_err(|_| TurnstileError::LimiterClosed)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command<K>) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| TurnstileError::LimiterClosed)?;
        response.await.map_err(|_| TurnstileError::LimiterClosed)
    }
}

async fn run_worker<K>(mut state: LimiterState<K>, mut rx: mpsc::Receiver<Command<K>>)
where
    K: Hash + Eq + Clone + Debug,
{
    debug!("Rate limiter worker started");

    while let Some(command) = rx.recv().await {
        // A dropped reply receiver means the caller went away; the state
        // change still stands.
        match command {
            Command::Check {
                key,
                timestamp,
                reply,
            } => {
                let timestamp = timestamp.unwrap_or_else(|| state.now());
                let _ = reply.send(state.check_limit(&key, timestamp));
            }
            Command::RecordFailure { key, reply } => {
                state.record_failure(&key);
                let _ = reply.send(());
            }
            Command::RecordSuccess { key, reply } => {
                state.record_success(&key);
                let _ = reply.send(());
            }
            Command::Reset { key, reply } => {
                state.reset(&key);
                let _ = reply.send(());
            }
            Command::TrackedKeys { reply } => {
                let _ = reply.send(state.tracked_keys());
            }
            Command::Shutdown => {
                info!("Rate limiter worker shutting down");
                break;
            }
        }
    }

    debug!(tracked_keys = state.tracked_keys(), "Rate limiter worker stopped");
}

#[async_trait]
impl<K> AdmissionBackend<K> for LimiterHandle<K>
where
    K: Hash + Eq + Clone + Debug + Send + 'static,
{
    async fn check(&self, key: K) -> Result<RateLimitResult> {
        self.check_limit_now(key).await
    }

    async fn check_at(&self, key: K, timestamp: DateTime<Utc>) -> Result<RateLimitResult> {
        self.check_limit(key, timestamp).await
    }

    async fn record_failure(&self, key: K) -> Result<()> {
        LimiterHandle::record_failure(self, key).await
    }

    async fn record_success(&self, key: K) -> Result<()> {
        LimiterHandle::record_success(self, key).await
    }

    async fn reset(&self, key: K) -> Result<()> {
        LimiterHandle::reset(self, key).await
    }
}
