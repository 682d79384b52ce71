//! Turnstile - Multi-Window Admission Control
//!
//! This crate decides whether keyed actors (users, IP addresses, API tokens)
//! may make another attempt. Each key is counted against one or more
//! epoch-aligned windows at once, repeated failures grow an advisory
//! exponential backoff, and all per-key state lives in a bounded cache so
//! memory stays flat however many distinct keys show up.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;

pub use cache::BoundedCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, TurnstileError};
pub use ratelimit::{
    AdmissionBackend, LimiterConfig, LimiterHandle, LimiterState, RateLimitResult, RateLimiter,
    WindowConfig,
};
