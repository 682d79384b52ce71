//! Rate limiting logic and state management.

mod actor;
mod backend;
mod limiter;
mod rules;
mod state;
mod window;

pub use actor::LimiterHandle;
pub use backend::AdmissionBackend;
pub use limiter::RateLimiter;
pub use rules::{LimiterRules, WindowRule};
pub use state::{
    KeyRecord, LimiterConfig, LimiterState, MetricsCallback, RateLimitResult,
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_MAX_CACHE_SIZE,
};
pub use window::{AttemptInfo, TimeUnit, WindowConfig};
