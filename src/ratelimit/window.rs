//! Window definitions and per-window attempt bookkeeping.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};

/// Named time units for window rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    /// One second
    Second,
    /// One minute
    Minute,
    /// One hour
    Hour,
    /// One day
    Day,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// A fixed-length window and the number of attempts it admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    duration: Duration,
    max_attempts: u32,
}

impl WindowConfig {
    /// Create a window admitting `max_attempts` per `duration`.
    ///
    /// Windows are aligned on whole milliseconds, so `duration` must be a
    /// positive whole number of milliseconds. `max_attempts` must be positive.
    pub fn new(duration: Duration, max_attempts: u32) -> Result<Self> {
        if duration < Duration::from_millis(1) || duration.subsec_nanos() % 1_000_000 != 0 {
            return Err(TurnstileError::Config(format!(
                "window duration must be a positive whole number of milliseconds, got {:?}",
                duration
            )));
        }
        if max_attempts == 0 {
            return Err(TurnstileError::Config(
                "window max_attempts must be positive".to_string(),
            ));
        }
        Ok(Self {
            duration,
            max_attempts,
        })
    }

    /// Shorthand for a window spanning one `unit`.
    pub fn per(unit: TimeUnit, max_attempts: u32) -> Result<Self> {
        Self::new(unit.duration(), max_attempts)
    }

    /// Length of the window.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Inclusive attempt cap within one window.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Start of the window bucket containing `timestamp`.
    ///
    /// Buckets are aligned to multiples of the duration counted from the
    /// Unix epoch, so every key shares the same boundaries.
    pub fn window_start(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let width = i64::try_from(self.duration.as_millis()).unwrap_or(i64::MAX);
        let millis = timestamp.timestamp_millis();
        let start = millis.div_euclid(width).saturating_mul(width);
        DateTime::from_timestamp_millis(start).unwrap_or(timestamp)
    }

    /// The instant the bucket starting at `window_start` rolls over.
    pub fn window_end(&self, window_start: DateTime<Utc>) -> DateTime<Utc> {
        add_duration(window_start, self.duration)
    }
}

/// Attempt counters for one key inside one window bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptInfo {
    /// Aligned start of the bucket these counts belong to
    pub window_start: DateTime<Utc>,
    /// Allowed attempts recorded in this bucket
    pub attempts: u32,
    /// Last time this entry was written, used for staleness pruning
    pub timestamp: DateTime<Utc>,
}

impl AttemptInfo {
    /// An empty bucket for `window` at `timestamp`.
    pub fn fresh(window: &WindowConfig, timestamp: DateTime<Utc>) -> Self {
        Self {
            window_start: window.window_start(timestamp),
            attempts: 0,
            timestamp,
        }
    }
}

/// Add a std duration to an instant, saturating at the latest representable one.
pub(crate) fn add_duration(instant: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| instant.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Subtract a std duration from an instant, saturating at the earliest representable one.
pub(crate) fn sub_duration(instant: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| instant.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_time_unit_duration() {
        assert_eq!(TimeUnit::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeUnit::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeUnit::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeUnit::Day.duration(), Duration::from_secs(86400));
    }

    #[test]
    fn test_window_rejects_invalid_values() {
        assert!(WindowConfig::new(Duration::ZERO, 5).is_err());
        assert!(WindowConfig::new(Duration::from_micros(999), 5).is_err());
        assert!(WindowConfig::new(Duration::from_secs(1), 0).is_err());
        assert!(WindowConfig::new(Duration::from_millis(1), 1).is_ok());
    }

    #[test]
    fn test_window_rejects_fractional_milliseconds() {
        assert!(WindowConfig::new(Duration::from_micros(1_500), 5).is_err());
        assert!(WindowConfig::new(Duration::new(60, 1), 5).is_err());

        let window = WindowConfig::new(Duration::from_millis(1_500), 5).unwrap();
        let start = window.window_start(Utc.timestamp_millis_opt(3_100).unwrap());
        assert_eq!(start, Utc.timestamp_millis_opt(3_000).unwrap());
        assert_eq!(window.window_end(start), Utc.timestamp_millis_opt(4_500).unwrap());
    }

    #[test]
    fn test_window_start_aligns_to_epoch() {
        let window = WindowConfig::per(TimeUnit::Minute, 5).unwrap();
        let ts = Utc.timestamp_opt(125, 500_000_000).unwrap();

        let start = window.window_start(ts);
        assert_eq!(start, Utc.timestamp_opt(120, 0).unwrap());
        assert_eq!(window.window_end(start), Utc.timestamp_opt(180, 0).unwrap());
    }

    #[test]
    fn test_window_start_on_boundary() {
        let window = WindowConfig::per(TimeUnit::Hour, 100).unwrap();
        let ts = Utc.timestamp_opt(7200, 0).unwrap();
        assert_eq!(window.window_start(ts), ts);
    }

    #[test]
    fn test_window_start_before_epoch_floors_down() {
        let window = WindowConfig::per(TimeUnit::Minute, 5).unwrap();
        let ts = Utc.timestamp_opt(-30, 0).unwrap();
        assert_eq!(window.window_start(ts), Utc.timestamp_opt(-60, 0).unwrap());
    }

    #[test]
    fn test_fresh_attempt_info() {
        let window = WindowConfig::per(TimeUnit::Second, 3).unwrap();
        let ts = Utc.timestamp_millis_opt(10_250).unwrap();
        let info = AttemptInfo::fresh(&window, ts);

        assert_eq!(info.attempts, 0);
        assert_eq!(info.timestamp, ts);
        assert_eq!(info.window_start, Utc.timestamp_opt(10, 0).unwrap());
    }
}
