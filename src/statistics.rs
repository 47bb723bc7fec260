//! Error statistics tracker.
//!
//! Counts operations, errors and continued (default-substituted) operations,
//! keeps a per-key error counter and decides whether a given error should be
//! surfaced as a notification. Safe to share between tasks: totals are atomic
//! and per-key counters live in a `DashMap`.
//!
//! ```
//! use voltage_slmp::statistics::{ErrorKey, ErrorStatistics};
//! use voltage_slmp::SlmpError;
//!
//! let stats = ErrorStatistics::default();
//! for _ in 0..10 {
//!     stats.record_operation();
//! }
//! let key = ErrorKey::general("TimeoutError");
//! for _ in 0..3 {
//!     stats.record_error(&key, &SlmpError::timeout("read", 1000));
//! }
//! assert_eq!(stats.summary().error_rate, 30.0);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;

use crate::device::DeviceCode;
use crate::error::SlmpError;

/// Number of keys reported by [`ErrorStatistics::summary`]
pub const TOP_ERROR_COUNT: usize = 10;

/// Source of wall-clock time for timestamps and rate limiting
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let step = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::max_value());
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = *now + step;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Identity of an error for counting and rate limiting
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ErrorKey {
    pub error_type: String,
    pub device: Option<DeviceCode>,
    pub address: Option<u32>,
}

impl ErrorKey {
    pub fn new<S: Into<String>>(error_type: S, device: DeviceCode, address: u32) -> Self {
        Self {
            error_type: error_type.into(),
            device: Some(device),
            address: Some(address),
        }
    }

    /// Key for errors not tied to a single device
    pub fn general<S: Into<String>>(error_type: S) -> Self {
        Self {
            error_type: error_type.into(),
            device: None,
            address: None,
        }
    }

    /// Key for `error` raised while accessing `device`/`address`
    pub fn for_error(error: &SlmpError, device: Option<DeviceCode>, address: Option<u32>) -> Self {
        Self {
            error_type: error.error_type().to_string(),
            device,
            address,
        }
    }
}

impl fmt::Display for ErrorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.device, self.address) {
            (Some(device), Some(address)) => write!(
                f,
                "{}@{}{}",
                self.error_type,
                device,
                device.format_address(address)
            ),
            (Some(device), None) => write!(f, "{}@{}", self.error_type, device),
            _ => f.write_str(&self.error_type),
        }
    }
}

/// Per-key error history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorCounter {
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_message: String,
}

/// One row of the summary's top-error list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorSummary {
    pub key: ErrorKey,
    pub counter: ErrorCounter,
}

/// Point-in-time snapshot of the tracker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticsSummary {
    pub total_operations: u64,
    pub total_errors: u64,
    pub total_continued_operations: u64,
    /// Errors per operation, in percent
    pub error_rate: f64,
    /// Continued operations per error, in percent
    pub continuity_rate: f64,
    /// Most frequent error keys, highest count first
    pub top_errors: Vec<ErrorSummary>,
}

impl fmt::Display for StatisticsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SLMP Error Statistics:")?;
        writeln!(f, "  Total Operations: {}", self.total_operations)?;
        writeln!(f, "  Total Errors: {}", self.total_errors)?;
        writeln!(f, "  Continued Operations: {}", self.total_continued_operations)?;
        writeln!(f, "  Error Rate: {:.2}%", self.error_rate)?;
        write!(f, "  Continuity Rate: {:.2}%", self.continuity_rate)?;
        for entry in &self.top_errors {
            write!(
                f,
                "\n  {} x{} (last: {})",
                entry.key, entry.counter.count, entry.counter.last_message
            )?;
        }
        Ok(())
    }
}

/// Concurrent error statistics
#[derive(Debug)]
pub struct ErrorStatistics {
    total_operations: AtomicU64,
    total_errors: AtomicU64,
    total_continued: AtomicU64,
    counters: DashMap<ErrorKey, ErrorCounter>,
    last_notified: DashMap<ErrorKey, DateTime<Utc>>,
    notification_window: Duration,
    enabled: bool,
    clock: Arc<dyn Clock>,
    /// Recorders hold the read side; `reset` takes the write side so a reset
    /// never interleaves with a half-applied update.
    gate: RwLock<()>,
}

impl Default for ErrorStatistics {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), true)
    }
}

impl ErrorStatistics {
    /// Tracker that notifies at most once per `notification_window` per key
    pub fn new(notification_window: Duration, enabled: bool) -> Self {
        Self::with_clock(notification_window, enabled, Arc::new(SystemClock))
    }

    /// Tracker driven by an injected clock
    pub fn with_clock(notification_window: Duration, enabled: bool, clock: Arc<dyn Clock>) -> Self {
        Self {
            total_operations: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            total_continued: AtomicU64::new(0),
            counters: DashMap::new(),
            last_notified: DashMap::new(),
            notification_window,
            enabled,
            clock,
            gate: RwLock::new(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Count one logical operation
    pub fn record_operation(&self) {
        if !self.enabled {
            return;
        }
        let _guard = self.read_gate();
        self.total_operations.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one failed attempt and decide whether to notify.
    ///
    /// The first error for a key always notifies. Later errors for the same
    /// key are suppressed until the notification window has elapsed since
    /// the last notification; the next one then notifies and restarts the
    /// window.
    pub fn record_error(&self, key: &ErrorKey, error: &SlmpError) -> bool {
        let _guard = self.read_gate();
        let now = self.clock.now();

        if self.enabled {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
            let message = error.to_string();
            self.counters
                .entry(key.clone())
                .and_modify(|c| {
                    c.count += 1;
                    c.last_seen = now;
                    c.last_message.clone_from(&message);
                })
                .or_insert_with(|| ErrorCounter {
                    count: 1,
                    first_seen: now,
                    last_seen: now,
                    last_message: message.clone(),
                });
        }

        self.should_notify(key, now)
    }

    /// Count one operation that completed with substituted defaults
    pub fn record_continued_operation(&self, key: &ErrorKey, default_used: &str) {
        if !self.enabled {
            return;
        }
        let _guard = self.read_gate();
        self.total_continued.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("Continued {} with default {}", key, default_used);
    }

    pub fn total_operations(&self) -> u64 {
        self.total_operations.load(Ordering::Relaxed)
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors.load(Ordering::Relaxed)
    }

    pub fn total_continued_operations(&self) -> u64 {
        self.total_continued.load(Ordering::Relaxed)
    }

    /// Errors per operation in percent, 0 with no operations
    pub fn error_rate(&self) -> f64 {
        percentage(self.total_errors(), self.total_operations())
    }

    /// Continued operations per error in percent, 0 with no errors
    pub fn continuity_rate(&self) -> f64 {
        percentage(self.total_continued_operations(), self.total_errors())
    }

    /// Counter for one key
    pub fn counter(&self, key: &ErrorKey) -> Option<ErrorCounter> {
        self.counters.get(key).map(|c| c.value().clone())
    }

    /// Snapshot with the top error keys; does not change any state
    pub fn summary(&self) -> StatisticsSummary {
        let _guard = self.read_gate();
        let total_operations = self.total_operations();
        let total_errors = self.total_errors();
        let total_continued_operations = self.total_continued_operations();

        let mut top_errors: Vec<ErrorSummary> = self
            .counters
            .iter()
            .map(|entry| ErrorSummary {
                key: entry.key().clone(),
                counter: entry.value().clone(),
            })
            .collect();
        top_errors.sort_by(|a, b| b.counter.count.cmp(&a.counter.count).then_with(|| a.key.cmp(&b.key)));
        top_errors.truncate(TOP_ERROR_COUNT);

        StatisticsSummary {
            total_operations,
            total_errors,
            total_continued_operations,
            error_rate: percentage(total_errors, total_operations),
            continuity_rate: percentage(total_continued_operations, total_errors),
            top_errors,
        }
    }

    /// Clear every counter and notification timestamp
    pub fn reset(&self) {
        let _guard = self.gate.write().unwrap_or_else(|e| e.into_inner());
        self.total_operations.store(0, Ordering::Relaxed);
        self.total_errors.store(0, Ordering::Relaxed);
        self.total_continued.store(0, Ordering::Relaxed);
        self.counters.clear();
        self.last_notified.clear();
    }

    fn should_notify(&self, key: &ErrorKey, now: DateTime<Utc>) -> bool {
        let window = chrono::Duration::from_std(self.notification_window)
            .unwrap_or_else(|_| chrono::Duration::max_value());
        match self.last_notified.entry(key.clone()) {
            Entry::Occupied(mut last) => {
                if now - *last.get() >= window {
                    last.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    fn read_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().unwrap_or_else(|e| e.into_inner())
    }
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout() -> SlmpError {
        SlmpError::timeout("read_word_devices", 1000)
    }

    #[test]
    fn test_error_rate() {
        let stats = ErrorStatistics::default();
        assert_eq!(stats.error_rate(), 0.0);
        assert_eq!(stats.continuity_rate(), 0.0);

        for _ in 0..10 {
            stats.record_operation();
        }
        let key = ErrorKey::new("TimeoutError", DeviceCode::D, 100);
        for _ in 0..3 {
            stats.record_error(&key, &timeout());
        }
        assert_eq!(stats.error_rate(), 30.0);

        stats.record_continued_operation(&key, "[0]");
        let summary = stats.summary();
        assert_eq!(summary.total_operations, 10);
        assert_eq!(summary.total_errors, 3);
        assert!((summary.continuity_rate - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(summary.top_errors[0].counter.count, 3);
    }

    #[test]
    fn test_notification_rate_limit() {
        let clock = Arc::new(ManualClock::default());
        let stats = ErrorStatistics::with_clock(Duration::from_secs(60), true, clock.clone());
        let key = ErrorKey::new("ConnectionError", DeviceCode::D, 0);

        assert!(stats.record_error(&key, &timeout()));
        clock.advance(Duration::from_secs(10));
        assert!(!stats.record_error(&key, &timeout()));
        clock.advance(Duration::from_secs(51));
        assert!(stats.record_error(&key, &timeout()));
        // the window restarted at the last notification
        clock.advance(Duration::from_secs(30));
        assert!(!stats.record_error(&key, &timeout()));

        // other keys have their own window
        assert!(stats.record_error(&ErrorKey::general("ProtocolError"), &SlmpError::protocol(0xC059)));
    }

    #[test]
    fn test_counter_tracks_first_and_last() {
        let clock = Arc::new(ManualClock::default());
        let stats = ErrorStatistics::with_clock(Duration::from_secs(30), true, clock.clone());
        let key = ErrorKey::general("ProtocolError");
        let start = clock.now();

        stats.record_error(&key, &SlmpError::protocol(0xC059));
        clock.advance(Duration::from_secs(5));
        stats.record_error(&key, &SlmpError::protocol(0xC056));

        let counter = stats.counter(&key).unwrap();
        assert_eq!(counter.count, 2);
        assert_eq!(counter.first_seen, start);
        assert_eq!(counter.last_seen, start + chrono::Duration::seconds(5));
        assert!(counter.last_message.contains("0xC056"));
    }

    #[test]
    fn test_summary_top_ten() {
        let stats = ErrorStatistics::default();
        for address in 0..15u32 {
            let key = ErrorKey::new("TimeoutError", DeviceCode::D, address);
            for _ in 0..=address {
                stats.record_error(&key, &timeout());
            }
        }
        let summary = stats.summary();
        assert_eq!(summary.top_errors.len(), TOP_ERROR_COUNT);
        assert_eq!(summary.top_errors[0].key.address, Some(14));
        assert_eq!(summary.top_errors[0].counter.count, 15);
        // snapshot is read-only
        assert_eq!(stats.summary(), summary);
    }

    #[test]
    fn test_reset_clears_everything() {
        let stats = ErrorStatistics::default();
        let key = ErrorKey::general("TimeoutError");
        stats.record_operation();
        assert!(stats.record_error(&key, &timeout()));
        stats.record_continued_operation(&key, "0");

        stats.reset();
        let summary = stats.summary();
        assert_eq!(summary.total_operations, 0);
        assert_eq!(summary.total_errors, 0);
        assert_eq!(summary.total_continued_operations, 0);
        assert!(summary.top_errors.is_empty());
        // notification timestamps are cleared too
        assert!(stats.record_error(&key, &timeout()));
    }

    #[test]
    fn test_disabled_tracker_still_rate_limits() {
        let stats = ErrorStatistics::new(Duration::from_secs(30), false);
        assert!(!stats.is_enabled());
        let before = stats.summary();
        let key = ErrorKey::general("TimeoutError");

        stats.record_operation();
        assert!(stats.record_error(&key, &timeout()));
        assert!(!stats.record_error(&key, &timeout()));
        stats.record_continued_operation(&key, "0");

        assert_eq!(stats.summary(), before);
        assert!(stats.counter(&key).is_none());
    }

    #[test]
    fn test_concurrent_recording() {
        let stats = Arc::new(ErrorStatistics::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_operation();
                        stats.record_error(&ErrorKey::general("TimeoutError"), &timeout());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.total_operations(), 8000);
        assert_eq!(stats.counter(&ErrorKey::general("TimeoutError")).unwrap().count, 8000);
    }
}
