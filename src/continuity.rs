//! Continuity and retry policy.
//!
//! A monitoring loop should keep running when the PLC goes away. Every data
//! operation runs through a [`ContinuityEngine`], which on failure asks the
//! pure [`decide`] function what to do:
//!
//! | Mode | Recoverable failure |
//! |------|---------------------|
//! | `ThrowException` | propagate immediately |
//! | `ReturnDefaultAndContinue` | substitute the default value immediately |
//! | `RetryThenDefault` | retry with exponential backoff, then substitute |
//!
//! Validation, configuration, cancellation and internal errors always
//! propagate regardless of mode.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::device::DeviceCode;
use crate::error::{SlmpError, SlmpResult};
use crate::statistics::{ErrorKey, ErrorStatistics};
use crate::utils::serde_millis;

/// What to do when a recoverable operation fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorHandlingMode {
    ThrowException,
    ReturnDefaultAndContinue,
    RetryThenDefault,
}

/// Severity used when surfacing a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NotificationLevel {
    None,
    Warning,
    Error,
    Critical,
}

/// Continuity behaviour of a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuitySettings {
    pub mode: ErrorHandlingMode,
    pub notification_level: NotificationLevel,
    pub default_bit_value: bool,
    pub default_word_value: u16,
    pub enable_error_statistics: bool,
    pub enable_continuity_logging: bool,
    /// Dump every request and response frame as hex
    pub enable_debug_output: bool,
    /// Minimum seconds between two notifications for the same error key
    pub max_notification_frequency_seconds: u32,
}

impl Default for ContinuitySettings {
    fn default() -> Self {
        Self {
            mode: ErrorHandlingMode::ReturnDefaultAndContinue,
            notification_level: NotificationLevel::Warning,
            default_bit_value: false,
            default_word_value: 0,
            enable_error_statistics: true,
            enable_continuity_logging: true,
            enable_debug_output: false,
            max_notification_frequency_seconds: 30,
        }
    }
}

impl ContinuitySettings {
    /// Keep running at all costs, notify once a minute
    pub fn operation_first() -> Self {
        Self {
            mode: ErrorHandlingMode::ReturnDefaultAndContinue,
            notification_level: NotificationLevel::Warning,
            max_notification_frequency_seconds: 60,
            ..Self::default()
        }
    }

    /// Retry before substituting, notify loudly
    pub fn high_reliability() -> Self {
        Self {
            mode: ErrorHandlingMode::RetryThenDefault,
            notification_level: NotificationLevel::Error,
            enable_debug_output: true,
            max_notification_frequency_seconds: 10,
            ..Self::default()
        }
    }

    /// Default for dword reads: the default word in both halves
    pub fn default_dword_value(&self) -> u32 {
        let word = self.default_word_value as u32;
        word | (word << 16)
    }

    pub fn notification_window(&self) -> Duration {
        Duration::from_secs(self.max_notification_frequency_seconds as u64)
    }

    /// Out-of-range fields, described
    pub fn violations(&self) -> Vec<String> {
        let mut out = Vec::new();
        if !(1..=3600).contains(&self.max_notification_frequency_seconds) {
            out.push(format!(
                "max_notification_frequency_seconds must be 1-3600, got {}",
                self.max_notification_frequency_seconds
            ));
        }
        out
    }
}

/// Exponential backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retry_count: u32,
    #[serde(with = "serde_millis")]
    pub initial_delay: Duration,
    #[serde(with = "serde_millis")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retry_count: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetrySettings {
    /// Delay before retry number `attempt` (1-based):
    /// `min(initial * multiplier^(attempt-1), max)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        if capped.is_finite() && capped > 0.0 {
            Duration::from_millis(capped as u64)
        } else if capped.is_finite() {
            Duration::ZERO
        } else {
            self.max_delay
        }
    }

    /// Out-of-range fields, described
    pub fn violations(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.max_retry_count > 10 {
            out.push(format!("max_retry_count must be 0-10, got {}", self.max_retry_count));
        }
        if !(1.0..=10.0).contains(&self.backoff_multiplier) {
            out.push(format!(
                "backoff_multiplier must be 1.0-10.0, got {}",
                self.backoff_multiplier
            ));
        }
        if self.initial_delay > self.max_delay {
            out.push(format!(
                "initial_delay {:?} exceeds max_delay {:?}",
                self.initial_delay, self.max_delay
            ));
        }
        out
    }
}

/// Outcome of one failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Return the error to the caller
    Propagate,
    /// Wait `delay`, then try again
    Retry { delay: Duration },
    /// Complete with the default value
    Substitute,
}

/// Decide what to do after attempt number `attempt` (1-based) failed with `error`
///
/// ```
/// use std::time::Duration;
/// use voltage_slmp::continuity::{decide, Disposition, ErrorHandlingMode, RetrySettings};
/// use voltage_slmp::SlmpError;
///
/// let retry = RetrySettings::default();
/// let err = SlmpError::connection("refused");
/// assert_eq!(
///     decide(ErrorHandlingMode::RetryThenDefault, &retry, &err, 2),
///     Disposition::Retry { delay: Duration::from_millis(200) }
/// );
/// assert_eq!(
///     decide(ErrorHandlingMode::RetryThenDefault, &retry, &err, 4),
///     Disposition::Substitute
/// );
/// ```
pub fn decide(mode: ErrorHandlingMode, retry: &RetrySettings, error: &SlmpError, attempt: u32) -> Disposition {
    if !error.is_recoverable() {
        return Disposition::Propagate;
    }
    match mode {
        ErrorHandlingMode::ThrowException => Disposition::Propagate,
        ErrorHandlingMode::ReturnDefaultAndContinue => Disposition::Substitute,
        ErrorHandlingMode::RetryThenDefault if attempt <= retry.max_retry_count => Disposition::Retry {
            delay: retry.delay_for_attempt(attempt),
        },
        ErrorHandlingMode::RetryThenDefault => Disposition::Substitute,
    }
}

/// Identifies a logical operation for statistics and notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationContext {
    pub operation: &'static str,
    pub device: Option<DeviceCode>,
    pub address: Option<u32>,
}

impl OperationContext {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            device: None,
            address: None,
        }
    }

    pub fn at(operation: &'static str, device: DeviceCode, address: u32) -> Self {
        Self {
            operation,
            device: Some(device),
            address: Some(address),
        }
    }

    pub fn error_key(&self, error: &SlmpError) -> ErrorKey {
        ErrorKey::for_error(error, self.device, self.address)
    }
}

/// Result of running an operation through the engine
#[derive(Debug)]
pub struct Outcome<T> {
    pub value: T,
    /// The value is the configured default, not PLC data
    pub substituted: bool,
    /// Attempts made, including the successful or last failed one
    pub attempts: u32,
    /// Last failure when the value was substituted
    pub error: Option<SlmpError>,
}

/// Applies [`ContinuitySettings`] and [`RetrySettings`] to operations
#[derive(Debug, Clone)]
pub struct ContinuityEngine {
    settings: ContinuitySettings,
    retry: RetrySettings,
    statistics: Arc<ErrorStatistics>,
}

impl ContinuityEngine {
    pub fn new(settings: ContinuitySettings, retry: RetrySettings, statistics: Arc<ErrorStatistics>) -> Self {
        Self {
            settings,
            retry,
            statistics,
        }
    }

    pub fn settings(&self) -> &ContinuitySettings {
        &self.settings
    }

    pub fn retry_settings(&self) -> &RetrySettings {
        &self.retry
    }

    pub fn statistics(&self) -> &Arc<ErrorStatistics> {
        &self.statistics
    }

    /// Run `op` until it succeeds or the policy gives up.
    ///
    /// Each failed attempt is recorded once. A substituted result is recorded
    /// as one continued operation no matter how many attempts preceded it.
    /// The backoff sleep is abandoned when `cancel` fires.
    pub async fn run<T, D, F, Fut>(
        &self,
        ctx: &OperationContext,
        cancel: Option<&CancellationToken>,
        default: D,
        mut op: F,
    ) -> SlmpResult<Outcome<T>>
    where
        D: FnOnce(&ContinuitySettings) -> T,
        F: FnMut() -> Fut,
        Fut: Future<Output = SlmpResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let error = match op().await {
                Ok(value) => {
                    return Ok(Outcome {
                        value,
                        substituted: false,
                        attempts: attempt,
                        error: None,
                    })
                }
                Err(error) => error,
            };

            if matches!(error, SlmpError::Cancelled { .. }) {
                return Err(error);
            }

            let disposition = decide(self.settings.mode, &self.retry, &error, attempt);
            self.report(ctx, &error, attempt, disposition);

            match disposition {
                Disposition::Propagate => return Err(error),
                Disposition::Retry { delay } => {
                    debug!("{} attempt {} failed, retrying in {:?}", ctx.operation, attempt, delay);
                    match cancel {
                        Some(token) => {
                            tokio::select! {
                                _ = token.cancelled() => return Err(SlmpError::cancelled(ctx.operation)),
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        None => tokio::time::sleep(delay).await,
                    }
                }
                Disposition::Substitute => {
                    let value = default(&self.settings);
                    self.statistics
                        .record_continued_operation(&ctx.error_key(&error), ctx.operation);
                    return Ok(Outcome {
                        value,
                        substituted: true,
                        attempts: attempt,
                        error: Some(error),
                    });
                }
            }
        }
    }

    /// Record a failure that bypassed [`ContinuityEngine::run`] (local validation)
    pub fn record_failure(&self, ctx: &OperationContext, error: &SlmpError) {
        self.report(ctx, error, 1, Disposition::Propagate);
    }

    fn report(&self, ctx: &OperationContext, error: &SlmpError, attempt: u32, disposition: Disposition) {
        let key = ctx.error_key(error);
        let notify = self.statistics.record_error(&key, error);
        if !notify || !self.settings.enable_continuity_logging {
            return;
        }

        let action = match disposition {
            Disposition::Propagate => "propagating",
            Disposition::Retry { .. } => "retrying",
            Disposition::Substitute => "continuing with default values",
        };
        match self.settings.notification_level {
            NotificationLevel::None => {}
            NotificationLevel::Warning => {
                warn!("{} failed at {} (attempt {}), {}: {}", ctx.operation, key, attempt, action, error)
            }
            NotificationLevel::Error => {
                error!("{} failed at {} (attempt {}), {}: {}", ctx.operation, key, attempt, action, error)
            }
            NotificationLevel::Critical => error!(
                "CRITICAL: {} failed at {} (attempt {}), {}: {}",
                ctx.operation,
                key,
                attempt,
                action,
                error
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn engine(mode: ErrorHandlingMode) -> ContinuityEngine {
        let settings = ContinuitySettings {
            mode,
            ..ContinuitySettings::default()
        };
        ContinuityEngine::new(settings, RetrySettings::default(), Arc::new(ErrorStatistics::default()))
    }

    #[test]
    fn test_backoff_schedule() {
        let retry = RetrySettings::default();
        let delays: Vec<u64> = (1..=3)
            .map(|attempt| retry.delay_for_attempt(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400]);
        assert_eq!(retry.delay_for_attempt(20), Duration::from_secs(5));
    }

    #[test]
    fn test_decide_matrix() {
        let retry = RetrySettings::default();
        let timeout = SlmpError::timeout("read", 1000);
        let invalid = SlmpError::invalid("count must be > 0");

        assert_eq!(
            decide(ErrorHandlingMode::ThrowException, &retry, &timeout, 1),
            Disposition::Propagate
        );
        assert_eq!(
            decide(ErrorHandlingMode::ReturnDefaultAndContinue, &retry, &timeout, 1),
            Disposition::Substitute
        );
        assert_eq!(
            decide(ErrorHandlingMode::RetryThenDefault, &retry, &timeout, 1),
            Disposition::Retry {
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(
            decide(ErrorHandlingMode::RetryThenDefault, &retry, &timeout, 4),
            Disposition::Substitute
        );
        for mode in [
            ErrorHandlingMode::ThrowException,
            ErrorHandlingMode::ReturnDefaultAndContinue,
            ErrorHandlingMode::RetryThenDefault,
        ] {
            assert_eq!(decide(mode, &retry, &invalid, 1), Disposition::Propagate);
        }
    }

    #[test]
    fn test_default_dword_value() {
        let settings = ContinuitySettings {
            default_word_value: 0x00FF,
            ..ContinuitySettings::default()
        };
        assert_eq!(settings.default_dword_value(), 0x00FF_00FF);
    }

    #[tokio::test]
    async fn test_return_default_records_once() {
        let engine = engine(ErrorHandlingMode::ReturnDefaultAndContinue);
        let ctx = OperationContext::at("read_word_devices", DeviceCode::D, 0);
        let outcome = engine
            .run(&ctx, None, |s| vec![s.default_word_value; 2], || async {
                Err::<Vec<u16>, _>(SlmpError::connection("refused"))
            })
            .await
            .unwrap();

        assert_eq!(outcome.value, vec![0, 0]);
        assert!(outcome.substituted);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(engine.statistics().total_errors(), 1);
        assert_eq!(engine.statistics().total_continued_operations(), 1);
    }

    #[tokio::test]
    async fn test_throw_exception_propagates() {
        let engine = engine(ErrorHandlingMode::ThrowException);
        let ctx = OperationContext::new("read_word_devices");
        let result = engine
            .run(&ctx, None, |_| 0u16, || async { Err(SlmpError::protocol(0xC059)) })
            .await;
        assert_eq!(result.unwrap_err().end_code(), Some(0xC059));
        assert_eq!(engine.statistics().total_errors(), 1);
        assert_eq!(engine.statistics().total_continued_operations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_default_waits_backoff() {
        let engine = engine(ErrorHandlingMode::RetryThenDefault);
        let ctx = OperationContext::new("read_bit_devices");
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let outcome = engine
            .run(&ctx, None, |s| s.default_bit_value, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SlmpError::timeout("read", 1000)) }
            })
            .await
            .unwrap();

        assert!(outcome.substituted);
        assert_eq!(outcome.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_millis(700));
        assert_eq!(engine.statistics().total_errors(), 4);
        assert_eq!(engine.statistics().total_continued_operations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers() {
        let engine = engine(ErrorHandlingMode::RetryThenDefault);
        let ctx = OperationContext::new("read_word_devices");
        let calls = AtomicU32::new(0);

        let outcome = engine
            .run(&ctx, None, |_| 0u16, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(SlmpError::connection("reset"))
                    } else {
                        Ok(42u16)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.value, 42);
        assert!(!outcome.substituted);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(engine.statistics().total_continued_operations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let engine = engine(ErrorHandlingMode::RetryThenDefault);
        let ctx = OperationContext::new("read_word_devices");
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = engine
            .run(&ctx, Some(&token), |_| 0u16, || async {
                Err(SlmpError::timeout("read", 1000))
            })
            .await;
        assert!(matches!(result, Err(SlmpError::Cancelled { .. })));
    }

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Log output of `failures` identical failures at `level`
    fn notifications(level: NotificationLevel, failures: usize) -> String {
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::WARN)
            .finish();
        let settings = ContinuitySettings {
            notification_level: level,
            ..ContinuitySettings::default()
        };
        let engine = ContinuityEngine::new(settings, RetrySettings::default(), Arc::new(ErrorStatistics::default()));
        let ctx = OperationContext::at("read_word_devices", DeviceCode::D, 100);

        tracing::subscriber::with_default(subscriber, || {
            for _ in 0..failures {
                engine.record_failure(&ctx, &SlmpError::timeout("read", 1000));
            }
        });
        let text = String::from_utf8_lossy(&log.0.lock().unwrap()).into_owned();
        text
    }

    #[test]
    fn test_notification_levels() {
        assert!(notifications(NotificationLevel::None, 1).is_empty());

        let warning = notifications(NotificationLevel::Warning, 1);
        assert!(warning.contains("WARN"));
        assert!(!warning.contains("ERROR"));
        assert!(warning.contains("read_word_devices failed"));

        let error = notifications(NotificationLevel::Error, 1);
        assert!(error.contains("ERROR"));
        assert!(!error.contains("CRITICAL"));

        let critical = notifications(NotificationLevel::Critical, 1);
        assert!(critical.contains("ERROR"));
        assert!(critical.contains("CRITICAL:"));
    }

    #[test]
    fn test_repeated_failure_notifies_once_per_window() {
        assert_eq!(notifications(NotificationLevel::Warning, 5).lines().count(), 1);
    }

    #[tokio::test]
    async fn test_disabled_statistics_count_nothing() {
        let statistics = Arc::new(ErrorStatistics::new(Duration::from_secs(30), false));
        let settings = ContinuitySettings {
            enable_error_statistics: false,
            ..ContinuitySettings::default()
        };
        let engine = ContinuityEngine::new(settings, RetrySettings::default(), statistics.clone());
        let before = statistics.summary();

        statistics.record_operation();
        let ctx = OperationContext::at("read_word_devices", DeviceCode::D, 0);
        let outcome = engine
            .run(&ctx, None, |s| s.default_word_value, || async {
                Err::<u16, _>(SlmpError::connection("refused"))
            })
            .await
            .unwrap();

        assert!(outcome.substituted);
        assert_eq!(statistics.summary(), before);
        assert_eq!(statistics.total_errors(), 0);
        assert_eq!(statistics.total_continued_operations(), 0);
    }

    #[test]
    fn test_settings_violations() {
        let retry = RetrySettings {
            max_retry_count: 11,
            backoff_multiplier: 0.5,
            ..RetrySettings::default()
        };
        assert_eq!(retry.violations().len(), 2);

        let continuity = ContinuitySettings {
            max_notification_frequency_seconds: 0,
            ..ContinuitySettings::default()
        };
        assert_eq!(continuity.violations().len(), 1);
        assert!(ContinuitySettings::high_reliability().violations().is_empty());
    }
}
