//! Connection settings.
//!
//! Settings are plain serde structs. The crate never reads files or the
//! environment itself; a loader hands over YAML or JSON text (or builds the
//! struct directly) and [`ConnectionSettings::validate`] reports every
//! out-of-range field at once.
//!
//! ```
//! use voltage_slmp::config::{ConnectionSettings, TransportKind};
//!
//! let settings = ConnectionSettings::from_yaml_str(
//!     "port: 1025\ntransport: Tcp\nversion: 3E\nreceive_timeout: 2000\n",
//! )
//! .unwrap();
//! assert_eq!(settings.port, 1025);
//! assert_eq!(settings.transport, TransportKind::Tcp);
//! assert_eq!(settings.receive_timeout.as_millis(), 2000);
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::continuity::{ContinuitySettings, ErrorHandlingMode, RetrySettings};
use crate::device::DeviceRanges;
use crate::error::{SlmpError, SlmpResult};
use crate::protocol::FrameVersion;
use crate::utils::serde_millis;

/// Default SLMP port
pub const DEFAULT_PORT: u16 = 5000;

/// Upper bound of `max_concurrent_requests`
pub const MAX_CONCURRENT_LIMIT: usize = 32;

/// Transport used to reach the PLC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    Tcp,
    Udp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => f.write_str("TCP"),
            TransportKind::Udp => f.write_str("UDP"),
        }
    }
}

/// Connection settings for one PLC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub port: u16,
    pub transport: TransportKind,
    /// Binary framing; ASCII framing is not supported
    pub binary: bool,
    pub version: FrameVersion,
    pub pipelining: bool,
    pub max_concurrent_requests: usize,
    #[serde(with = "serde_millis")]
    pub connect_timeout: Duration,
    #[serde(with = "serde_millis")]
    pub receive_timeout: Duration,
    /// Split oversized bit/word requests into several frames instead of rejecting them
    pub auto_chunk: bool,
    pub device_ranges: DeviceRanges,
    pub continuity: ContinuitySettings,
    pub retry: RetrySettings,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            transport: TransportKind::Udp,
            binary: true,
            version: FrameVersion::E4,
            pipelining: true,
            max_concurrent_requests: 4,
            connect_timeout: Duration::from_secs(5),
            receive_timeout: Duration::from_secs(1),
            auto_chunk: false,
            device_ranges: DeviceRanges::default(),
            continuity: ContinuitySettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl ConnectionSettings {
    /// Persistent TCP with pipelining
    pub fn tcp_recommended() -> Self {
        Self {
            transport: TransportKind::Tcp,
            pipelining: true,
            max_concurrent_requests: 8,
            receive_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(10),
            ..Self::default()
        }
    }

    /// Serialized UDP that keeps running through failures
    pub fn udp_recommended() -> Self {
        Self {
            transport: TransportKind::Udp,
            pipelining: false,
            max_concurrent_requests: 1,
            receive_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            continuity: ContinuitySettings::operation_first(),
            ..Self::default()
        }
    }

    /// Short timeouts and quick retries for production lines
    pub fn operation_first() -> Self {
        Self {
            transport: TransportKind::Udp,
            pipelining: false,
            max_concurrent_requests: 1,
            receive_timeout: Duration::from_millis(800),
            connect_timeout: Duration::from_secs(3),
            retry: RetrySettings {
                max_retry_count: 2,
                initial_delay: Duration::from_millis(50),
                backoff_multiplier: 1.5,
                ..RetrySettings::default()
            },
            continuity: ContinuitySettings {
                max_notification_frequency_seconds: 120,
                ..ContinuitySettings::operation_first()
            },
            ..Self::default()
        }
    }

    /// Wide pipelining over TCP with 4E frames
    pub fn high_performance() -> Self {
        Self {
            binary: true,
            version: FrameVersion::E4,
            transport: TransportKind::Tcp,
            pipelining: true,
            max_concurrent_requests: 16,
            receive_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_version(mut self, version: FrameVersion) -> Self {
        self.version = version;
        self
    }

    pub fn with_mode(mut self, mode: ErrorHandlingMode) -> Self {
        self.continuity.mode = mode;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// In-flight request limit actually applied by the connection manager
    pub fn effective_concurrency(&self) -> usize {
        if self.pipelining {
            self.max_concurrent_requests.clamp(1, MAX_CONCURRENT_LIMIT)
        } else {
            1
        }
    }

    /// Check every field, reporting all problems in one error
    pub fn validate(&self) -> SlmpResult<()> {
        let mut problems = Vec::new();
        if self.port == 0 {
            problems.push("port must be 1-65535".to_string());
        }
        if !self.binary {
            problems.push("ASCII framing is not supported; set binary: true".to_string());
        }
        if !(1..=MAX_CONCURRENT_LIMIT).contains(&self.max_concurrent_requests) {
            problems.push(format!(
                "max_concurrent_requests must be 1-{}, got {}",
                MAX_CONCURRENT_LIMIT, self.max_concurrent_requests
            ));
        }
        if self.receive_timeout.is_zero() || self.receive_timeout > Duration::from_secs(600) {
            problems.push(format!(
                "receive_timeout must be positive and at most 10 minutes, got {:?}",
                self.receive_timeout
            ));
        }
        if self.connect_timeout.is_zero() || self.connect_timeout > Duration::from_secs(300) {
            problems.push(format!(
                "connect_timeout must be positive and at most 5 minutes, got {:?}",
                self.connect_timeout
            ));
        }
        problems.extend(self.retry.violations());
        problems.extend(self.continuity.violations());

        if problems.is_empty() {
            Ok(())
        } else {
            Err(SlmpError::configuration(problems.join("; ")))
        }
    }

    /// Parse and validate YAML settings
    pub fn from_yaml_str(text: &str) -> SlmpResult<Self> {
        let settings: Self = serde_yaml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse and validate JSON settings
    pub fn from_json_str(text: &str) -> SlmpResult<Self> {
        let settings: Self = serde_json::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }
}

impl fmt::Display for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConnectionSettings(port: {}, {}, {}, {}, rx timeout: {}ms, connect timeout: {}ms, max requests: {}, pipelining: {})",
            self.port,
            if self.binary { "Binary" } else { "ASCII" },
            self.version,
            self.transport,
            self.receive_timeout.as_millis(),
            self.connect_timeout.as_millis(),
            self.max_concurrent_requests,
            self.pipelining
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuity::NotificationLevel;
    use crate::device::DeviceCode;

    #[test]
    fn test_defaults() {
        let settings = ConnectionSettings::default();
        assert_eq!(settings.port, 5000);
        assert_eq!(settings.transport, TransportKind::Udp);
        assert_eq!(settings.version, FrameVersion::E4);
        assert_eq!(settings.effective_concurrency(), 4);
        assert_eq!(settings.continuity.mode, ErrorHandlingMode::ReturnDefaultAndContinue);
        assert_eq!(settings.continuity.notification_level, NotificationLevel::Warning);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_presets_are_valid() {
        for settings in [
            ConnectionSettings::tcp_recommended(),
            ConnectionSettings::udp_recommended(),
            ConnectionSettings::operation_first(),
            ConnectionSettings::high_performance(),
        ] {
            assert!(settings.validate().is_ok(), "{}", settings);
        }
        assert_eq!(ConnectionSettings::udp_recommended().effective_concurrency(), 1);
        assert_eq!(ConnectionSettings::high_performance().effective_concurrency(), 16);
    }

    #[test]
    fn test_validate_reports_all_problems() {
        let settings = ConnectionSettings {
            port: 0,
            binary: false,
            max_concurrent_requests: 33,
            receive_timeout: Duration::ZERO,
            ..ConnectionSettings::default()
        };
        let message = settings.validate().unwrap_err().to_string();
        assert!(message.contains("port"));
        assert!(message.contains("ASCII"));
        assert!(message.contains("max_concurrent_requests"));
        assert!(message.contains("receive_timeout"));
    }

    #[test]
    fn test_parse_yaml_with_nested_sections() {
        let yaml = r#"
transport: Tcp
pipelining: false
device_ranges:
  D: 12287
continuity:
  mode: RetryThenDefault
  default_word_value: 7
retry:
  max_retry_count: 5
  initial_delay: 250
"#;
        let settings = ConnectionSettings::from_yaml_str(yaml).unwrap();
        assert_eq!(settings.effective_concurrency(), 1);
        assert_eq!(settings.device_ranges.max_address(DeviceCode::D), 12287);
        assert_eq!(settings.continuity.mode, ErrorHandlingMode::RetryThenDefault);
        assert_eq!(settings.continuity.default_word_value, 7);
        assert_eq!(settings.retry.initial_delay, Duration::from_millis(250));
        assert_eq!(settings.retry.max_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_parse_json_and_reject_invalid() {
        let settings = ConnectionSettings::from_json_str(r#"{"port": 1280, "version": "3E"}"#).unwrap();
        assert_eq!(settings.port, 1280);
        assert_eq!(settings.version, FrameVersion::E3);

        let err = ConnectionSettings::from_json_str(r#"{"retry": {"max_retry_count": 20}}"#).unwrap_err();
        assert!(matches!(err, SlmpError::Configuration { .. }));

        let err = ConnectionSettings::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, SlmpError::Configuration { .. }));
    }
}
