//! # Voltage SLMP - Async SLMP Client for Mitsubishi-compatible PLCs
//!
//! An asynchronous SLMP (Seamless Message Protocol, also known as the MC
//! protocol) client for 3E and 4E binary frames over TCP or UDP, built on
//! Tokio for production-line data collection.
//!
//! ## Features
//!
//! - **Device access**: bit, word and pseudo-dword reads/writes, random and
//!   block access, monitor registration, buffer memory
//! - **Continuity**: configurable error handling that can substitute default
//!   values instead of stopping the line, with per-device error statistics
//! - **Pipelining**: 4E serial numbers let several requests share one socket
//! - **Simulator**: an in-process PLC simulator with failure injection
//!
//! ## Supported Commands
//!
//! | Command | Function | Client | Simulator |
//! |---------|----------|--------|-----------|
//! | 0x0401 | Device Read (bit/word) | ✅ | ✅ |
//! | 0x1401 | Device Write (bit/word) | ✅ | ✅ |
//! | 0x0403 | Device Read Random | ✅ | ✅ |
//! | 0x1402 | Device Write Random | ✅ | ✅ |
//! | 0x0406 | Device Read Block | ✅ | ✅ |
//! | 0x1406 | Device Write Block | ✅ | ✅ |
//! | 0x0801 | Entry Monitor Device | ✅ | ✅ |
//! | 0x0802 | Execute Monitor | ✅ | ✅ |
//! | 0x0101 | Read Type Name | ✅ | ✅ |
//! | 0x0619 | Self Test | ✅ | ✅ |
//! | 0x1617 | Clear Error | ✅ | ✅ |
//! | 0x0613 | Memory Read | ✅ | ✅ |
//! | 0x1613 | Memory Write | ✅ | ✅ |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use voltage_slmp::{ConnectionSettings, DeviceCode, RequestOptions, SlmpClient, SlmpResult, Target};
//!
//! #[tokio::main]
//! async fn main() -> SlmpResult<()> {
//!     let settings = ConnectionSettings::tcp_recommended();
//!     let client = SlmpClient::new("192.168.1.10", settings, Target::local())?;
//!     client.connect().await?;
//!
//!     let options = RequestOptions::new();
//!     let values = client.read_word_devices(DeviceCode::D, 100, 4, &options).await?;
//!     println!("D100-D103: {:?}", values);
//!
//!     client.write_bit_devices(DeviceCode::M, 0, &[true, false], &options).await?;
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   SlmpClient    │── validation, statistics, events
//! └─────────────────┘
//!          │
//! ┌─────────────────┐    ┌─────────────────┐
//! │ ContinuityEngine│    │  PseudoDword    │
//! │ (retry/default) │    │  Splitter       │
//! └─────────────────┘    └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ConnectionManager│── serials, concurrency, reconnect
//! └─────────────────┘
//!          │
//! ┌─────────────────┐    ┌─────────────────┐
//! │   Transport     │◄──►│  PlcSimulator   │
//! │   (TCP/UDP)     │    │  (DeviceMemory) │
//! └─────────────────┘    └─────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Device codes, addresses and range limits
pub mod device;

/// SLMP frame definitions and payload codecs
pub mod protocol;

/// Pseudo-dword splitting and combining
pub mod dword;

/// Error handling modes, retry policy and default-value substitution
pub mod continuity;

/// Per-device error statistics
pub mod statistics;

/// Connection settings and presets
pub mod config;

/// Network transport layer for TCP and UDP
pub mod transport;

/// Request serials, concurrency and reconnection
pub mod connection;

/// SLMP client implementation
pub mod client;

/// Logging system for the library
pub mod logging;

/// In-process PLC simulator
pub mod simulator;

/// Utility functions and performance monitoring
pub mod utils;

// Re-export main types for convenience
pub use client::{DeviceClient, MixedReadResult, RequestOptions, SlmpClient};
pub use config::{ConnectionSettings, TransportKind};
pub use connection::{ConnectionManager, MonitorRegistration};
pub use continuity::{ContinuitySettings, ErrorHandlingMode, NotificationLevel, RetrySettings};
pub use device::{DeviceAddress, DeviceCode, DeviceRanges};
pub use dword::{DwordItem, PseudoDwordSplitter, WordItem, WordPair};
pub use error::{SlmpError, SlmpResult, Violation};
pub use logging::{CallbackLogger, ChannelEventSink, EventSink, LogCallback, LogLevel, LoggingMode, OperationEvent};
pub use protocol::{
    BitBlock, BlockReadResult, BlockSpec, Command, FrameVersion, RandomReadResult, Target, TypeName, WordBlock,
};
pub use simulator::{DeviceMemory, PlcSimulator, SimulatorConfig, SimulatorStats};
pub use statistics::{ErrorStatistics, StatisticsSummary};
pub use transport::{SlmpTransport, TcpTransport, TransportStats, UdpTransport};
pub use utils::{OperationTimer, PerformanceMetrics};

/// Default receive timeout (1 second)
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Default SLMP port
pub const DEFAULT_PORT: u16 = config::DEFAULT_PORT;

/// Maximum bit points in a single bit-unit request
pub const MAX_BITS_PER_REQUEST: usize = protocol::MAX_BIT_POINTS;

/// Maximum word points in a single word-unit request
pub const MAX_WORDS_PER_REQUEST: usize = protocol::MAX_WORD_POINTS;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage SLMP v{} - Async SLMP 3E/4E binary client", VERSION)
}
