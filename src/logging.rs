use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::device::DeviceCode;
use crate::protocol::{end_code, Command, FrameVersion, RequestFrame, ResponseFrame};

/// Log levels for the callback logging system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Error messages
    Error,
    /// Warning messages
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
}

/// Logging mode for frame display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Show raw frame bytes only
    Raw,
    /// Show decoded header fields
    Interpreted,
    /// Show both
    Both,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Type alias for log callback functions
///
/// The callback receives a log level and message string
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger that hands SLMP frame traces to a callback
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl CallbackLogger {
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode: LoggingMode::Interpreted,
        }
    }

    pub fn with_mode(callback: Option<LogCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode,
        }
    }

    /// Logger writing timestamped lines to stdout/stderr
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error | LogLevel::Warn => eprintln!("[{}] {}: {}", timestamp, level.as_str(), message),
                LogLevel::Info | LogLevel::Debug => println!("[{}] {}: {}", timestamp, level.as_str(), message),
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    /// Logger that outputs nothing
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    pub fn get_mode(&self) -> LoggingMode {
        self.mode
    }

    pub fn is_enabled(&self) -> bool {
        self.callback.is_some()
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(ref callback) = self.callback {
                callback(level, message);
            }
        }
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level as u8 <= self.min_level as u8
    }

    /// Log an encoded request frame
    pub fn log_request(&self, frame: &[u8]) {
        if !self.should_log(LogLevel::Info) {
            return;
        }
        let raw = format!("SLMP Request -> Raw: {}", hex::encode_upper(frame));
        let interpreted = match RequestFrame::decode(frame) {
            Ok(request) => format!(
                "SLMP Request -> {} {}, Command: {}, Subcommand: 0x{:04X}, Target: {}/{}/0x{:04X}/{}, Timer: {}, Payload: {} bytes",
                request.version,
                if request.version.has_serial() {
                    format!("serial {}", request.serial)
                } else {
                    "in-order".to_string()
                },
                command_label(request.command),
                request.subcommand,
                request.target.network,
                request.target.node,
                request.target.dest_processor,
                request.target.multidrop,
                request.timer,
                request.payload.len()
            ),
            Err(e) => format!("SLMP Request -> undecodable frame: {}", e),
        };
        self.emit(&interpreted, &raw);
    }

    /// Log a received response frame for `command`
    pub fn log_response(&self, command: Command, version: FrameVersion, frame: &[u8]) {
        if !self.should_log(LogLevel::Info) {
            return;
        }
        let raw = format!("SLMP Response <- Raw: {}", hex::encode_upper(frame));
        let interpreted = match ResponseFrame::decode(frame, version) {
            Ok(response) if response.end_code == end_code::SUCCESS => format!(
                "SLMP Response <- {}, {}",
                command.name(),
                interpret_data(command, &response.data)
            ),
            Ok(response) => format!(
                "SLMP Response <- {}, End code: 0x{:04X} ({})",
                command.name(),
                response.end_code,
                end_code::describe(response.end_code)
            ),
            Err(e) => format!("SLMP Response <- undecodable frame: {}", e),
        };
        self.emit(&interpreted, &raw);
    }

    fn emit(&self, interpreted: &str, raw: &str) {
        match self.mode {
            LoggingMode::Raw => self.info(raw),
            LoggingMode::Interpreted => self.info(interpreted),
            LoggingMode::Both => {
                self.info(interpreted);
                self.debug(raw);
            }
        }
    }
}

fn command_label(code: u16) -> String {
    match Command::from_u16(code) {
        Some(command) => command.to_string(),
        None => format!("Unknown (0x{:04X})", code),
    }
}

fn interpret_data(command: Command, data: &[u8]) -> String {
    if data.is_empty() {
        return "No data".to_string();
    }
    match command {
        Command::DeviceRead | Command::DeviceReadRandom | Command::DeviceReadBlock | Command::ExecuteMonitor => {
            let words: Vec<u16> = data
                .chunks_exact(2)
                .take(8)
                .map(|w| u16::from_le_bytes([w[0], w[1]]))
                .collect();
            format!("{} bytes, first words: {:04X?}", data.len(), words)
        }
        Command::ReadTypeName => {
            let name = String::from_utf8_lossy(&data[..data.len().min(16)]);
            format!("Model: {}", name.trim_end_matches(|c: char| c == '\0' || c == ' '))
        }
        _ => format!("Data: {}", hex::encode_upper(data)),
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Convenience macro for creating a simple console logger
#[macro_export]
macro_rules! console_logger {
    () => {
        $crate::logging::CallbackLogger::console()
    };
}

/// Convenience macro for creating a custom logger
#[macro_export]
macro_rules! custom_logger {
    ($callback:expr) => {
        $crate::logging::CallbackLogger::new(Some($callback), $crate::logging::LogLevel::Info)
    };
    ($callback:expr, $level:expr) => {
        $crate::logging::CallbackLogger::new(Some($callback), $level)
    };
    ($callback:expr, $level:expr, $mode:expr) => {
        $crate::logging::CallbackLogger::with_mode(Some($callback), $level, $mode)
    };
}

/// Record of one completed client operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationEvent {
    pub timestamp: DateTime<Utc>,
    pub operation: &'static str,
    pub device: Option<DeviceCode>,
    pub address: Option<u32>,
    pub count: usize,
    pub success: bool,
    /// The caller received default values instead of PLC data
    pub substituted: bool,
    pub attempts: u32,
    #[serde(with = "crate::utils::serde_millis")]
    pub response_time: Duration,
    pub error: Option<String>,
}

/// Receives operation events from the client
///
/// `emit` is called on the request path and must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: OperationEvent);
}

/// Sink forwarding events to a bounded channel
///
/// Events are dropped when the channel is full or closed.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: mpsc::Sender<OperationEvent>,
}

impl ChannelEventSink {
    /// Sink plus the receiving end for a writer task
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OperationEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: OperationEvent) {
        if let Err(e) = self.sender.try_send(event) {
            tracing::trace!("Operation event dropped: {}", e);
        }
    }
}

/// Write events as JSON lines until the channel closes
///
/// `writer` is driven from the blocking pool, so slow files or pipes never
/// stall a runtime worker. Returns the number of events written.
pub fn spawn_event_writer<W>(mut receiver: mpsc::Receiver<OperationEvent>, mut writer: W) -> JoinHandle<std::io::Result<u64>>
where
    W: Write + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut written = 0u64;
        while let Some(event) = receiver.blocking_recv() {
            serde_json::to_writer(&mut writer, &event)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
            written += 1;
        }
        Ok::<_, std::io::Error>(written)
    })
}
