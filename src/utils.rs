/// Utility functions and helpers for SLMP operations
///
/// This module contains request validation, performance metrics,
/// formatting helpers and logging setup shared by the client, the
/// simulator and the binaries.

use std::time::{Duration, Instant};
use log::{debug, info, warn};

/// Performance metrics for SLMP operations
#[derive(Debug, Clone, Default)]
pub struct PerformanceMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
    pub avg_duration: Duration,
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed request
    pub fn record(&mut self, duration: Duration, success: bool) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
        self.total_duration += duration;
        self.min_duration = Some(self.min_duration.map_or(duration, |min| min.min(duration)));
        self.max_duration = Some(self.max_duration.map_or(duration, |max| max.max(duration)));
        self.avg_duration = self.total_duration / self.total_requests.min(u32::MAX as u64) as u32;
    }

    /// Success rate as percentage
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        (self.successful_requests as f64 / self.total_requests as f64) * 100.0
    }

    /// Requests per second of busy time
    pub fn requests_per_second(&self) -> f64 {
        if self.total_duration.is_zero() {
            return 0.0;
        }
        self.total_requests as f64 / self.total_duration.as_secs_f64()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Timer for measuring operation duration
pub struct OperationTimer {
    start: Instant,
    operation_name: &'static str,
}

impl OperationTimer {
    pub fn start(operation_name: &'static str) -> Self {
        debug!("Starting operation: {}", operation_name);
        Self {
            start: Instant::now(),
            operation_name,
        }
    }

    /// Time elapsed so far
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and log the result
    pub fn stop_and_log(self, success: bool) -> Duration {
        let duration = self.start.elapsed();
        if success {
            debug!("Operation '{}' succeeded in {:?}", self.operation_name, duration);
        } else {
            warn!("Operation '{}' failed after {:?}", self.operation_name, duration);
        }
        duration
    }
}

/// Request validation against protocol limits and device ranges
///
/// Every check returns the violations it found so a caller can merge the
/// results of several checks and fail once with the complete list.
pub mod validation {
    use crate::device::{DeviceAddress, DeviceCode, DeviceRanges};
    use crate::error::{SlmpError, SlmpResult, Violation};
    use crate::protocol::{BlockSpec, MAX_BIT_POINTS, MAX_BLOCKS, MAX_RANDOM_POINTS, MAX_WORD_POINTS};

    /// Turn collected violations into a result
    pub fn finish(violations: Vec<Violation>) -> SlmpResult<()> {
        if violations.is_empty() {
            Ok(())
        } else {
            Err(SlmpError::validation(violations))
        }
    }

    /// Device points covered by `words` word-unit points
    pub fn word_unit_span(device: DeviceCode, words: usize) -> u32 {
        let points = if device.is_bit_device() { words * 16 } else { words };
        points.min(u32::MAX as usize) as u32
    }

    /// Bit-unit device read/write
    pub fn check_bit_access(
        ranges: &DeviceRanges,
        device: DeviceCode,
        address: u32,
        count: usize,
        max_points: Option<usize>,
    ) -> Vec<Violation> {
        let mut out = Vec::new();
        if !device.is_bit_device() {
            out.push(Violation::at(device, address, "bit access requires a bit device"));
        }
        check_count(&mut out, device, address, count, max_points.map(|m| m.min(MAX_BIT_POINTS)));
        if count > 0 {
            out.extend(ranges.check_range(device, address, count.min(u32::MAX as usize) as u32));
        }
        out
    }

    /// Word-unit device read/write
    pub fn check_word_access(
        ranges: &DeviceRanges,
        device: DeviceCode,
        address: u32,
        count: usize,
        max_points: Option<usize>,
    ) -> Vec<Violation> {
        let mut out = Vec::new();
        check_count(&mut out, device, address, count, max_points.map(|m| m.min(MAX_WORD_POINTS)));
        if count > 0 {
            out.extend(ranges.check_range(device, address, word_unit_span(device, count)));
        }
        out
    }

    fn check_count(
        out: &mut Vec<Violation>,
        device: DeviceCode,
        address: u32,
        count: usize,
        max_points: Option<usize>,
    ) {
        if count == 0 {
            out.push(Violation::at(device, address, "count must be greater than 0"));
        }
        if let Some(max) = max_points {
            if count > max {
                out.push(Violation::at(
                    device,
                    address,
                    format!("count {} exceeds the per-request limit of {}", count, max),
                ));
            }
        }
    }

    /// Random read, random word write and monitor registration
    pub fn check_random(ranges: &DeviceRanges, words: &[DeviceAddress], dwords: &[DeviceAddress]) -> Vec<Violation> {
        let mut out = Vec::new();
        let total = words.len() + dwords.len();
        if total == 0 {
            out.push(Violation::general("at least one device is required"));
        }
        if total > MAX_RANDOM_POINTS {
            out.push(Violation::general(format!(
                "{} devices exceed the random access limit of {}",
                total, MAX_RANDOM_POINTS
            )));
        }
        for d in words {
            out.extend(ranges.check_range(d.device, d.address, word_unit_span(d.device, 1)));
        }
        for d in dwords {
            out.extend(ranges.check_range(d.device, d.address, word_unit_span(d.device, 2)));
        }
        out
    }

    /// Random bit write
    pub fn check_random_bits(ranges: &DeviceRanges, bits: &[DeviceAddress]) -> Vec<Violation> {
        let mut out = Vec::new();
        if bits.is_empty() {
            out.push(Violation::general("at least one device is required"));
        }
        if bits.len() > MAX_RANDOM_POINTS {
            out.push(Violation::general(format!(
                "{} devices exceed the random access limit of {}",
                bits.len(),
                MAX_RANDOM_POINTS
            )));
        }
        for d in bits {
            if !d.device.is_bit_device() {
                out.push(Violation::at(d.device, d.address, "bit access requires a bit device"));
            }
            out.extend(ranges.check_range(d.device, d.address, 1));
        }
        out
    }

    /// Block read/write; bit block counts are in 16-point words
    pub fn check_blocks(ranges: &DeviceRanges, word_blocks: &[BlockSpec], bit_blocks: &[BlockSpec]) -> Vec<Violation> {
        let mut out = Vec::new();
        let blocks = word_blocks.len() + bit_blocks.len();
        if blocks == 0 {
            out.push(Violation::general("at least one block is required"));
        }
        if blocks > MAX_BLOCKS {
            out.push(Violation::general(format!(
                "{} blocks exceed the limit of {}",
                blocks, MAX_BLOCKS
            )));
        }
        let total: usize = word_blocks.iter().chain(bit_blocks).map(|b| b.count as usize).sum();
        if total > MAX_WORD_POINTS {
            out.push(Violation::general(format!(
                "{} total block points exceed the limit of {}",
                total, MAX_WORD_POINTS
            )));
        }
        for b in word_blocks {
            out.extend(check_word_access(ranges, b.device, b.address, b.count as usize, Some(MAX_WORD_POINTS)));
        }
        for b in bit_blocks {
            if !b.device.is_bit_device() {
                out.push(Violation::at(b.device, b.address, "bit block requires a bit device"));
            }
            out.extend(check_word_access(ranges, b.device, b.address, b.count as usize, Some(MAX_WORD_POINTS)));
        }
        out
    }
}

/// Serde helper storing a `Duration` as whole milliseconds
pub mod serde_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;

    /// Format byte array as hex string
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        bytes.chunks(1).map(hex::encode_upper).collect::<Vec<_>>().join(" ")
    }

    /// Format word values as hex
    pub fn words_to_hex(words: &[u16]) -> String {
        words
            .iter()
            .map(|w| format!("{:04X}", w))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }

    /// Format performance metrics as a table
    pub fn format_metrics(metrics: &PerformanceMetrics) -> String {
        format!(
            "Performance Metrics:\n\
             ├─ Total Requests: {}\n\
             ├─ Successful: {} ({:.1}%)\n\
             ├─ Failed: {}\n\
             ├─ Average Duration: {}\n\
             ├─ Min Duration: {}\n\
             ├─ Max Duration: {}\n\
             └─ Requests/sec: {:.1}",
            metrics.total_requests,
            metrics.successful_requests,
            metrics.success_rate(),
            metrics.failed_requests,
            format_duration(metrics.avg_duration),
            metrics.min_duration.map_or("N/A".to_string(), format_duration),
            metrics.max_duration.map_or("N/A".to_string(), format_duration),
            metrics.requests_per_second()
        )
    }
}

/// Logging utilities
pub mod logging {
    use super::*;

    /// Initialize simple logger for testing
    pub fn init_test_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }

    /// Log an exchanged frame pair
    pub fn log_exchange(command: &str, request: &[u8], response: &[u8], duration: Duration) {
        info!(
            "{} | TX: {} | RX: {} | {}",
            command,
            format::bytes_to_hex(request),
            format::bytes_to_hex(response),
            format::format_duration(duration)
        );
    }
}
