//! Device operation dispatcher.
//!
//! [`SlmpClient`] is the public surface of the crate. Every operation is one
//! logical call: it is counted once in the statistics, validated before any
//! I/O, sent through the [`ConnectionManager`], and (for data operations)
//! routed through the [`ContinuityEngine`] when the PLC cannot be reached.
//! Each completed call is reported to the optional [`EventSink`].

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ConnectionSettings;
use crate::connection::{ConnectionManager, MonitorRegistration};
use crate::continuity::{ContinuityEngine, ContinuitySettings, OperationContext, Outcome};
use crate::device::{DeviceAddress, DeviceCode, DeviceRanges};
use crate::dword::{DwordItem, PseudoDwordSplitter, SplitterStats};
use crate::error::{SlmpError, SlmpResult, Violation};
use crate::logging::{CallbackLogger, EventSink, OperationEvent};
use crate::protocol::{
    payload, subcommand, BitBlock, BlockReadResult, BlockSpec, Command, RandomReadResult, Target, TypeName,
    WordBlock, MAX_BIT_POINTS, MAX_MEMORY_WORDS, MAX_RANDOM_POINTS, MAX_SELF_TEST_CHARS, MAX_WORD_POINTS,
};
use crate::statistics::{ErrorStatistics, StatisticsSummary};
use crate::transport::{SlmpTransport, TransportStats};
use crate::utils::{validation, OperationTimer, PerformanceMetrics};

pub use crate::connection::RequestOptions;

/// Basic device access shared by SLMP clients
///
/// Uses default [`RequestOptions`]; call the inherent methods on
/// [`SlmpClient`] for per-call timeouts and cancellation.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Read bit devices in bit units (command 0x0401, subcommand 0x0001)
    async fn read_bits(&self, device: DeviceCode, address: u32, count: u16) -> SlmpResult<Vec<bool>>;

    /// Read devices in word units (command 0x0401, subcommand 0x0000)
    async fn read_words(&self, device: DeviceCode, address: u32, count: u16) -> SlmpResult<Vec<u16>>;

    /// Write bit devices in bit units (command 0x1401, subcommand 0x0001)
    async fn write_bits(&self, device: DeviceCode, address: u32, values: &[bool]) -> SlmpResult<()>;

    /// Write devices in word units (command 0x1401, subcommand 0x0000)
    async fn write_words(&self, device: DeviceCode, address: u32, values: &[u16]) -> SlmpResult<()>;

    /// Check if the client is connected
    fn is_connected(&self) -> bool;

    /// Close the connection
    async fn close(&self) -> SlmpResult<()>;

    /// Get transport statistics
    fn get_stats(&self) -> TransportStats;
}

/// Values returned by [`SlmpClient::read_mixed_devices`], each in request order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixedReadResult {
    pub words: Vec<u16>,
    pub bits: Vec<bool>,
    pub dwords: Vec<u32>,
}

/// SLMP client for one PLC
pub struct SlmpClient {
    connection: ConnectionManager,
    engine: ContinuityEngine,
    splitter: PseudoDwordSplitter,
    events: Option<Arc<dyn EventSink>>,
    metrics: Mutex<PerformanceMetrics>,
}

impl SlmpClient {
    /// Client for `host` using the transport selected by `settings`.
    ///
    /// Settings are validated here; nothing is sent until [`SlmpClient::connect`].
    pub fn new(host: &str, settings: ConnectionSettings, target: Target) -> SlmpResult<Self> {
        settings.validate()?;
        Ok(Self::from_connection(ConnectionManager::new(host, settings, target)))
    }

    /// Client over a caller-supplied transport
    pub fn with_transport(
        transport: Arc<dyn SlmpTransport>,
        settings: ConnectionSettings,
        target: Target,
    ) -> SlmpResult<Self> {
        settings.validate()?;
        Ok(Self::from_connection(ConnectionManager::with_transport(
            transport, settings, target,
        )))
    }

    fn from_connection(connection: ConnectionManager) -> Self {
        let settings = connection.settings();
        let statistics = Arc::new(ErrorStatistics::new(
            settings.continuity.notification_window(),
            settings.continuity.enable_error_statistics,
        ));
        let engine = ContinuityEngine::new(settings.continuity.clone(), settings.retry.clone(), statistics);
        let splitter = PseudoDwordSplitter::new(settings.device_ranges.clone());
        Self {
            connection,
            engine,
            splitter,
            events: None,
            metrics: Mutex::new(PerformanceMetrics::new()),
        }
    }

    /// Report every completed operation to `sink`
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Trace request and response frames through `logger`
    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.connection = self.connection.with_logger(logger);
        self
    }

    /// Share an existing statistics tracker (for example one driven by a manual clock)
    pub fn with_statistics(mut self, statistics: Arc<ErrorStatistics>) -> Self {
        self.engine = ContinuityEngine::new(
            self.engine.settings().clone(),
            self.engine.retry_settings().clone(),
            statistics,
        );
        self
    }

    pub fn settings(&self) -> &ConnectionSettings {
        self.connection.settings()
    }

    pub fn target(&self) -> Target {
        self.connection.target()
    }

    pub fn statistics(&self) -> &Arc<ErrorStatistics> {
        self.engine.statistics()
    }

    pub fn statistics_summary(&self) -> StatisticsSummary {
        self.engine.statistics().summary()
    }

    pub fn reset_statistics(&self) {
        self.engine.statistics().reset();
        self.metrics.lock().unwrap_or_else(|e| e.into_inner()).reset();
    }

    pub fn splitter_stats(&self) -> SplitterStats {
        self.splitter.stats()
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.connection.transport_stats()
    }

    /// Timing of completed logical operations
    pub fn performance(&self) -> PerformanceMetrics {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Devices currently registered for monitoring
    pub fn monitor_registration(&self) -> Option<MonitorRegistration> {
        self.connection.monitor()
    }

    pub async fn connect(&self) -> SlmpResult<()> {
        self.connection.connect().await
    }

    pub async fn disconnect(&self) -> SlmpResult<()> {
        self.connection.disconnect().await
    }

    /// Local liveness check; nothing is sent to the PLC
    pub fn is_alive(&self) -> bool {
        self.connection.is_alive()
    }

    fn ranges(&self) -> &DeviceRanges {
        &self.connection.settings().device_ranges
    }

    fn point_limit(&self, limit: usize) -> Option<usize> {
        if self.connection.settings().auto_chunk {
            None
        } else {
            Some(limit)
        }
    }

    // ----- bit and word devices -----

    /// Read `count` bit devices starting at `address`
    pub async fn read_bit_devices(
        &self,
        device: DeviceCode,
        address: u32,
        count: u16,
        options: &RequestOptions,
    ) -> SlmpResult<Vec<bool>> {
        let count = count as usize;
        let violations =
            validation::check_bit_access(self.ranges(), device, address, count, self.point_limit(MAX_BIT_POINTS));
        self.run_data(
            OperationContext::at("ReadBitDevices", device, address),
            count,
            options,
            violations,
            move |s| vec![s.default_bit_value; count],
            move || self.read_bits_raw(device, address, count, options),
        )
        .await
    }

    /// Write consecutive bit devices starting at `address`
    pub async fn write_bit_devices(
        &self,
        device: DeviceCode,
        address: u32,
        values: &[bool],
        options: &RequestOptions,
    ) -> SlmpResult<()> {
        let violations = validation::check_bit_access(
            self.ranges(),
            device,
            address,
            values.len(),
            self.point_limit(MAX_BIT_POINTS),
        );
        self.run_data(
            OperationContext::at("WriteBitDevices", device, address),
            values.len(),
            options,
            violations,
            |_| (),
            move || self.write_bits_raw(device, address, values, options),
        )
        .await
    }

    /// Read `count` words starting at `address`
    ///
    /// On a bit device each word holds 16 consecutive points.
    pub async fn read_word_devices(
        &self,
        device: DeviceCode,
        address: u32,
        count: u16,
        options: &RequestOptions,
    ) -> SlmpResult<Vec<u16>> {
        let count = count as usize;
        let violations =
            validation::check_word_access(self.ranges(), device, address, count, self.point_limit(MAX_WORD_POINTS));
        self.run_data(
            OperationContext::at("ReadWordDevices", device, address),
            count,
            options,
            violations,
            move |s| vec![s.default_word_value; count],
            move || self.read_words_raw(device, address, count, options),
        )
        .await
    }

    /// Write consecutive words starting at `address`
    pub async fn write_word_devices(
        &self,
        device: DeviceCode,
        address: u32,
        values: &[u16],
        options: &RequestOptions,
    ) -> SlmpResult<()> {
        let violations = validation::check_word_access(
            self.ranges(),
            device,
            address,
            values.len(),
            self.point_limit(MAX_WORD_POINTS),
        );
        self.run_data(
            OperationContext::at("WriteWordDevices", device, address),
            values.len(),
            options,
            violations,
            |_| (),
            move || self.write_words_raw(device, address, values, options),
        )
        .await
    }

    // ----- pseudo-dwords -----

    /// Read `count` consecutive 32-bit values, each stored as low word then high word
    pub async fn read_dword_devices(
        &self,
        device: DeviceCode,
        address: u32,
        count: u16,
        options: &RequestOptions,
    ) -> SlmpResult<Vec<u32>> {
        let count = count as usize;
        let mut violations = validation::check_word_access(
            self.ranges(),
            device,
            address,
            count * 2,
            self.point_limit(MAX_WORD_POINTS),
        );
        if device.is_bit_device() {
            violations.push(Violation::at(device, address, "dword access requires a word device"));
        }
        let addresses: Vec<DeviceAddress> = (0..count as u32)
            .map(|i| DeviceAddress::new(device, address.saturating_add(i * 2)))
            .collect();
        let addresses = addresses.as_slice();

        self.run_data(
            OperationContext::at("ReadDwordDevices", device, address),
            count,
            options,
            violations,
            move |s| vec![s.default_dword_value(); count],
            move || async move {
                let words = self.read_words_raw(device, address, count * 2, options).await?;
                self.splitter.combine_words(addresses, &words)
            },
        )
        .await
    }

    /// Write consecutive 32-bit values as word pairs
    pub async fn write_dword_devices(
        &self,
        device: DeviceCode,
        address: u32,
        values: &[u32],
        options: &RequestOptions,
    ) -> SlmpResult<()> {
        let mut violations = validation::check_word_access(
            self.ranges(),
            device,
            address,
            values.len() * 2,
            self.point_limit(MAX_WORD_POINTS),
        );
        if device.is_bit_device() {
            violations.push(Violation::at(device, address, "dword access requires a word device"));
        }

        let mut words = Vec::with_capacity(values.len() * 2);
        if violations.is_empty() {
            let items: Vec<DwordItem> = values
                .iter()
                .zip((0u32..).map(|i| address.saturating_add(i * 2)))
                .map(|(&value, at)| DwordItem::new(device, at, value))
                .collect();
            match self.splitter.split(&items) {
                Ok(pairs) => words.extend(pairs.iter().flat_map(|p| [p.low.value, p.high.value])),
                Err(e) => violations.extend(e.violations().iter().cloned()),
            }
        }
        let words = words.as_slice();

        self.run_data(
            OperationContext::at("WriteDwordDevices", device, address),
            values.len(),
            options,
            violations,
            |_| (),
            move || self.write_words_raw(device, address, words, options),
        )
        .await
    }

    // ----- random access -----

    /// Read individual word and dword devices in one frame
    pub async fn read_random(
        &self,
        words: &[DeviceAddress],
        dwords: &[DeviceAddress],
        options: &RequestOptions,
    ) -> SlmpResult<RandomReadResult> {
        let violations = validation::check_random(self.ranges(), words, dwords);
        self.run_data(
            context("ReadRandom", words.iter().chain(dwords).next()),
            words.len() + dwords.len(),
            options,
            violations,
            move |s| RandomReadResult {
                words: vec![s.default_word_value; words.len()],
                dwords: vec![s.default_dword_value(); dwords.len()],
            },
            move || self.read_random_raw(words, dwords, options),
        )
        .await
    }

    /// Write individual bit devices in one frame
    pub async fn write_random_bits(&self, bits: &[(DeviceAddress, bool)], options: &RequestOptions) -> SlmpResult<()> {
        let addresses: Vec<DeviceAddress> = bits.iter().map(|(a, _)| *a).collect();
        let violations = validation::check_random_bits(self.ranges(), &addresses);
        self.run_data(
            context("WriteRandomBits", addresses.first()),
            bits.len(),
            options,
            violations,
            |_| (),
            move || async move {
                self.connection
                    .execute(
                        Command::DeviceWriteRandom,
                        subcommand::BIT_UNITS,
                        payload::random_bit_write(bits),
                        options,
                    )
                    .await
                    .map(|_| ())
            },
        )
        .await
    }

    /// Write individual word and dword devices in one frame
    pub async fn write_random_words(
        &self,
        words: &[(DeviceAddress, u16)],
        dwords: &[(DeviceAddress, u32)],
        options: &RequestOptions,
    ) -> SlmpResult<()> {
        let word_addresses: Vec<DeviceAddress> = words.iter().map(|(a, _)| *a).collect();
        let dword_addresses: Vec<DeviceAddress> = dwords.iter().map(|(a, _)| *a).collect();
        let violations = validation::check_random(self.ranges(), &word_addresses, &dword_addresses);
        self.run_data(
            context("WriteRandomWords", word_addresses.iter().chain(&dword_addresses).next()),
            words.len() + dwords.len(),
            options,
            violations,
            |_| (),
            move || async move {
                self.connection
                    .execute(
                        Command::DeviceWriteRandom,
                        subcommand::WORD_UNITS,
                        payload::random_word_write(words, dwords),
                        options,
                    )
                    .await
                    .map(|_| ())
            },
        )
        .await
    }

    // ----- block access -----

    /// Read word blocks and bit blocks in one frame
    ///
    /// Bit block counts are in 16-point words; each bit block yields `count * 16` points.
    pub async fn read_block(
        &self,
        word_blocks: &[BlockSpec],
        bit_blocks: &[BlockSpec],
        options: &RequestOptions,
    ) -> SlmpResult<BlockReadResult> {
        let violations = validation::check_blocks(self.ranges(), word_blocks, bit_blocks);
        let first = word_blocks.iter().chain(bit_blocks).next();
        self.run_data(
            block_context("ReadBlock", first),
            word_blocks.len() + bit_blocks.len(),
            options,
            violations,
            move |s| BlockReadResult {
                word_blocks: word_blocks
                    .iter()
                    .map(|b| vec![s.default_word_value; b.count as usize])
                    .collect(),
                bit_blocks: bit_blocks
                    .iter()
                    .map(|b| vec![s.default_bit_value; b.count as usize * 16])
                    .collect(),
            },
            move || async move {
                let data = self
                    .connection
                    .execute(
                        Command::DeviceReadBlock,
                        subcommand::WORD_UNITS,
                        payload::block_read(word_blocks, bit_blocks),
                        options,
                    )
                    .await?;
                payload::parse_blocks(&data, word_blocks, bit_blocks)
            },
        )
        .await
    }

    /// Write word blocks and bit blocks in one frame
    pub async fn write_block(
        &self,
        word_blocks: &[WordBlock],
        bit_blocks: &[BitBlock],
        options: &RequestOptions,
    ) -> SlmpResult<()> {
        let word_specs: Vec<BlockSpec> = word_blocks
            .iter()
            .map(|b| BlockSpec::new(b.device, b.address, clamp_u16(b.values.len())))
            .collect();
        let bit_specs: Vec<BlockSpec> = bit_blocks
            .iter()
            .map(|b| BlockSpec::new(b.device, b.address, clamp_u16(b.bits.len() / 16)))
            .collect();
        let mut violations = validation::check_blocks(self.ranges(), &word_specs, &bit_specs);
        for b in bit_blocks {
            if b.bits.is_empty() || b.bits.len() % 16 != 0 {
                violations.push(Violation::at(
                    b.device,
                    b.address,
                    format!("bit block length must be a positive multiple of 16, got {}", b.bits.len()),
                ));
            }
        }

        self.run_data(
            block_context("WriteBlock", word_specs.iter().chain(&bit_specs).next()),
            word_blocks.len() + bit_blocks.len(),
            options,
            violations,
            |_| (),
            move || async move {
                self.connection
                    .execute(
                        Command::DeviceWriteBlock,
                        subcommand::WORD_UNITS,
                        payload::block_write(word_blocks, bit_blocks),
                        options,
                    )
                    .await
                    .map(|_| ())
            },
        )
        .await
    }

    // ----- monitoring -----

    /// Register devices for [`SlmpClient::execute_monitor`].
    ///
    /// The registration is kept only when the PLC accepts it and is cleared on
    /// disconnect or reconnect.
    pub async fn entry_monitor_device(
        &self,
        words: &[DeviceAddress],
        dwords: &[DeviceAddress],
        options: &RequestOptions,
    ) -> SlmpResult<()> {
        let violations = validation::check_random(self.ranges(), words, dwords);
        self.run_data(
            context("EntryMonitorDevice", words.iter().chain(dwords).next()),
            words.len() + dwords.len(),
            options,
            violations,
            |_| (),
            move || async move {
                self.connection
                    .execute(
                        Command::EntryMonitorDevice,
                        subcommand::WORD_UNITS,
                        payload::random_read(words, dwords),
                        options,
                    )
                    .await?;
                self.connection.set_monitor(MonitorRegistration {
                    words: words.to_vec(),
                    dwords: dwords.to_vec(),
                });
                Ok(())
            },
        )
        .await
    }

    /// Read the current values of the registered devices
    pub async fn execute_monitor(&self, options: &RequestOptions) -> SlmpResult<RandomReadResult> {
        let registration = self.connection.monitor();
        let mut violations = Vec::new();
        if registration.is_none() {
            violations.push(Violation::general(
                "no devices registered; call entry_monitor_device first",
            ));
        }
        let registration = registration.unwrap_or_default();
        let (words, dwords) = (registration.words.len(), registration.dwords.len());

        self.run_data(
            OperationContext::new("ExecuteMonitor"),
            words + dwords,
            options,
            violations,
            move |s| RandomReadResult {
                words: vec![s.default_word_value; words],
                dwords: vec![s.default_dword_value(); dwords],
            },
            move || async move {
                let data = self
                    .connection
                    .execute(Command::ExecuteMonitor, subcommand::WORD_UNITS, Vec::new(), options)
                    .await?;
                payload::parse_random(&data, words, dwords)
            },
        )
        .await
    }

    // ----- buffer memory -----

    /// Read `length` bytes of intelligent-function buffer memory
    pub async fn memory_read(&self, address: u32, length: usize, options: &RequestOptions) -> SlmpResult<Vec<u8>> {
        let violations = self.memory_violations(length);
        self.run_data(
            OperationContext::new("MemoryRead"),
            length,
            options,
            violations,
            move |s| s.default_word_value.to_le_bytes().repeat(length / 2),
            move || async move {
                let data = self
                    .connection
                    .execute(
                        Command::MemoryRead,
                        0,
                        payload::memory_read(address, (length / 2) as u16),
                        options,
                    )
                    .await?;
                data.get(..length).map(<[u8]>::to_vec).ok_or_else(|| {
                    SlmpError::frame(format!(
                        "Memory read returned {} bytes, expected {}",
                        data.len(),
                        length
                    ))
                })
            },
        )
        .await
    }

    /// Write raw bytes to buffer memory; the length must be even
    pub async fn memory_write(&self, address: u32, data: &[u8], options: &RequestOptions) -> SlmpResult<()> {
        let violations = self.memory_violations(data.len());
        self.run_data(
            OperationContext::new("MemoryWrite"),
            data.len(),
            options,
            violations,
            |_| (),
            move || async move {
                self.connection
                    .execute(Command::MemoryWrite, 0, payload::memory_write(address, data), options)
                    .await
                    .map(|_| ())
            },
        )
        .await
    }

    fn memory_violations(&self, length: usize) -> Vec<Violation> {
        let mut out = Vec::new();
        if !self.connection.target().is_local() {
            out.push(Violation::general(
                "memory access is only supported on the local station",
            ));
        }
        if length == 0 || length % 2 != 0 {
            out.push(Violation::general(format!(
                "memory length must be a positive even number of bytes, got {}",
                length
            )));
        }
        if length / 2 > MAX_MEMORY_WORDS {
            out.push(Violation::general(format!(
                "{} words exceed the memory access limit of {}",
                length / 2,
                MAX_MEMORY_WORDS
            )));
        }
        out
    }

    // ----- diagnostics -----

    /// Read the CPU model name and code
    pub async fn read_type_name(&self, options: &RequestOptions) -> SlmpResult<TypeName> {
        self.run_diagnostic(OperationContext::new("ReadTypeName"), Vec::new(), || async move {
            let data = self
                .connection
                .execute(Command::ReadTypeName, 0, Vec::new(), options)
                .await?;
            payload::parse_type_name(&data)
        })
        .await
    }

    /// Loopback test; returns whether the PLC echoed `data` unchanged.
    ///
    /// `data` must be 1 to 960 hex digits.
    pub async fn self_test(&self, data: &str, options: &RequestOptions) -> SlmpResult<bool> {
        let mut violations = Vec::new();
        if data.is_empty() || data.len() > MAX_SELF_TEST_CHARS {
            violations.push(Violation::general(format!(
                "self test data must be 1-{} characters, got {}",
                MAX_SELF_TEST_CHARS,
                data.len()
            )));
        }
        if !data.chars().all(|c| c.is_ascii_hexdigit()) {
            violations.push(Violation::general("self test data must contain hex digits only"));
        }

        self.run_diagnostic(OperationContext::new("SelfTest"), violations, || async move {
            let reply = self
                .connection
                .execute(Command::SelfTest, 0, payload::self_test(data), options)
                .await?;
            let echoed = payload::parse_self_test(&reply)?;
            if echoed != data.as_bytes() {
                warn!(
                    "Self test echo mismatch: sent {} bytes, received {}",
                    data.len(),
                    String::from_utf8_lossy(&echoed)
                );
                return Ok(false);
            }
            Ok(true)
        })
        .await
    }

    /// Clear the CPU error state
    pub async fn clear_error(&self, options: &RequestOptions) -> SlmpResult<()> {
        self.run_diagnostic(OperationContext::new("ClearError"), Vec::new(), || async move {
            self.connection
                .execute(Command::ClearError, 0, Vec::new(), options)
                .await
                .map(|_| ())
        })
        .await
    }

    // ----- mixed devices -----

    /// Read words, bits and dwords together.
    ///
    /// Dwords are split into word pairs and read with the plain words through
    /// random read; bits are read at the same time, with a single bit read when
    /// they are consecutive in request order. Results keep request order.
    pub async fn read_mixed_devices(
        &self,
        words: &[DeviceAddress],
        bits: &[DeviceAddress],
        dwords: &[DeviceAddress],
        options: &RequestOptions,
    ) -> SlmpResult<MixedReadResult> {
        let mut violations = Vec::new();
        let total = words.len() + bits.len() + dwords.len();
        if total == 0 {
            violations.push(Violation::general("at least one device is required"));
        }
        if dwords.len() > MAX_WORD_POINTS / 2 {
            violations.push(Violation::general(format!(
                "{} dwords exceed the limit of {}",
                dwords.len(),
                MAX_WORD_POINTS / 2
            )));
        }
        if words.len() + dwords.len() * 2 > MAX_WORD_POINTS {
            violations.push(Violation::general(format!(
                "{} words including expanded dwords exceed the limit of {}",
                words.len() + dwords.len() * 2,
                MAX_WORD_POINTS
            )));
        }
        if bits.len() > MAX_BIT_POINTS {
            violations.push(Violation::general(format!(
                "{} bits exceed the limit of {}",
                bits.len(),
                MAX_BIT_POINTS
            )));
        }
        if total > MAX_RANDOM_POINTS {
            violations.push(Violation::general(format!(
                "{} devices exceed the random access limit of {}",
                total, MAX_RANDOM_POINTS
            )));
        }
        for d in words {
            violations.extend(self.ranges().check_range(d.device, d.address, validation::word_unit_span(d.device, 1)));
        }
        for d in bits {
            if !d.device.is_bit_device() {
                violations.push(Violation::at(d.device, d.address, "bit access requires a bit device"));
            }
            violations.extend(self.ranges().check_range(d.device, d.address, 1));
        }
        let expanded = match self.splitter.split_addresses(dwords) {
            Ok(expanded) => expanded,
            Err(e) => {
                violations.extend(e.violations().iter().cloned());
                Vec::new()
            }
        };
        let word_list: Vec<DeviceAddress> = words.iter().copied().chain(expanded).collect();
        let word_list = word_list.as_slice();

        debug!(
            "Reading mixed devices: {} words, {} bits, {} dwords",
            words.len(),
            bits.len(),
            dwords.len()
        );
        self.run_data(
            context("ReadMixedDevices", words.iter().chain(bits).chain(dwords).next()),
            total,
            options,
            violations,
            move |s| MixedReadResult {
                words: vec![s.default_word_value; words.len()],
                bits: vec![s.default_bit_value; bits.len()],
                dwords: vec![s.default_dword_value(); dwords.len()],
            },
            move || async move {
                let word_read = async {
                    let mut values = Vec::with_capacity(word_list.len());
                    for chunk in word_list.chunks(MAX_RANDOM_POINTS) {
                        values.extend(self.read_random_raw(chunk, &[], options).await?.words);
                    }
                    Ok::<_, SlmpError>(values)
                };
                let (values, bit_values) = tokio::try_join!(word_read, self.read_bit_list(bits, options))?;
                let (word_values, dword_words) = values.split_at(words.len().min(values.len()));
                let dword_values = self.splitter.combine_words(dwords, dword_words)?;
                Ok(MixedReadResult {
                    words: word_values.to_vec(),
                    bits: bit_values,
                    dwords: dword_values,
                })
            },
        )
        .await
    }

    // ----- wire helpers -----

    async fn read_bits_raw(
        &self,
        device: DeviceCode,
        address: u32,
        count: usize,
        options: &RequestOptions,
    ) -> SlmpResult<Vec<bool>> {
        let mut bits = Vec::with_capacity(count);
        for (offset, len) in chunk_spans(count, MAX_BIT_POINTS) {
            let data = self
                .connection
                .execute(
                    Command::DeviceRead,
                    subcommand::BIT_UNITS,
                    payload::device_read(device, address + offset as u32, len as u16),
                    options,
                )
                .await?;
            bits.extend(payload::unpack_bits_nibble(&data, len)?);
        }
        Ok(bits)
    }

    async fn write_bits_raw(
        &self,
        device: DeviceCode,
        address: u32,
        values: &[bool],
        options: &RequestOptions,
    ) -> SlmpResult<()> {
        for (offset, len) in chunk_spans(values.len(), MAX_BIT_POINTS) {
            self.connection
                .execute(
                    Command::DeviceWrite,
                    subcommand::BIT_UNITS,
                    payload::bit_write(device, address + offset as u32, &values[offset..offset + len]),
                    options,
                )
                .await?;
        }
        Ok(())
    }

    async fn read_words_raw(
        &self,
        device: DeviceCode,
        address: u32,
        count: usize,
        options: &RequestOptions,
    ) -> SlmpResult<Vec<u16>> {
        let mut words = Vec::with_capacity(count);
        for (offset, len) in chunk_spans(count, MAX_WORD_POINTS) {
            let start = address + validation::word_unit_span(device, offset);
            let data = self
                .connection
                .execute(
                    Command::DeviceRead,
                    subcommand::WORD_UNITS,
                    payload::device_read(device, start, len as u16),
                    options,
                )
                .await?;
            words.extend(payload::parse_words(&data, len)?);
        }
        Ok(words)
    }

    async fn write_words_raw(
        &self,
        device: DeviceCode,
        address: u32,
        values: &[u16],
        options: &RequestOptions,
    ) -> SlmpResult<()> {
        for (offset, len) in chunk_spans(values.len(), MAX_WORD_POINTS) {
            let start = address + validation::word_unit_span(device, offset);
            self.connection
                .execute(
                    Command::DeviceWrite,
                    subcommand::WORD_UNITS,
                    payload::word_write(device, start, &values[offset..offset + len]),
                    options,
                )
                .await?;
        }
        Ok(())
    }

    async fn read_random_raw(
        &self,
        words: &[DeviceAddress],
        dwords: &[DeviceAddress],
        options: &RequestOptions,
    ) -> SlmpResult<RandomReadResult> {
        let data = self
            .connection
            .execute(
                Command::DeviceReadRandom,
                subcommand::WORD_UNITS,
                payload::random_read(words, dwords),
                options,
            )
            .await?;
        payload::parse_random(&data, words.len(), dwords.len())
    }

    async fn read_bit_list(&self, bits: &[DeviceAddress], options: &RequestOptions) -> SlmpResult<Vec<bool>> {
        match bits.first() {
            None => Ok(Vec::new()),
            Some(first) if is_consecutive(bits) => {
                self.read_bits_raw(first.device, first.address, bits.len(), options)
                    .await
            }
            Some(_) => {
                let reads = bits
                    .iter()
                    .map(|d| self.read_bits_raw(d.device, d.address, 1, options));
                Ok(try_join_all(reads).await?.into_iter().flatten().collect())
            }
        }
    }

    // ----- operation plumbing -----

    /// Run a data operation through validation, the continuity engine and reporting
    async fn run_data<T, D, F, Fut>(
        &self,
        ctx: OperationContext,
        count: usize,
        options: &RequestOptions,
        violations: Vec<Violation>,
        default: D,
        mut op: F,
    ) -> SlmpResult<T>
    where
        D: FnOnce(&ContinuitySettings) -> T,
        F: FnMut() -> Fut,
        Fut: Future<Output = SlmpResult<T>>,
    {
        self.engine.statistics().record_operation();
        let timer = OperationTimer::start(ctx.operation);
        let attempts = AtomicU32::new(0);

        let outcome = match validation::finish(violations) {
            Ok(()) => {
                self.engine
                    .run(&ctx, options.cancel.as_ref(), default, || {
                        attempts.fetch_add(1, Ordering::Relaxed);
                        op()
                    })
                    .await
            }
            Err(error) => {
                self.engine.record_failure(&ctx, &error);
                Err(error)
            }
        };
        self.complete(&ctx, count, timer, attempts.load(Ordering::Relaxed), outcome)
    }

    /// Run a diagnostic command; failures always reach the caller
    async fn run_diagnostic<T, F, Fut>(&self, ctx: OperationContext, violations: Vec<Violation>, op: F) -> SlmpResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SlmpResult<T>>,
    {
        self.engine.statistics().record_operation();
        let timer = OperationTimer::start(ctx.operation);

        let (outcome, attempts) = match validation::finish(violations) {
            Ok(()) => (op().await, 1),
            Err(error) => (Err(error), 0),
        };
        if let Err(error) = &outcome {
            if !matches!(error, SlmpError::Cancelled { .. }) {
                self.engine.record_failure(&ctx, error);
            }
        }
        let outcome = outcome.map(|value| Outcome {
            value,
            substituted: false,
            attempts,
            error: None,
        });
        self.complete(&ctx, 0, timer, attempts, outcome)
    }

    fn complete<T>(
        &self,
        ctx: &OperationContext,
        count: usize,
        timer: OperationTimer,
        attempts: u32,
        outcome: SlmpResult<Outcome<T>>,
    ) -> SlmpResult<T> {
        let success = matches!(&outcome, Ok(o) if !o.substituted);
        let response_time = timer.stop_and_log(success);
        self.metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(response_time, success);

        if let Some(sink) = &self.events {
            let (substituted, error) = match &outcome {
                Ok(o) => (o.substituted, o.error.as_ref().map(|e| e.to_string())),
                Err(e) => (false, Some(e.to_string())),
            };
            sink.emit(OperationEvent {
                timestamp: Utc::now(),
                operation: ctx.operation,
                device: ctx.device,
                address: ctx.address,
                count,
                success,
                substituted,
                attempts,
                response_time,
                error,
            });
        }

        outcome.map(|o| {
            if o.substituted {
                debug!("{} completed with default values after {} attempt(s)", ctx.operation, o.attempts);
            }
            o.value
        })
    }
}

#[async_trait]
impl DeviceClient for SlmpClient {
    async fn read_bits(&self, device: DeviceCode, address: u32, count: u16) -> SlmpResult<Vec<bool>> {
        self.read_bit_devices(device, address, count, &RequestOptions::default())
            .await
    }

    async fn read_words(&self, device: DeviceCode, address: u32, count: u16) -> SlmpResult<Vec<u16>> {
        self.read_word_devices(device, address, count, &RequestOptions::default())
            .await
    }

    async fn write_bits(&self, device: DeviceCode, address: u32, values: &[bool]) -> SlmpResult<()> {
        self.write_bit_devices(device, address, values, &RequestOptions::default())
            .await
    }

    async fn write_words(&self, device: DeviceCode, address: u32, values: &[u16]) -> SlmpResult<()> {
        self.write_word_devices(device, address, values, &RequestOptions::default())
            .await
    }

    fn is_connected(&self) -> bool {
        self.is_alive()
    }

    async fn close(&self) -> SlmpResult<()> {
        self.disconnect().await
    }

    fn get_stats(&self) -> TransportStats {
        self.transport_stats()
    }
}

fn context(operation: &'static str, first: Option<&DeviceAddress>) -> OperationContext {
    match first {
        Some(d) => OperationContext::at(operation, d.device, d.address),
        None => OperationContext::new(operation),
    }
}

fn block_context(operation: &'static str, first: Option<&BlockSpec>) -> OperationContext {
    match first {
        Some(b) => OperationContext::at(operation, b.device, b.address),
        None => OperationContext::new(operation),
    }
}

/// `(offset, len)` spans covering `count` points in frames of at most `limit`
fn chunk_spans(count: usize, limit: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..count).step_by(limit).map(move |offset| (offset, limit.min(count - offset)))
}

fn is_consecutive(devices: &[DeviceAddress]) -> bool {
    devices
        .windows(2)
        .all(|w| w[0].device == w[1].device && w[0].address.checked_add(1) == Some(w[1].address))
}

fn clamp_u16(value: usize) -> u16 {
    value.min(u16::MAX as usize) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuity::{ErrorHandlingMode, RetrySettings};
    use crate::protocol::{end_code, RequestFrame, ResponseFrame};
    use crate::statistics::ErrorKey;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    type Handler = Box<dyn Fn(&RequestFrame, usize) -> SlmpResult<Vec<u8>> + Send + Sync>;

    /// Answers every request through `handler`; `Err(Protocol)` becomes an end-code response
    struct ScriptedTransport {
        handler: Handler,
        requests: Mutex<Vec<RequestFrame>>,
        connected: AtomicBool,
    }

    impl ScriptedTransport {
        fn new<H>(handler: H) -> Arc<Self>
        where
            H: Fn(&RequestFrame, usize) -> SlmpResult<Vec<u8>> + Send + Sync + 'static,
        {
            Arc::new(Self {
                handler: Box::new(handler),
                requests: Mutex::new(Vec::new()),
                connected: AtomicBool::new(false),
            })
        }

        fn requests(&self) -> Vec<RequestFrame> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SlmpTransport for ScriptedTransport {
        async fn connect(&self) -> SlmpResult<()> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn exchange(&self, request: &[u8], serial: u16, _timeout: Duration) -> SlmpResult<Vec<u8>> {
            let frame = RequestFrame::decode(request)?;
            let index = {
                let mut requests = self.requests.lock().unwrap();
                requests.push(frame.clone());
                requests.len() - 1
            };
            match (self.handler)(&frame, index) {
                Ok(data) => Ok(ResponseFrame::success(frame.version, serial, frame.target, data).encode()),
                Err(SlmpError::Protocol { end_code, .. }) => {
                    Ok(ResponseFrame::failure(frame.version, serial, frame.target, end_code).encode())
                }
                Err(e) => Err(e),
            }
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn close(&self) -> SlmpResult<()> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn get_stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    fn words_le(words: &[u16]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn settings(mode: ErrorHandlingMode) -> ConnectionSettings {
        let mut settings = ConnectionSettings::default().with_mode(mode);
        settings.continuity.enable_continuity_logging = false;
        settings
    }

    async fn client_with(transport: Arc<ScriptedTransport>, settings: ConnectionSettings) -> SlmpClient {
        let client = SlmpClient::with_transport(transport, settings, Target::local()).unwrap();
        client.connect().await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_word_read_decodes_little_endian() {
        let transport = ScriptedTransport::new(|_, _| Ok(vec![0x01, 0x00, 0x34, 0x12, 0xFF, 0xFF, 0x00, 0x80]));
        let client = client_with(transport.clone(), settings(ErrorHandlingMode::ThrowException)).await;

        let values = client
            .read_word_devices(DeviceCode::D, 100, 4, &RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(values, vec![0x0001, 0x1234, 0xFFFF, 0x8000]);
        assert_eq!(client.statistics().total_operations(), 1);

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].command, Command::DeviceRead.to_u16());
        assert_eq!(requests[0].subcommand, subcommand::WORD_UNITS);
        assert_eq!(requests[0].payload, payload::device_read(DeviceCode::D, 100, 4));
    }

    #[tokio::test]
    async fn test_return_default_substitutes_once_per_call() {
        let transport = ScriptedTransport::new(|_, _| Err(SlmpError::connection("connection refused")));
        let client = client_with(transport.clone(), settings(ErrorHandlingMode::ReturnDefaultAndContinue)).await;

        let values = client
            .read_word_devices(DeviceCode::D, 200, 2, &RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(values, vec![0, 0]);

        let stats = client.statistics();
        assert_eq!(stats.total_operations(), 1);
        assert_eq!(stats.total_errors(), 1);
        assert_eq!(stats.total_continued_operations(), 1);
        assert_eq!(transport.requests().len(), 1);

        let key = ErrorKey::new("ConnectionError", DeviceCode::D, 200);
        assert_eq!(stats.counter(&key).map(|c| c.count), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_default_recovers() {
        let transport = ScriptedTransport::new(|frame, index| {
            if index < 2 {
                Err(SlmpError::timeout("Device Read", 1000))
            } else {
                Ok(payload::pack_bits_nibble(&vec![true; frame.payload[4] as usize]))
            }
        });
        let client = client_with(transport.clone(), settings(ErrorHandlingMode::RetryThenDefault)).await;

        let bits = client
            .read_bit_devices(DeviceCode::M, 0, 3, &RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(bits, vec![true, true, true]);
        assert_eq!(transport.requests().len(), 3);
        assert_eq!(client.statistics().total_errors(), 2);
        assert_eq!(client.statistics().total_continued_operations(), 0);
    }

    #[tokio::test]
    async fn test_throw_exception_propagates_end_code() {
        let transport = ScriptedTransport::new(|_, _| Err(SlmpError::protocol(end_code::DEVICE_OUT_OF_RANGE)));
        let client = client_with(transport, settings(ErrorHandlingMode::ThrowException)).await;

        let err = client
            .write_word_devices(DeviceCode::D, 0, &[1, 2], &RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.end_code(), Some(end_code::DEVICE_OUT_OF_RANGE));
        assert_eq!(client.statistics().total_errors(), 1);
    }

    #[tokio::test]
    async fn test_validation_failure_is_never_sent() {
        let transport = ScriptedTransport::new(|_, _| Ok(Vec::new()));
        let client = client_with(transport.clone(), settings(ErrorHandlingMode::ReturnDefaultAndContinue)).await;

        let err = client
            .read_word_devices(DeviceCode::D, 65_534, 4, &RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SlmpError::Validation { .. }));
        assert_eq!(err.violations()[0].device, Some(DeviceCode::D));

        let err = client
            .read_word_devices(DeviceCode::D, 0, 961, &RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SlmpError::Validation { .. }));

        assert!(transport.requests().is_empty());
        assert_eq!(client.statistics().total_operations(), 2);
        assert_eq!(client.statistics().total_errors(), 2);
        assert_eq!(client.statistics().total_continued_operations(), 0);
    }

    #[tokio::test]
    async fn test_auto_chunk_splits_large_reads() {
        let transport = ScriptedTransport::new(|frame, _| {
            let count = u16::from_le_bytes([frame.payload[4], frame.payload[5]]);
            Ok(words_le(&vec![7; count as usize]))
        });
        let mut settings = settings(ErrorHandlingMode::ThrowException);
        settings.auto_chunk = true;
        let client = client_with(transport.clone(), settings).await;

        let values = client
            .read_word_devices(DeviceCode::D, 0, 1000, &RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(values.len(), 1000);

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].payload, payload::device_read(DeviceCode::D, 0, 960));
        assert_eq!(requests[1].payload, payload::device_read(DeviceCode::D, 960, 40));
    }

    #[tokio::test]
    async fn test_dword_read_and_write() {
        let transport = ScriptedTransport::new(|frame, _| {
            if frame.command == Command::DeviceRead.to_u16() {
                Ok(words_le(&[0x5678, 0x1234, 0xFFFF, 0x0000]))
            } else {
                Ok(Vec::new())
            }
        });
        let client = client_with(transport.clone(), settings(ErrorHandlingMode::ThrowException)).await;
        let options = RequestOptions::default();

        let values = client
            .read_dword_devices(DeviceCode::D, 10, 2, &options)
            .await
            .unwrap();
        assert_eq!(values, vec![0x1234_5678, 0x0000_FFFF]);

        client
            .write_dword_devices(DeviceCode::D, 20, &[0xDEAD_BEEF], &options)
            .await
            .unwrap();
        let requests = transport.requests();
        assert_eq!(requests[1].payload, payload::word_write(DeviceCode::D, 20, &[0xBEEF, 0xDEAD]));

        let stats = client.splitter_stats();
        assert_eq!(stats.total_conversions, 1);
        assert_eq!(stats.dwords_generated, 2);
    }

    #[tokio::test]
    async fn test_dword_write_at_last_address_rejected() {
        let transport = ScriptedTransport::new(|_, _| Ok(Vec::new()));
        let client = client_with(transport.clone(), settings(ErrorHandlingMode::ReturnDefaultAndContinue)).await;

        let err = client
            .write_dword_devices(DeviceCode::D, 65_535, &[1], &RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SlmpError::Validation { .. }));
        assert!(err.to_string().contains("D65535"));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_monitor_requires_registration() {
        let transport = ScriptedTransport::new(|_, _| Ok(words_le(&[5, 0x0002, 0x0001])));
        let client = client_with(transport.clone(), settings(ErrorHandlingMode::ReturnDefaultAndContinue)).await;
        let options = RequestOptions::default();

        let err = client.execute_monitor(&options).await.unwrap_err();
        assert!(matches!(err, SlmpError::Validation { .. }));

        let words = [DeviceAddress::new(DeviceCode::D, 0)];
        let dwords = [DeviceAddress::new(DeviceCode::W, 0x10)];
        client.entry_monitor_device(&words, &dwords, &options).await.unwrap();
        assert_eq!(
            client.monitor_registration().map(|r| (r.words.len(), r.dwords.len())),
            Some((1, 1))
        );

        let result = client.execute_monitor(&options).await.unwrap();
        assert_eq!(result.words, vec![5]);
        assert_eq!(result.dwords, vec![0x0001_0002]);

        client.disconnect().await.unwrap();
        assert!(client.monitor_registration().is_none());
    }

    #[tokio::test]
    async fn test_memory_access_rules() {
        let transport = ScriptedTransport::new(|_, _| Ok(vec![0x11, 0x22, 0x33, 0x44]));
        let client = client_with(transport.clone(), settings(ErrorHandlingMode::ThrowException)).await;
        let options = RequestOptions::default();

        assert_eq!(client.memory_read(0x100, 4, &options).await.unwrap(), vec![0x11, 0x22, 0x33, 0x44]);
        assert!(client.memory_write(0x100, &[1, 2, 3], &options).await.is_err());

        let remote = SlmpClient::with_transport(
            transport.clone(),
            settings(ErrorHandlingMode::ThrowException),
            Target::new(1, 2, 0x03FF, 0),
        )
        .unwrap();
        remote.connect().await.unwrap();
        let err = remote.memory_read(0x100, 4, &options).await.unwrap_err();
        assert!(err.to_string().contains("local station"));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_diagnostics_always_propagate() {
        let transport = ScriptedTransport::new(|_, _| Err(SlmpError::connection("reset")));
        let client = client_with(transport, settings(ErrorHandlingMode::ReturnDefaultAndContinue)).await;
        let options = RequestOptions::default();

        assert!(client.read_type_name(&options).await.is_err());
        assert!(client.clear_error(&options).await.is_err());
        assert_eq!(client.statistics().total_errors(), 2);
        assert_eq!(client.statistics().total_continued_operations(), 0);
    }

    #[tokio::test]
    async fn test_self_test_echo() {
        let transport = ScriptedTransport::new(|frame, _| Ok(frame.payload.clone()));
        let client = client_with(transport, settings(ErrorHandlingMode::ThrowException)).await;
        let options = RequestOptions::default();

        assert!(client.self_test("ABCDEF0123", &options).await.unwrap());
        let err = client.self_test("not hex", &options).await.unwrap_err();
        assert!(matches!(err, SlmpError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_mixed_read_keeps_request_order() {
        let transport = ScriptedTransport::new(|frame, _| {
            if frame.command == Command::DeviceReadRandom.to_u16() {
                // D5, then the D100/D101 pair
                Ok(words_le(&[55, 0x0002, 0x0001]))
            } else {
                let address = u32::from_le_bytes([frame.payload[0], frame.payload[1], frame.payload[2], 0]);
                Ok(vec![if address == 3 { 0x10 } else { 0x00 }])
            }
        });
        let client = client_with(transport.clone(), settings(ErrorHandlingMode::ThrowException)).await;

        let result = client
            .read_mixed_devices(
                &[DeviceAddress::new(DeviceCode::D, 5)],
                &[DeviceAddress::new(DeviceCode::M, 3), DeviceAddress::new(DeviceCode::M, 1)],
                &[DeviceAddress::new(DeviceCode::D, 100)],
                &RequestOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.words, vec![55]);
        assert_eq!(result.bits, vec![true, false]);
        assert_eq!(result.dwords, vec![0x0001_0002]);
        // one random read plus one bit read per non-consecutive bit
        assert_eq!(transport.requests().len(), 3);
        assert_eq!(client.statistics().total_operations(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_call_is_not_recorded() {
        let transport = ScriptedTransport::new(|_, _| Ok(Vec::new()));
        let client = client_with(transport.clone(), settings(ErrorHandlingMode::ReturnDefaultAndContinue)).await;

        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let options = RequestOptions::new().with_cancel(token);
        let err = client
            .read_word_devices(DeviceCode::D, 0, 1, &options)
            .await
            .unwrap_err();
        assert!(matches!(err, SlmpError::Cancelled { .. }));
        assert_eq!(client.statistics().total_errors(), 0);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_events_reach_sink() {
        let transport = ScriptedTransport::new(|_, _| Err(SlmpError::connection("down")));
        let (sink, mut events) = crate::logging::ChannelEventSink::new(8);
        let client = client_with(transport, settings(ErrorHandlingMode::ReturnDefaultAndContinue))
            .await
            .with_event_sink(Arc::new(sink));

        client
            .read_bit_devices(DeviceCode::X, 0x10, 4, &RequestOptions::default())
            .await
            .unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.operation, "ReadBitDevices");
        assert_eq!(event.device, Some(DeviceCode::X));
        assert_eq!(event.address, Some(0x10));
        assert_eq!(event.count, 4);
        assert!(!event.success);
        assert!(event.substituted);
        assert_eq!(event.attempts, 1);
        assert!(event.error.unwrap().contains("down"));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let transport = ScriptedTransport::new(|_, _| Ok(Vec::new()));
        let settings = ConnectionSettings {
            retry: RetrySettings {
                backoff_multiplier: 0.5,
                ..RetrySettings::default()
            },
            ..ConnectionSettings::default()
        };
        assert!(matches!(
            SlmpClient::with_transport(transport, settings, Target::local()),
            Err(SlmpError::Configuration { .. })
        ));
    }

    #[test]
    fn test_chunk_spans() {
        assert_eq!(chunk_spans(1000, 960).collect::<Vec<_>>(), vec![(0, 960), (960, 40)]);
        assert_eq!(chunk_spans(960, 960).collect::<Vec<_>>(), vec![(0, 960)]);
        assert_eq!(chunk_spans(0, 960).count(), 0);
    }
}
