//! In-process SLMP PLC simulator
//!
//! Serves 3E and 4E binary frames over TCP or UDP against a [`DeviceMemory`].
//! It answers every command the client issues and supports failure injection
//! (forced end codes, delayed responses, dropped requests) so continuity
//! behaviour can be exercised without a real PLC.

use std::collections::HashMap;
use std::io::{self, Cursor};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;

use crate::config::TransportKind;
use crate::connection::MonitorRegistration;
use crate::device::{DeviceAddress, DeviceCode, DeviceRanges};
use crate::dword::combine_words;
use crate::error::{SlmpError, SlmpResult};
use crate::protocol::{
    end_code, payload, subcommand, Command, FrameVersion, RequestFrame, ResponseFrame, MAX_BIT_POINTS,
    MAX_BLOCKS, MAX_MEMORY_WORDS, MAX_RANDOM_POINTS, MAX_WORD_POINTS,
};

/// Largest datagram accepted by the UDP listener
const MAX_DATAGRAM: usize = 8192;

/// Device storage for the simulator
///
/// Bit devices store points, word devices store 16-bit values. Word access to
/// a bit device packs 16 points LSB first. Unset devices read as zero.
#[derive(Debug, Clone, Default)]
pub struct DeviceMemory {
    bits: Arc<RwLock<HashMap<(DeviceCode, u32), bool>>>,
    words: Arc<RwLock<HashMap<(DeviceCode, u32), u16>>>,
    buffer: Arc<RwLock<HashMap<u32, u16>>>,
}

impl DeviceMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_bits(&self, device: DeviceCode, address: u32, count: usize) -> Vec<bool> {
        let bits = self.bits.read().unwrap_or_else(|e| e.into_inner());
        (0..count as u32)
            .map(|i| bits.get(&(device, address + i)).copied().unwrap_or(false))
            .collect()
    }

    pub fn write_bits(&self, device: DeviceCode, address: u32, values: &[bool]) {
        let mut bits = self.bits.write().unwrap_or_else(|e| e.into_inner());
        for (i, &value) in values.iter().enumerate() {
            bits.insert((device, address + i as u32), value);
        }
    }

    pub fn read_words(&self, device: DeviceCode, address: u32, count: usize) -> Vec<u16> {
        if device.is_bit_device() {
            return payload::bits_to_words(&self.read_bits(device, address, count * 16));
        }
        let words = self.words.read().unwrap_or_else(|e| e.into_inner());
        (0..count as u32)
            .map(|i| words.get(&(device, address + i)).copied().unwrap_or(0))
            .collect()
    }

    pub fn write_words(&self, device: DeviceCode, address: u32, values: &[u16]) {
        if device.is_bit_device() {
            self.write_bits(device, address, &payload::words_to_bits(values));
            return;
        }
        let mut words = self.words.write().unwrap_or_else(|e| e.into_inner());
        for (i, &value) in values.iter().enumerate() {
            words.insert((device, address + i as u32), value);
        }
    }

    /// Low word at `address`, high word at `address + 1`
    pub fn read_dword(&self, device: DeviceCode, address: u32) -> u32 {
        let words = self.read_words(device, address, 2);
        combine_words(words[0], words[1])
    }

    pub fn write_dword(&self, device: DeviceCode, address: u32, value: u32) {
        self.write_words(device, address, &[(value & 0xFFFF) as u16, (value >> 16) as u16]);
    }

    pub fn read_buffer(&self, address: u32, words: usize) -> Vec<u16> {
        let buffer = self.buffer.read().unwrap_or_else(|e| e.into_inner());
        (0..words as u32)
            .map(|i| buffer.get(&(address + i)).copied().unwrap_or(0))
            .collect()
    }

    pub fn write_buffer(&self, address: u32, values: &[u16]) {
        let mut buffer = self.buffer.write().unwrap_or_else(|e| e.into_inner());
        for (i, &value) in values.iter().enumerate() {
            buffer.insert(address + i as u32, value);
        }
    }

    /// Forget every stored value
    pub fn clear(&self) {
        self.bits.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.words.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.buffer.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn get_stats(&self) -> MemoryStats {
        MemoryStats {
            bit_points: self.bits.read().map(|b| b.len()).unwrap_or(0),
            word_points: self.words.read().map(|w| w.len()).unwrap_or(0),
            buffer_words: self.buffer.read().map(|b| b.len()).unwrap_or(0),
        }
    }
}

/// Number of stored points per area
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub bit_points: usize,
    pub word_points: usize,
    pub buffer_words: usize,
}

/// Simulator configuration
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Use port 0 to let the OS pick one; see [`PlcSimulator::local_addr`]
    pub bind_address: SocketAddr,
    pub transport: TransportKind,
    /// Model name reported by Read Type Name (at most 16 characters)
    pub model: String,
    pub model_code: u16,
    pub device_ranges: DeviceRanges,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 5000)),
            transport: TransportKind::Tcp,
            model: "Q03UDVCPU".to_string(),
            model_code: 0x0366,
            device_ranges: DeviceRanges::default(),
        }
    }
}

/// Simulator counters
#[derive(Debug, Clone, Default)]
pub struct SimulatorStats {
    pub connections_count: u64,
    pub total_requests: u64,
    pub error_responses: u64,
    pub dropped_requests: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub uptime_seconds: u64,
    pub memory: MemoryStats,
}

#[derive(Debug, Default)]
struct Counters {
    connections: AtomicU64,
    requests: AtomicU64,
    error_responses: AtomicU64,
    dropped: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

/// Failure injection switches
#[derive(Debug, Default)]
struct Faults {
    forced_end_code: Mutex<Option<u16>>,
    delay_ms: AtomicU64,
    drop_next: AtomicU32,
    /// `f32` bits of the random failure probability
    error_rate: AtomicU32,
}

/// State shared by every connection of one simulator
#[derive(Clone)]
struct Shared {
    memory: DeviceMemory,
    ranges: DeviceRanges,
    model: String,
    model_code: u16,
    faults: Arc<Faults>,
    counters: Arc<Counters>,
}

/// SLMP PLC simulator
pub struct PlcSimulator {
    config: SimulatorConfig,
    shared: Shared,
    shutdown_tx: Option<broadcast::Sender<()>>,
    running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    start_time: Option<Instant>,
}

impl PlcSimulator {
    /// TCP simulator on `bind_address`
    pub fn new(bind_address: &str) -> SlmpResult<Self> {
        let bind_address = bind_address
            .parse()
            .map_err(|e| SlmpError::configuration(format!("Invalid bind address: {}", e)))?;
        Ok(Self::with_config(SimulatorConfig {
            bind_address,
            ..SimulatorConfig::default()
        }))
    }

    pub fn with_config(config: SimulatorConfig) -> Self {
        let shared = Shared {
            memory: DeviceMemory::new(),
            ranges: config.device_ranges.clone(),
            model: config.model.clone(),
            model_code: config.model_code,
            faults: Arc::new(Faults::default()),
            counters: Arc::new(Counters::default()),
        };
        Self {
            config,
            shared,
            shutdown_tx: None,
            running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
            start_time: None,
        }
    }

    /// Device storage; writes are visible to clients immediately
    pub fn memory(&self) -> &DeviceMemory {
        &self.shared.memory
    }

    /// Address actually bound, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Answer every request with `code` instead of processing it; `None` restores normal replies
    pub fn force_end_code(&self, code: Option<u16>) {
        *self.shared.faults.forced_end_code.lock().unwrap_or_else(|e| e.into_inner()) = code;
    }

    /// Wait `delay` before every response
    pub fn set_response_delay(&self, delay: Duration) {
        self.shared
            .faults
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Answer a random share of requests (0.0-1.0) with end code 0xCEE0 (busy)
    pub fn set_error_rate(&self, rate: f32) {
        self.shared
            .faults
            .error_rate
            .store(rate.clamp(0.0, 1.0).to_bits(), Ordering::SeqCst);
    }

    /// Silently drop the next `count` requests
    pub fn drop_next_requests(&self, count: u32) {
        self.shared.faults.drop_next.store(count, Ordering::SeqCst);
    }

    pub fn get_stats(&self) -> SimulatorStats {
        let c = &self.shared.counters;
        SimulatorStats {
            connections_count: c.connections.load(Ordering::Relaxed),
            total_requests: c.requests.load(Ordering::Relaxed),
            error_responses: c.error_responses.load(Ordering::Relaxed),
            dropped_requests: c.dropped.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0),
            memory: self.shared.memory.get_stats(),
        }
    }

    /// Bind and start serving; returns the bound address
    pub async fn start(&mut self) -> SlmpResult<SocketAddr> {
        if self.is_running() {
            return Err(SlmpError::configuration("Simulator is already running"));
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let local_addr = match self.config.transport {
            TransportKind::Tcp => {
                let listener = TcpListener::bind(self.config.bind_address).await.map_err(|e| {
                    SlmpError::connection(format!("Failed to bind to {}: {}", self.config.bind_address, e))
                })?;
                let local_addr = listener.local_addr()?;
                tokio::spawn(serve_tcp(
                    listener,
                    self.shared.clone(),
                    shutdown_tx.clone(),
                    self.running.clone(),
                ));
                local_addr
            }
            TransportKind::Udp => {
                let socket = UdpSocket::bind(self.config.bind_address).await.map_err(|e| {
                    SlmpError::connection(format!("Failed to bind to {}: {}", self.config.bind_address, e))
                })?;
                let local_addr = socket.local_addr()?;
                tokio::spawn(serve_udp(
                    socket,
                    self.shared.clone(),
                    shutdown_tx.subscribe(),
                    self.running.clone(),
                ));
                local_addr
            }
        };

        self.running.store(true, Ordering::SeqCst);
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);
        self.start_time = Some(Instant::now());
        info!(
            "PLC simulator ({}, {}) listening on {}",
            self.config.transport, self.config.model, local_addr
        );
        Ok(local_addr)
    }

    /// Stop accepting requests and close open connections
    pub async fn stop(&mut self) -> SlmpResult<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        self.running.store(false, Ordering::SeqCst);
        info!("PLC simulator stopped");
        Ok(())
    }
}

impl Drop for PlcSimulator {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}

async fn serve_tcp(
    listener: TcpListener,
    shared: Shared,
    shutdown_tx: broadcast::Sender<()>,
    running: Arc<AtomicBool>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        shared.counters.connections.fetch_add(1, Ordering::Relaxed);
                        tokio::spawn(handle_tcp_client(stream, peer, shared.clone(), shutdown_tx.subscribe()));
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("Shutdown signal received, closing listener");
                break;
            }
        }
    }
    running.store(false, Ordering::SeqCst);
}

async fn handle_tcp_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    shared: Shared,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut monitor = None;
    loop {
        let frame = tokio::select! {
            _ = shutdown_rx.recv() => break,
            frame = read_request(&mut stream) => frame,
        };
        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("Client {} disconnected", peer);
                break;
            }
            Err(e) => {
                warn!("Dropping client {}: {}", peer, e);
                break;
            }
        };

        if let Some(response) = shared.respond(&frame, &mut monitor).await {
            if let Err(e) = stream.write_all(&response).await {
                error!("Failed to send response to {}: {}", peer, e);
                break;
            }
            shared
                .counters
                .bytes_sent
                .fetch_add(response.len() as u64, Ordering::Relaxed);
        }
    }
}

/// Read one request frame; `None` on a clean close between frames
async fn read_request(stream: &mut TcpStream) -> io::Result<Option<Vec<u8>>> {
    use tokio::io::AsyncReadExt;

    let mut frame = vec![0u8; 2];
    match stream.read_exact(&mut frame).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let version = match [frame[0], frame[1]] {
        [0x50, 0x00] => FrameVersion::E3,
        [0x54, 0x00] => FrameVersion::E4,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown sub-header {:02X}{:02X}", other[0], other[1]),
            ))
        }
    };
    let header_len = version.request_header_len();
    frame.resize(header_len, 0);
    stream.read_exact(&mut frame[2..]).await?;
    let body_len = u16::from_le_bytes([frame[header_len - 2], frame[header_len - 1]]) as usize;
    frame.resize(header_len + body_len, 0);
    stream.read_exact(&mut frame[header_len..]).await?;
    Ok(Some(frame))
}

async fn serve_udp(
    socket: UdpSocket,
    shared: Shared,
    mut shutdown_rx: broadcast::Receiver<()>,
    running: Arc<AtomicBool>,
) {
    let mut monitors: HashMap<SocketAddr, Option<MonitorRegistration>> = HashMap::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, peer) = tokio::select! {
            _ = shutdown_rx.recv() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    error!("UDP receive failed: {}", e);
                    continue;
                }
            },
        };

        let monitor = monitors.entry(peer).or_default();
        if let Some(response) = shared.respond(&buf[..len], monitor).await {
            match socket.send_to(&response, peer).await {
                Ok(sent) => {
                    shared.counters.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                }
                Err(e) => error!("Failed to send response to {}: {}", peer, e),
            }
        }
    }
    running.store(false, Ordering::SeqCst);
}

/// Handler result: response data or a non-zero end code
type Reply = Result<Vec<u8>, u16>;

fn short(_: io::Error) -> u16 {
    end_code::WRONG_LENGTH
}

fn read_device(cursor: &mut Cursor<&[u8]>) -> Result<DeviceAddress, u16> {
    let address = cursor.read_u24::<LittleEndian>().map_err(short)?;
    let code = cursor.read_u8().map_err(short)?;
    let device = DeviceCode::from_u8(code).map_err(|_| end_code::DEVICE_NOT_ACCESSIBLE)?;
    Ok(DeviceAddress::new(device, address))
}

fn words_le(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

impl Shared {
    /// Build the response for one raw request, or `None` when it is dropped
    async fn respond(&self, frame: &[u8], monitor: &mut Option<MonitorRegistration>) -> Option<Vec<u8>> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_received
            .fetch_add(frame.len() as u64, Ordering::Relaxed);

        let request = match RequestFrame::decode(frame) {
            Ok(request) => request,
            Err(e) => {
                warn!("Discarding malformed request: {}", e);
                return None;
            }
        };

        let drop_request = self
            .faults
            .drop_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if drop_request {
            debug!("Dropping request serial {}", request.serial);
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let delay = self.faults.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let forced = *self.faults.forced_end_code.lock().unwrap_or_else(|e| e.into_inner());
        let error_rate = f32::from_bits(self.faults.error_rate.load(Ordering::SeqCst));
        let reply = match forced {
            Some(code) => Err(code),
            None if error_rate > 0.0 && rand::random::<f32>() < error_rate => Err(end_code::BUSY),
            None => self.process(&request, monitor),
        };

        let response = match reply {
            Ok(data) => ResponseFrame::success(request.version, request.serial, request.target, data),
            Err(code) => {
                debug!(
                    "Command 0x{:04X} failed with end code 0x{:04X} ({})",
                    request.command,
                    code,
                    end_code::describe(code)
                );
                self.counters.error_responses.fetch_add(1, Ordering::Relaxed);
                ResponseFrame::failure(request.version, request.serial, request.target, code)
            }
        };
        Some(response.encode())
    }

    fn process(&self, request: &RequestFrame, monitor: &mut Option<MonitorRegistration>) -> Reply {
        let command = Command::from_u16(request.command).ok_or(end_code::WRONG_COMMAND)?;
        let mut cursor = Cursor::new(request.payload.as_slice());
        let sub = request.subcommand;
        match command {
            Command::DeviceRead => self.device_read(&mut cursor, sub),
            Command::DeviceWrite => self.device_write(&mut cursor, sub),
            Command::DeviceReadRandom => {
                let (words, dwords) = self.device_list(&mut cursor)?;
                Ok(self.random_values(&words, &dwords))
            }
            Command::DeviceWriteRandom => self.random_write(&mut cursor, sub),
            Command::DeviceReadBlock => self.block_read(&mut cursor),
            Command::DeviceWriteBlock => self.block_write(&mut cursor),
            Command::EntryMonitorDevice => {
                let (words, dwords) = self.device_list(&mut cursor)?;
                *monitor = Some(MonitorRegistration { words, dwords });
                Ok(Vec::new())
            }
            Command::ExecuteMonitor => {
                let registration = monitor.as_ref().ok_or(end_code::WRONG_FORMAT)?;
                Ok(self.random_values(&registration.words, &registration.dwords))
            }
            Command::ReadTypeName => {
                let mut data = format!("{:<16}", self.model).into_bytes();
                data.truncate(16);
                data.extend_from_slice(&self.model_code.to_le_bytes());
                Ok(data)
            }
            Command::SelfTest => {
                let len = cursor.read_u16::<LittleEndian>().map_err(short)? as usize;
                let echo = request.payload.get(2..2 + len).ok_or(end_code::WRONG_LENGTH)?;
                let mut data = (len as u16).to_le_bytes().to_vec();
                data.extend_from_slice(echo);
                Ok(data)
            }
            Command::ClearError => Ok(Vec::new()),
            Command::MemoryRead => {
                let address = cursor.read_u32::<LittleEndian>().map_err(short)?;
                let words = cursor.read_u16::<LittleEndian>().map_err(short)? as usize;
                if words == 0 || words > MAX_MEMORY_WORDS {
                    return Err(end_code::READ_POINTS_OUT_OF_RANGE);
                }
                Ok(words_le(&self.memory.read_buffer(address, words)))
            }
            Command::MemoryWrite => {
                let address = cursor.read_u32::<LittleEndian>().map_err(short)?;
                let words = cursor.read_u16::<LittleEndian>().map_err(short)? as usize;
                if words == 0 || words > MAX_MEMORY_WORDS {
                    return Err(end_code::WRITE_POINTS_OUT_OF_RANGE);
                }
                let values = payload::parse_words(&request.payload[6..], words).map_err(|_| end_code::WRONG_LENGTH)?;
                self.memory.write_buffer(address, &values);
                Ok(Vec::new())
            }
        }
    }

    fn check_range(&self, device: DeviceCode, address: u32, points: usize) -> Result<(), u16> {
        match self.ranges.check_range(device, address, points as u32) {
            Some(_) => Err(end_code::DEVICE_OUT_OF_RANGE),
            None => Ok(()),
        }
    }

    /// Device points covered by `words` word-unit points
    fn span(device: DeviceCode, words: usize) -> usize {
        if device.is_bit_device() {
            words * 16
        } else {
            words
        }
    }

    fn device_read(&self, cursor: &mut Cursor<&[u8]>, sub: u16) -> Reply {
        let d = read_device(cursor)?;
        let count = cursor.read_u16::<LittleEndian>().map_err(short)? as usize;
        match sub {
            subcommand::BIT_UNITS => {
                if !d.device.is_bit_device() {
                    return Err(end_code::WRONG_FORMAT);
                }
                if count == 0 || count > MAX_BIT_POINTS {
                    return Err(end_code::READ_POINTS_OUT_OF_RANGE);
                }
                self.check_range(d.device, d.address, count)?;
                Ok(payload::pack_bits_nibble(&self.memory.read_bits(d.device, d.address, count)))
            }
            subcommand::WORD_UNITS => {
                if count == 0 || count > MAX_WORD_POINTS {
                    return Err(end_code::READ_POINTS_OUT_OF_RANGE);
                }
                self.check_range(d.device, d.address, Self::span(d.device, count))?;
                Ok(words_le(&self.memory.read_words(d.device, d.address, count)))
            }
            _ => Err(end_code::WRONG_FORMAT),
        }
    }

    fn device_write(&self, cursor: &mut Cursor<&[u8]>, sub: u16) -> Reply {
        let d = read_device(cursor)?;
        let count = cursor.read_u16::<LittleEndian>().map_err(short)? as usize;
        let data = &cursor.get_ref()[cursor.position() as usize..];
        match sub {
            subcommand::BIT_UNITS => {
                if !d.device.is_bit_device() {
                    return Err(end_code::WRONG_FORMAT);
                }
                if count == 0 || count > MAX_BIT_POINTS {
                    return Err(end_code::WRITE_POINTS_OUT_OF_RANGE);
                }
                self.check_range(d.device, d.address, count)?;
                let bits = payload::unpack_bits_nibble(data, count).map_err(|_| end_code::WRONG_LENGTH)?;
                self.memory.write_bits(d.device, d.address, &bits);
                Ok(Vec::new())
            }
            subcommand::WORD_UNITS => {
                if count == 0 || count > MAX_WORD_POINTS {
                    return Err(end_code::WRITE_POINTS_OUT_OF_RANGE);
                }
                self.check_range(d.device, d.address, Self::span(d.device, count))?;
                let words = payload::parse_words(data, count).map_err(|_| end_code::WRONG_LENGTH)?;
                self.memory.write_words(d.device, d.address, &words);
                Ok(Vec::new())
            }
            _ => Err(end_code::WRONG_FORMAT),
        }
    }

    /// `[words:1][dwords:1]` followed by device specs
    fn device_list(&self, cursor: &mut Cursor<&[u8]>) -> Result<(Vec<DeviceAddress>, Vec<DeviceAddress>), u16> {
        let word_count = cursor.read_u8().map_err(short)? as usize;
        let dword_count = cursor.read_u8().map_err(short)? as usize;
        if word_count + dword_count == 0 || word_count + dword_count > MAX_RANDOM_POINTS {
            return Err(end_code::READ_POINTS_OUT_OF_RANGE);
        }
        let mut words = Vec::with_capacity(word_count);
        for _ in 0..word_count {
            let d = read_device(cursor)?;
            self.check_range(d.device, d.address, Self::span(d.device, 1))?;
            words.push(d);
        }
        let mut dwords = Vec::with_capacity(dword_count);
        for _ in 0..dword_count {
            let d = read_device(cursor)?;
            self.check_range(d.device, d.address, Self::span(d.device, 2))?;
            dwords.push(d);
        }
        Ok((words, dwords))
    }

    fn random_values(&self, words: &[DeviceAddress], dwords: &[DeviceAddress]) -> Vec<u8> {
        let mut data = Vec::with_capacity(words.len() * 2 + dwords.len() * 4);
        for d in words {
            data.extend_from_slice(&words_le(&self.memory.read_words(d.device, d.address, 1)));
        }
        for d in dwords {
            let pair = self.memory.read_words(d.device, d.address, 2);
            data.extend_from_slice(&combine_words(pair[0], pair[1]).to_le_bytes());
        }
        data
    }

    fn random_write(&self, cursor: &mut Cursor<&[u8]>, sub: u16) -> Reply {
        match sub {
            subcommand::BIT_UNITS => {
                let count = cursor.read_u8().map_err(short)? as usize;
                if count == 0 || count > MAX_RANDOM_POINTS {
                    return Err(end_code::WRITE_POINTS_OUT_OF_RANGE);
                }
                let mut writes = Vec::with_capacity(count);
                for _ in 0..count {
                    let d = read_device(cursor)?;
                    let value = cursor.read_u8().map_err(short)? != 0;
                    if !d.device.is_bit_device() {
                        return Err(end_code::WRONG_FORMAT);
                    }
                    self.check_range(d.device, d.address, 1)?;
                    writes.push((d, value));
                }
                for (d, value) in writes {
                    self.memory.write_bits(d.device, d.address, &[value]);
                }
                Ok(Vec::new())
            }
            subcommand::WORD_UNITS => {
                let word_count = cursor.read_u8().map_err(short)? as usize;
                let dword_count = cursor.read_u8().map_err(short)? as usize;
                if word_count + dword_count == 0 || word_count + dword_count > MAX_RANDOM_POINTS {
                    return Err(end_code::WRITE_POINTS_OUT_OF_RANGE);
                }
                let mut words = Vec::with_capacity(word_count);
                for _ in 0..word_count {
                    let d = read_device(cursor)?;
                    let value = cursor.read_u16::<LittleEndian>().map_err(short)?;
                    self.check_range(d.device, d.address, Self::span(d.device, 1))?;
                    words.push((d, value));
                }
                let mut dwords = Vec::with_capacity(dword_count);
                for _ in 0..dword_count {
                    let d = read_device(cursor)?;
                    let value = cursor.read_u32::<LittleEndian>().map_err(short)?;
                    self.check_range(d.device, d.address, Self::span(d.device, 2))?;
                    dwords.push((d, value));
                }
                for (d, value) in words {
                    self.memory.write_words(d.device, d.address, &[value]);
                }
                for (d, value) in dwords {
                    self.memory
                        .write_words(d.device, d.address, &[(value & 0xFFFF) as u16, (value >> 16) as u16]);
                }
                Ok(Vec::new())
            }
            _ => Err(end_code::WRONG_FORMAT),
        }
    }

    /// `[wordBlocks:1][bitBlocks:1]` with a point total inside the word limit
    fn block_header(cursor: &mut Cursor<&[u8]>) -> Result<(usize, usize), u16> {
        let word_blocks = cursor.read_u8().map_err(short)? as usize;
        let bit_blocks = cursor.read_u8().map_err(short)? as usize;
        if word_blocks + bit_blocks == 0 || word_blocks + bit_blocks > MAX_BLOCKS {
            return Err(end_code::WRONG_FORMAT);
        }
        Ok((word_blocks, bit_blocks))
    }

    fn block_read(&self, cursor: &mut Cursor<&[u8]>) -> Reply {
        let (word_blocks, bit_blocks) = Self::block_header(cursor)?;
        let mut blocks = Vec::with_capacity(word_blocks + bit_blocks);
        let mut total = 0usize;
        for index in 0..word_blocks + bit_blocks {
            let d = read_device(cursor)?;
            let count = cursor.read_u16::<LittleEndian>().map_err(short)? as usize;
            if index >= word_blocks && !d.device.is_bit_device() {
                return Err(end_code::WRONG_FORMAT);
            }
            self.check_range(d.device, d.address, Self::span(d.device, count))?;
            total += count;
            blocks.push((d, count));
        }
        if total == 0 || total > MAX_WORD_POINTS {
            return Err(end_code::READ_POINTS_OUT_OF_RANGE);
        }
        let mut data = Vec::with_capacity(total * 2);
        for (d, count) in blocks {
            data.extend_from_slice(&words_le(&self.memory.read_words(d.device, d.address, count)));
        }
        Ok(data)
    }

    fn block_write(&self, cursor: &mut Cursor<&[u8]>) -> Reply {
        let (word_blocks, bit_blocks) = Self::block_header(cursor)?;
        let mut writes = Vec::with_capacity(word_blocks + bit_blocks);
        let mut total = 0usize;
        for index in 0..word_blocks + bit_blocks {
            let d = read_device(cursor)?;
            let count = cursor.read_u16::<LittleEndian>().map_err(short)? as usize;
            if index >= word_blocks && !d.device.is_bit_device() {
                return Err(end_code::WRONG_FORMAT);
            }
            self.check_range(d.device, d.address, Self::span(d.device, count))?;
            let values = (0..count)
                .map(|_| cursor.read_u16::<LittleEndian>())
                .collect::<io::Result<Vec<u16>>>()
                .map_err(short)?;
            total += count;
            writes.push((d, values));
        }
        if total == 0 || total > MAX_WORD_POINTS {
            return Err(end_code::WRITE_POINTS_OUT_OF_RANGE);
        }
        for (d, values) in writes {
            self.memory.write_words(d.device, d.address, &values);
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_response, Target};

    fn shared() -> Shared {
        PlcSimulator::with_config(SimulatorConfig::default()).shared.clone()
    }

    fn request(command: Command, sub: u16, payload: Vec<u8>) -> Vec<u8> {
        RequestFrame::new(FrameVersion::E4, command, sub, payload)
            .with_serial(7)
            .encode()
            .unwrap()
    }

    async fn exchange(shared: &Shared, frame: Vec<u8>) -> SlmpResult<Vec<u8>> {
        let mut monitor = None;
        let response = shared.respond(&frame, &mut monitor).await.unwrap();
        decode_response(&response, FrameVersion::E4)
    }

    #[test]
    fn test_memory_bit_word_views() {
        let memory = DeviceMemory::new();
        memory.write_bits(DeviceCode::M, 0, &[true, false, true]);
        assert_eq!(memory.read_words(DeviceCode::M, 0, 1), vec![0b101]);

        memory.write_words(DeviceCode::Y, 0x20, &[0x8001]);
        assert_eq!(memory.read_bits(DeviceCode::Y, 0x20, 2), vec![true, false]);
        assert!(memory.read_bits(DeviceCode::Y, 0x2F, 1)[0]);

        memory.write_dword(DeviceCode::D, 10, 0x1234_5678);
        assert_eq!(memory.read_words(DeviceCode::D, 10, 2), vec![0x5678, 0x1234]);
        assert_eq!(memory.read_dword(DeviceCode::D, 10), 0x1234_5678);

        let stats = memory.get_stats();
        assert_eq!(stats.word_points, 2);
        memory.clear();
        assert_eq!(memory.get_stats(), MemoryStats::default());
    }

    #[tokio::test]
    async fn test_word_read_and_write() {
        let shared = shared();
        shared.memory.write_words(DeviceCode::D, 100, &[1, 2, 3, 4]);

        let data = exchange(&shared, request(Command::DeviceRead, subcommand::WORD_UNITS, payload::device_read(DeviceCode::D, 100, 4)))
            .await
            .unwrap();
        assert_eq!(payload::parse_words(&data, 4).unwrap(), vec![1, 2, 3, 4]);

        exchange(&shared, request(Command::DeviceWrite, subcommand::WORD_UNITS, payload::word_write(DeviceCode::W, 0x1F, &[9])))
            .await
            .unwrap();
        assert_eq!(shared.memory.read_words(DeviceCode::W, 0x1F, 1), vec![9]);
    }

    #[tokio::test]
    async fn test_out_of_range_and_unknown_command() {
        let shared = shared();
        let err = exchange(&shared, request(Command::DeviceRead, subcommand::WORD_UNITS, payload::device_read(DeviceCode::D, 65_535, 2)))
            .await
            .unwrap_err();
        assert_eq!(err.end_code(), Some(end_code::DEVICE_OUT_OF_RANGE));

        let mut frame = request(Command::ClearError, 0, Vec::new());
        // patch the command to 0x9999
        let at = frame.len() - 4;
        frame[at] = 0x99;
        frame[at + 1] = 0x99;
        let err = exchange(&shared, frame).await.unwrap_err();
        assert_eq!(err.end_code(), Some(end_code::WRONG_COMMAND));
    }

    #[tokio::test]
    async fn test_3e_reply_and_target_echo() {
        let shared = shared();
        let target = Target::new(0, 0xFF, 0x03FF, 0);
        let frame = RequestFrame::new(FrameVersion::E3, Command::ReadTypeName, 0, Vec::new())
            .with_target(target)
            .encode()
            .unwrap();
        let mut monitor = None;
        let response = shared.respond(&frame, &mut monitor).await.unwrap();
        let decoded = ResponseFrame::decode(&response, FrameVersion::E3).unwrap();
        assert_eq!(decoded.target, target);
        let name = payload::parse_type_name(&decoded.data).unwrap();
        assert_eq!(name.model, "Q03UDVCPU");
        assert_eq!(name.model_code, Some(0x0366));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let simulator = PlcSimulator::with_config(SimulatorConfig::default());
        simulator.force_end_code(Some(end_code::BUSY));
        let err = exchange(&simulator.shared, request(Command::ClearError, 0, Vec::new()))
            .await
            .unwrap_err();
        assert_eq!(err.end_code(), Some(end_code::BUSY));

        simulator.force_end_code(None);
        simulator.drop_next_requests(1);
        let frame = request(Command::ClearError, 0, Vec::new());
        let mut monitor = None;
        assert!(simulator.shared.respond(&frame, &mut monitor).await.is_none());
        assert!(simulator.shared.respond(&frame, &mut monitor).await.is_some());

        simulator.set_error_rate(1.0);
        let err = exchange(&simulator.shared, request(Command::ClearError, 0, Vec::new()))
            .await
            .unwrap_err();
        assert_eq!(err.end_code(), Some(end_code::BUSY));
        simulator.set_error_rate(0.0);

        let stats = simulator.get_stats();
        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.dropped_requests, 1);
        assert_eq!(stats.error_responses, 2);
    }

    #[tokio::test]
    async fn test_monitor_registration_per_session() {
        let shared = shared();
        shared.memory.write_words(DeviceCode::D, 0, &[42]);
        shared.memory.write_dword(DeviceCode::D, 10, 0xAABB_CCDD);

        let mut monitor = None;
        let execute = request(Command::ExecuteMonitor, 0, Vec::new());
        let response = shared.respond(&execute, &mut monitor).await.unwrap();
        assert!(decode_response(&response, FrameVersion::E4).is_err());

        let entry = request(
            Command::EntryMonitorDevice,
            0,
            payload::random_read(&[DeviceAddress::new(DeviceCode::D, 0)], &[DeviceAddress::new(DeviceCode::D, 10)]),
        );
        shared.respond(&entry, &mut monitor).await.unwrap();
        let response = shared.respond(&execute, &mut monitor).await.unwrap();
        let data = decode_response(&response, FrameVersion::E4).unwrap();
        let values = payload::parse_random(&data, 1, 1).unwrap();
        assert_eq!(values.words, vec![42]);
        assert_eq!(values.dwords, vec![0xAABB_CCDD]);
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        use tokio::io::AsyncReadExt;

        let mut simulator = PlcSimulator::new("127.0.0.1:0").unwrap();
        let addr = simulator.start().await.unwrap();
        simulator.memory().write_words(DeviceCode::D, 0, &[0xBEEF]);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(&request(Command::DeviceRead, subcommand::WORD_UNITS, payload::device_read(DeviceCode::D, 0, 1)))
            .await
            .unwrap();
        let mut response = vec![0u8; 17];
        stream.read_exact(&mut response).await.unwrap();
        let data = decode_response(&response, FrameVersion::E4).unwrap();
        assert_eq!(data, vec![0xEF, 0xBE]);

        simulator.stop().await.unwrap();
        assert!(!simulator.is_running());
    }
}
