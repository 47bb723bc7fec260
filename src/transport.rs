//! # SLMP Transport Layer
//!
//! This module moves encoded SLMP frames between the client and a PLC. It
//! knows how to find the end of a response frame and how to pair responses
//! with requests, but it never interprets the data inside a frame.
//!
//! ## Supported Transports
//!
//! ### TCP (`TcpTransport`)
//! - One persistent stream shared by all in-flight requests
//! - A background reader task splits the stream into frames using the
//!   length field of the response header
//! - 4E responses are routed to their waiter by serial number, so several
//!   requests may be outstanding at once; 3E responses are routed in the
//!   order the requests were written
//! - Responses whose waiter gave up are read and discarded
//!
//! ### UDP (`UdpTransport`)
//! - Every request is an independent datagram exchange on its own socket
//! - `connect` only resolves and validates the address
//! - 4E datagrams with a foreign serial number are ignored
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use voltage_slmp::protocol::{payload, subcommand, Command, FrameVersion, RequestFrame};
//! use voltage_slmp::transport::{SlmpTransport, TcpTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = TcpTransport::new("192.168.3.39:5000", FrameVersion::E4, Duration::from_secs(5));
//!     transport.connect().await?;
//!
//!     let request = RequestFrame::new(
//!         FrameVersion::E4,
//!         Command::DeviceRead,
//!         subcommand::WORD_UNITS,
//!         payload::device_read(voltage_slmp::DeviceCode::D, 100, 4),
//!     )
//!     .with_serial(1)
//!     .encode()?;
//!
//!     let response = transport.exchange(&request, 1, Duration::from_secs(1)).await?;
//!     println!("{} response bytes", response.len());
//!
//!     let stats = transport.get_stats();
//!     println!("Requests sent: {}", stats.requests_sent);
//!     transport.close().await?;
//!     Ok(())
//! }
//! ```

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::error::{SlmpError, SlmpResult};
use crate::protocol::{frame_serial, response_body_len, FrameVersion, MAX_FRAME_LEN};
use crate::utils::format::bytes_to_hex;

/// Log packet with direction and transport
fn log_packet(direction: &str, data: &[u8], protocol: &str, serial: Option<u16>) {
    let hex_string = bytes_to_hex(data);
    match serial {
        Some(serial) => info!("[SLMP-{}] {} serial:{} {}", protocol, direction, serial, hex_string),
        None => info!("[SLMP-{}] {} {}", protocol, direction, hex_string),
    }
}

/// Transport layer abstraction for SLMP
///
/// Implementations take `&self` so that a pipelining connection manager can
/// run several exchanges at once; any internal state is synchronized by the
/// implementation.
#[async_trait]
pub trait SlmpTransport: Send + Sync {
    /// Establish the connection (TCP) or resolve the peer (UDP)
    async fn connect(&self) -> SlmpResult<()>;

    /// Send one encoded request frame and wait for its response frame
    ///
    /// `serial` is the serial number written into a 4E request; 3E
    /// transports ignore it. The returned bytes are the complete response
    /// frame, header included.
    ///
    /// # Errors
    ///
    /// - `SlmpError::Timeout` - no response within `timeout`
    /// - `SlmpError::Connection` - not connected, or the connection was lost
    /// - `SlmpError::Frame` - the peer sent bytes that are not an SLMP response
    async fn exchange(&self, request: &[u8], serial: u16, timeout: Duration) -> SlmpResult<Vec<u8>>;

    /// Local view of whether the transport can carry requests
    fn is_connected(&self) -> bool;

    /// Close the connection and fail any waiting requests
    async fn close(&self) -> SlmpResult<()>;

    /// Communication counters
    fn get_stats(&self) -> TransportStats;
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Responses that arrived after their waiter was gone
    pub orphaned_responses: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    requests_sent: AtomicU64,
    responses_received: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    orphaned_responses: AtomicU64,
}

impl StatsCounters {
    fn sent(&self, bytes: usize) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn received(&self, bytes: usize) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    fn orphan(&self) {
        self.orphaned_responses.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TransportStats {
        TransportStats {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            orphaned_responses: self.orphaned_responses.load(Ordering::Relaxed),
        }
    }
}

type Waiter = oneshot::Sender<SlmpResult<Vec<u8>>>;

/// Requests written to a TCP stream that still wait for a response
#[derive(Default)]
struct PendingState {
    by_serial: HashMap<u16, Waiter>,
    in_order: VecDeque<Waiter>,
    /// Set once the reader has stopped; new requests fail with this message
    closed: Option<String>,
}

#[derive(Default)]
struct Pending {
    state: Mutex<PendingState>,
}

impl Pending {
    fn lock(&self) -> std::sync::MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, version: FrameVersion, serial: u16, waiter: Waiter) -> SlmpResult<()> {
        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(SlmpError::connection(reason.clone()));
        }
        match version {
            FrameVersion::E4 => {
                if state.by_serial.insert(serial, waiter).is_some() {
                    warn!("Serial {} reused while a request was still pending", serial);
                }
            }
            FrameVersion::E3 => state.in_order.push_back(waiter),
        }
        Ok(())
    }

    fn forget(&self, serial: u16) {
        self.lock().by_serial.remove(&serial);
    }

    /// Hand a response to its waiter; false when nobody was waiting
    fn dispatch(&self, version: FrameVersion, frame: Vec<u8>) -> bool {
        let waiter = {
            let mut state = self.lock();
            match version {
                FrameVersion::E4 => frame_serial(&frame).and_then(|s| state.by_serial.remove(&s)),
                FrameVersion::E3 => state.in_order.pop_front(),
            }
        };
        match waiter {
            Some(tx) => tx.send(Ok(frame)).is_ok(),
            None => false,
        }
    }

    fn fail_all(&self, reason: &str) {
        let waiters: Vec<Waiter> = {
            let mut state = self.lock();
            state.closed = Some(reason.to_string());
            let mut waiters: Vec<Waiter> = state.by_serial.drain().map(|(_, tx)| tx).collect();
            waiters.extend(state.in_order.drain(..));
            waiters
        };
        for tx in waiters {
            let _ = tx.send(Err(SlmpError::connection(reason.to_string())));
        }
    }
}

/// Cleans up a registered request whose response never reached it
///
/// A 4E waiter is simply forgotten. A 3E waiter cannot be removed from the
/// queue without shifting every later response onto the wrong request, so
/// the session is torn down instead.
struct PendingGuard<'a> {
    transport: &'a TcpTransport,
    session: &'a Arc<TcpSession>,
    serial: Option<u16>,
    registered: bool,
    answered: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.registered || self.answered {
            return;
        }
        match self.serial {
            Some(serial) => self.session.pending.forget(serial),
            None => self
                .transport
                .drop_session(self.session, "In-order request abandoned before its response"),
        }
    }
}

struct TcpSession {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Arc<Pending>,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl TcpSession {
    fn shutdown(&self, reason: &str) {
        self.alive.store(false, Ordering::SeqCst);
        self.reader.abort();
        self.pending.fail_all(reason);
    }
}

/// SLMP over a persistent TCP stream
pub struct TcpTransport {
    pub address: String,
    version: FrameVersion,
    connect_timeout: Duration,
    session: Mutex<Option<Arc<TcpSession>>>,
    /// Serializes `connect` so concurrent reconnects open one stream
    connecting: tokio::sync::Mutex<()>,
    stats: Arc<StatsCounters>,
    /// Enable packet logging for debugging
    packet_logging: bool,
}

impl TcpTransport {
    /// Create an unconnected TCP transport for `address` (`host:port`)
    pub fn new<S: Into<String>>(address: S, version: FrameVersion, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            version,
            connect_timeout,
            session: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
            stats: Arc::new(StatsCounters::default()),
            packet_logging: false,
        }
    }

    /// Enable or disable packet logging
    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }

    fn current_session(&self) -> Option<Arc<TcpSession>> {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .filter(|s| s.alive.load(Ordering::SeqCst))
    }

    fn take_session(&self) -> Option<Arc<TcpSession>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Drop the session; the next `connect` opens a fresh stream
    fn reset_session(&self, reason: &str) {
        if let Some(session) = self.take_session() {
            session.shutdown(reason);
        }
    }

    /// Shut `session` down, detaching it first if it is still the current one
    fn drop_session(&self, session: &Arc<TcpSession>, reason: &str) {
        {
            let mut current = self.session.lock().unwrap_or_else(|e| e.into_inner());
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, session)) {
                current.take();
            }
        }
        warn!("Resetting TCP session to {}: {}", self.address, reason);
        session.shutdown(reason);
    }
}

#[async_trait]
impl SlmpTransport for TcpTransport {
    async fn connect(&self) -> SlmpResult<()> {
        if self.current_session().is_some() {
            return Ok(());
        }
        let _connecting = self.connecting.lock().await;
        if self.current_session().is_some() {
            return Ok(());
        }
        self.reset_session("Reconnecting");

        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                SlmpError::timeout(
                    format!("connect to {}", self.address),
                    self.connect_timeout.as_millis() as u64,
                )
            })?
            .map_err(|e| SlmpError::connection(format!("Failed to connect to {}: {}", self.address, e)))?;
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        let pending = Arc::new(Pending::default());
        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_loop(
            reader,
            self.version,
            pending.clone(),
            alive.clone(),
            self.stats.clone(),
            self.packet_logging,
        ));

        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(TcpSession {
            writer: tokio::sync::Mutex::new(writer),
            pending,
            alive,
            reader,
        }));
        info!("Connected to {} over TCP ({} frames)", self.address, self.version);
        Ok(())
    }

    async fn exchange(&self, request: &[u8], serial: u16, wait: Duration) -> SlmpResult<Vec<u8>> {
        let session = self
            .current_session()
            .ok_or_else(|| SlmpError::connection(format!("Not connected to {}", self.address)))?;

        let (tx, rx) = oneshot::channel();
        let mut guard = PendingGuard {
            transport: self,
            session: &session,
            serial: (self.version == FrameVersion::E4).then_some(serial),
            registered: false,
            answered: false,
        };
        {
            // registration and write happen under the writer lock so 3E
            // waiters queue in the order their requests hit the wire
            let mut writer = session.writer.lock().await;
            session.pending.register(self.version, serial, tx)?;
            guard.registered = true;
            if let Err(e) = writer.write_all(request).await {
                drop(writer);
                self.stats.error();
                let err = SlmpError::from(e);
                guard.answered = true;
                self.drop_session(&session, &format!("Write failed: {}", err));
                return Err(err);
            }
        }
        self.stats.sent(request.len());
        if self.packet_logging {
            log_packet("TX", request, "TCP", guard.serial);
        }

        let outcome = timeout(wait, rx).await;
        guard.answered = outcome.is_ok();
        match outcome {
            Ok(Ok(Ok(frame))) => Ok(frame),
            Ok(Ok(Err(e))) => {
                self.stats.error();
                Err(e)
            }
            Ok(Err(_)) => {
                self.stats.error();
                Err(SlmpError::connection("Connection closed while waiting for a response"))
            }
            Err(_) => {
                // a 3E session is reset when the guard drops
                self.stats.timeout();
                Err(SlmpError::timeout(
                    format!("SLMP response from {}", self.address),
                    wait.as_millis() as u64,
                ))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.current_session().is_some()
    }

    async fn close(&self) -> SlmpResult<()> {
        if let Some(session) = self.take_session() {
            session.shutdown("Connection closed");
            let mut writer = session.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!("TCP shutdown of {} failed: {}", self.address, e);
            }
            info!("Closed TCP connection to {}", self.address);
        }
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.reset_session("Transport dropped");
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    version: FrameVersion,
    pending: Arc<Pending>,
    alive: Arc<AtomicBool>,
    stats: Arc<StatsCounters>,
    packet_logging: bool,
) {
    let err = match read_frames(&mut reader, version, &pending, &stats, packet_logging).await {
        Ok(never) => match never {},
        Err(e) => e,
    };
    debug!("TCP reader stopped: {}", err);
    alive.store(false, Ordering::SeqCst);
    pending.fail_all(&format!("Connection lost: {}", err));
}

async fn read_frames(
    reader: &mut OwnedReadHalf,
    version: FrameVersion,
    pending: &Pending,
    stats: &StatsCounters,
    packet_logging: bool,
) -> SlmpResult<std::convert::Infallible> {
    let header_len = version.response_header_len();
    loop {
        let mut frame = vec![0u8; header_len];
        reader.read_exact(&mut frame).await?;
        let body_len = response_body_len(&frame, version)?;
        frame.resize(header_len + body_len, 0);
        reader.read_exact(&mut frame[header_len..]).await?;

        stats.received(frame.len());
        if packet_logging {
            log_packet("RX", &frame, "TCP", frame_serial(&frame));
        }
        if !pending.dispatch(version, frame) {
            stats.orphan();
            debug!("Discarded a response nobody was waiting for");
        }
    }
}

/// SLMP over UDP datagrams
pub struct UdpTransport {
    pub address: String,
    version: FrameVersion,
    peer: Mutex<Option<SocketAddr>>,
    stats: StatsCounters,
    /// Enable packet logging for debugging
    packet_logging: bool,
}

impl UdpTransport {
    /// Create a UDP transport for `address` (`host:port`)
    pub fn new<S: Into<String>>(address: S, version: FrameVersion) -> Self {
        Self {
            address: address.into(),
            version,
            peer: Mutex::new(None),
            stats: StatsCounters::default(),
            packet_logging: false,
        }
    }

    /// Enable or disable packet logging
    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }

    fn peer(&self) -> Option<SocketAddr> {
        *self.peer.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn send_and_receive(&self, peer: SocketAddr, request: &[u8], serial: u16, deadline: Instant) -> SlmpResult<Vec<u8>> {
        let local: SocketAddr = if peer.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;
        socket.send(request).await?;
        self.stats.sent(request.len());
        if self.packet_logging {
            log_packet("TX", request, "UDP", self.version.has_serial().then_some(serial));
        }

        let mut buf = vec![0u8; MAX_FRAME_LEN];
        loop {
            let n = timeout_at(deadline, socket.recv(&mut buf))
                .await
                .map_err(|_| SlmpError::timeout(format!("SLMP response from {}", self.address), 0))??;
            let frame = buf[..n].to_vec();
            if self.packet_logging {
                log_packet("RX", &frame, "UDP", frame_serial(&frame));
            }
            if self.version == FrameVersion::E4 && frame_serial(&frame) != Some(serial) {
                self.stats.orphan();
                debug!("Ignored datagram for another serial (expected {})", serial);
                continue;
            }
            self.stats.received(n);
            return Ok(frame);
        }
    }
}

#[async_trait]
impl SlmpTransport for UdpTransport {
    async fn connect(&self) -> SlmpResult<()> {
        let peer = lookup_host(&self.address)
            .await
            .map_err(|e| SlmpError::connection(format!("Cannot resolve {}: {}", self.address, e)))?
            .next()
            .ok_or_else(|| SlmpError::connection(format!("No address found for {}", self.address)))?;
        *self.peer.lock().unwrap_or_else(|e| e.into_inner()) = Some(peer);
        info!("UDP peer {} resolved to {}", self.address, peer);
        Ok(())
    }

    async fn exchange(&self, request: &[u8], serial: u16, wait: Duration) -> SlmpResult<Vec<u8>> {
        let peer = self
            .peer()
            .ok_or_else(|| SlmpError::connection(format!("Not connected to {}", self.address)))?;
        let deadline = Instant::now() + wait;
        match self.send_and_receive(peer, request, serial, deadline).await {
            Ok(frame) => Ok(frame),
            Err(SlmpError::Timeout { operation, .. }) => {
                self.stats.timeout();
                Err(SlmpError::timeout(operation, wait.as_millis() as u64))
            }
            Err(e) => {
                self.stats.error();
                Err(e)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.peer().is_some()
    }

    async fn close(&self) -> SlmpResult<()> {
        self.peer.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}
