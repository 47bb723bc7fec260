//! Connection manager.
//!
//! Owns the transport, hands out serial numbers, bounds the number of
//! requests in flight and keeps the per-connection monitor registration.
//! All wire access from the client goes through [`ConnectionManager::execute`].

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{ConnectionSettings, TransportKind};
use crate::device::DeviceAddress;
use crate::error::{SlmpError, SlmpResult};
use crate::logging::CallbackLogger;
use crate::protocol::{decode_response, Command, RequestFrame, Target};
use crate::transport::{SlmpTransport, TcpTransport, TransportStats, UdpTransport};
use crate::utils::format::bytes_to_hex;

/// Length of one monitoring-timer unit
pub const TIMER_UNIT: Duration = Duration::from_millis(250);

/// Per-call options accepted by every client operation
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Timeout in 250 ms units; 0 uses the connection receive timeout
    pub timeout: u16,
    /// Abandon the call when this token is cancelled
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, units: u16) -> Self {
        self.timeout = units;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Effective response wait and the matching monitoring-timer value
    pub fn resolve_timeout(&self, default: Duration) -> (Duration, u16) {
        if self.timeout == 0 {
            let units = default.as_millis().div_ceil(TIMER_UNIT.as_millis()).min(u16::MAX as u128) as u16;
            (default, units.max(1))
        } else {
            (TIMER_UNIT * self.timeout as u32, self.timeout)
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }
}

/// Devices registered with Entry Monitor Device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorRegistration {
    pub words: Vec<DeviceAddress>,
    pub dwords: Vec<DeviceAddress>,
}

/// Lifecycle, pipelining gate and serial numbers for one PLC connection
pub struct ConnectionManager {
    settings: ConnectionSettings,
    target: Target,
    transport: Arc<dyn SlmpTransport>,
    gate: Arc<Semaphore>,
    serial: AtomicU16,
    /// The caller asked to be connected; broken sessions are reopened on demand
    wanted: AtomicBool,
    monitor: Mutex<Option<MonitorRegistration>>,
    debug_frames: bool,
    logger: CallbackLogger,
}

impl ConnectionManager {
    /// Manager with the transport selected by `settings.transport`
    pub fn new(host: &str, settings: ConnectionSettings, target: Target) -> Self {
        let address = format!("{}:{}", host, settings.port);
        let logging = settings.continuity.enable_debug_output;
        let transport: Arc<dyn SlmpTransport> = match settings.transport {
            TransportKind::Tcp => Arc::new(
                TcpTransport::new(address, settings.version, settings.connect_timeout).with_packet_logging(logging),
            ),
            TransportKind::Udp => {
                Arc::new(UdpTransport::new(address, settings.version).with_packet_logging(logging))
            }
        };
        Self::with_transport(transport, settings, target)
    }

    /// Manager over a caller-supplied transport
    pub fn with_transport(transport: Arc<dyn SlmpTransport>, settings: ConnectionSettings, target: Target) -> Self {
        let permits = settings.effective_concurrency();
        let debug_frames = settings.continuity.enable_debug_output;
        Self {
            settings,
            target,
            transport,
            gate: Arc::new(Semaphore::new(permits)),
            serial: AtomicU16::new(0),
            wanted: AtomicBool::new(false),
            monitor: Mutex::new(None),
            debug_frames,
            logger: CallbackLogger::disabled(),
        }
    }

    /// Trace every frame through `logger`
    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn target(&self) -> Target {
        self.target
    }

    /// Open the transport
    pub async fn connect(&self) -> SlmpResult<()> {
        self.clear_monitor();
        self.transport.connect().await?;
        self.wanted.store(true, Ordering::SeqCst);
        info!(
            "SLMP connection ready ({} {} frames, {} request(s) in flight)",
            self.settings.transport,
            self.settings.version,
            self.settings.effective_concurrency()
        );
        Ok(())
    }

    /// Close the transport and forget the monitor registration
    pub async fn disconnect(&self) -> SlmpResult<()> {
        self.wanted.store(false, Ordering::SeqCst);
        self.clear_monitor();
        self.transport.close().await
    }

    /// Local liveness check; does not send anything
    pub fn is_alive(&self) -> bool {
        self.wanted.load(Ordering::SeqCst) && self.transport.is_connected()
    }

    /// Requests currently allowed to start
    pub fn available_slots(&self) -> usize {
        self.gate.available_permits()
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.transport.get_stats()
    }

    fn next_serial(&self) -> u16 {
        self.serial.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Send one command and return the response data.
    ///
    /// Checks the cancellation token before waiting for a gate slot and again
    /// while waiting for the response. A slot is held from encoding until the
    /// response (or its timeout) and is released on every path. A response
    /// that arrives after cancellation is discarded by the transport.
    pub async fn execute(
        &self,
        command: Command,
        subcommand: u16,
        payload: Vec<u8>,
        options: &RequestOptions,
    ) -> SlmpResult<Vec<u8>> {
        if options.is_cancelled() {
            return Err(SlmpError::cancelled(command.name()));
        }

        let _permit = match &options.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => return Err(SlmpError::cancelled(command.name())),
                permit = self.gate.acquire() => permit,
            },
            None => self.gate.acquire().await,
        }
        .map_err(|_| SlmpError::internal("Request gate closed"))?;

        if !self.transport.is_connected() {
            if self.wanted.load(Ordering::SeqCst) {
                debug!("Transport down, reconnecting before {}", command.name());
                self.clear_monitor();
                self.transport.connect().await?;
            } else {
                return Err(SlmpError::connection("Not connected"));
            }
        }

        let (wait, timer) = options.resolve_timeout(self.settings.receive_timeout);
        let serial = self.next_serial();
        let request = RequestFrame::new(self.settings.version, command, subcommand, payload)
            .with_serial(serial)
            .with_target(self.target)
            .with_timer(timer)
            .encode()?;
        if self.debug_frames {
            debug!("{} TX [{}]", command, bytes_to_hex(&request));
        }
        self.logger.log_request(&request);

        let exchange = self.transport.exchange(&request, serial, wait);
        let response = match &options.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => return Err(SlmpError::cancelled(command.name())),
                response = exchange => response,
            },
            None => exchange.await,
        }?;
        if self.debug_frames {
            debug!("{} RX [{}]", command, bytes_to_hex(&response));
        }
        self.logger.log_response(command, self.settings.version, &response);

        decode_response(&response, self.settings.version)
    }

    /// Remember the devices registered with the PLC
    pub fn set_monitor(&self, registration: MonitorRegistration) {
        *self.monitor.lock().unwrap_or_else(|e| e.into_inner()) = Some(registration);
    }

    /// Current monitor registration, if any
    pub fn monitor(&self) -> Option<MonitorRegistration> {
        self.monitor.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear_monitor(&self) {
        self.monitor.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameVersion, RequestFrame, ResponseFrame};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Echoes an empty success response after a delay, tracking concurrency
    #[derive(Default)]
    struct SlowTransport {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        connected: AtomicBool,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl SlmpTransport for SlowTransport {
        async fn connect(&self) -> SlmpResult<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn exchange(&self, request: &[u8], serial: u16, _timeout: Duration) -> SlmpResult<Vec<u8>> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let decoded = RequestFrame::decode(request)?;
            Ok(ResponseFrame::success(decoded.version, serial, decoded.target, vec![decoded.timer as u8]).encode())
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

    fn manager(pipelining: bool) -> (Arc<SlowTransport>, Arc<ConnectionManager>) {
        let transport = Arc::new(SlowTransport::default());
        let settings = ConnectionSettings {
            pipelining,
            max_concurrent_requests: 3,
            version: FrameVersion::E4,
            ..ConnectionSettings::default()
        };
        let manager = ConnectionManager::with_transport(transport.clone(), settings, Target::local());
        (transport, Arc::new(manager))
    }

    async fn run_many(manager: &Arc<ConnectionManager>, n: usize) {
        let tasks: Vec<_> = (0..n)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager
                        .execute(Command::ClearError, 0, Vec::new(), &RequestOptions::default())
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_gate_bounds_in_flight_requests() {
        let (transport, manager) = manager(true);
        manager.connect().await.unwrap();
        run_many(&manager, 10).await;
        assert_eq!(transport.peak.load(Ordering::SeqCst), 3);
        assert_eq!(manager.available_slots(), 3);
    }

    #[tokio::test]
    async fn test_no_pipelining_serializes() {
        let (transport, manager) = manager(false);
        manager.connect().await.unwrap();
        run_many(&manager, 5).await;
        assert_eq!(transport.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timer_field_follows_timeout() {
        let (_, manager) = manager(true);
        manager.connect().await.unwrap();
        // receive timeout 1 s -> 4 units
        let data = manager
            .execute(Command::ClearError, 0, Vec::new(), &RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(data, vec![4]);
        let data = manager
            .execute(Command::ClearError, 0, Vec::new(), &RequestOptions::new().with_timeout(12))
            .await
            .unwrap();
        assert_eq!(data, vec![12]);
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let (_, manager) = manager(true);
        manager.connect().await.unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let err = manager
            .execute(Command::ClearError, 0, Vec::new(), &RequestOptions::new().with_cancel(token))
            .await
            .unwrap_err();
        assert!(matches!(err, SlmpError::Cancelled { .. }));
        assert_eq!(manager.available_slots(), 3);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_releases_slot() {
        let (_, manager) = manager(false);
        manager.connect().await.unwrap();
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            canceller.cancel();
        });
        let err = manager
            .execute(Command::ClearError, 0, Vec::new(), &RequestOptions::new().with_cancel(token))
            .await
            .unwrap_err();
        assert!(matches!(err, SlmpError::Cancelled { .. }));
        assert_eq!(manager.available_slots(), 1);
        // the connection is still usable
        assert!(manager
            .execute(Command::ClearError, 0, Vec::new(), &RequestOptions::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_reconnects_and_clears_monitor() {
        let (transport, manager) = manager(true);
        assert!(manager
            .execute(Command::ClearError, 0, Vec::new(), &RequestOptions::default())
            .await
            .is_err());

        manager.connect().await.unwrap();
        manager.set_monitor(MonitorRegistration::default());
        transport.connected.store(false, Ordering::SeqCst);
        assert!(!manager.is_alive());

        manager
            .execute(Command::ClearError, 0, Vec::new(), &RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
        assert!(manager.monitor().is_none());
        assert!(manager.is_alive());

        manager.set_monitor(MonitorRegistration::default());
        manager.disconnect().await.unwrap();
        assert!(manager.monitor().is_none());
        assert!(!manager.is_alive());
    }

    #[test]
    fn test_resolve_timeout() {
        let options = RequestOptions::default();
        assert_eq!(
            options.resolve_timeout(Duration::from_millis(1100)),
            (Duration::from_millis(1100), 5)
        );
        let options = RequestOptions::new().with_timeout(2);
        assert_eq!(
            options.resolve_timeout(Duration::from_secs(1)),
            (Duration::from_millis(500), 2)
        );
    }
}
