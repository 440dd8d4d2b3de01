//! In-process radio medium for tests and local demos.
//!
//! A [`LoopbackMedium`] is the shared air: every [`LoopbackRadio`] created from
//! it can advertise, dial, and scan for the other devices on the same medium.
//! Connections are in-memory duplex pipes.
//!
//! The medium can also simulate the conditions a real radio runs into: a
//! device with its radio switched off, an unreachable device, a device that
//! does not show up in scans, and slow connection setup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use nearchat_core::{
    Connection, Discovery, ListenHandle, PeerAddress, RadioTransport, ScanEvent, TransportError,
};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::read_message;

const PIPE_CAPACITY: usize = 64 * 1024;
const LISTEN_BACKLOG: usize = 8;

/// Timing of simulated scans.
#[derive(Debug, Clone)]
pub struct LoopbackTiming {
    /// Full length of a scan that nobody cancels.
    pub scan_window: Duration,
    /// Delay before each device is reported.
    pub observe_interval: Duration,
}

impl Default for LoopbackTiming {
    fn default() -> Self {
        Self {
            scan_window: Duration::from_millis(300),
            observe_interval: Duration::from_millis(10),
        }
    }
}

struct Advertisement {
    id: u64,
    service_id: Uuid,
    tx: mpsc::Sender<Box<dyn Connection>>,
}

struct Device {
    name: String,
    radio_enabled: bool,
    reachable: bool,
    visible: bool,
    dial_latency: Duration,
    advertise_count: usize,
    advertisement: Option<Advertisement>,
}

#[derive(Default)]
struct MediumState {
    devices: HashMap<PeerAddress, Device>,
    next_advertisement: u64,
}

/// Shared simulated radio medium.  Clones refer to the same medium.
#[derive(Clone, Default)]
pub struct LoopbackMedium {
    state: Arc<Mutex<MediumState>>,
    timing: LoopbackTiming,
}

impl LoopbackMedium {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timing(timing: LoopbackTiming) -> Self {
        Self {
            state: Arc::default(),
            timing,
        }
    }

    /// Registers a device and returns its radio.  Re-registering an address
    /// renames the device and keeps its other settings.
    pub fn device(&self, name: &str, address: &str) -> LoopbackRadio {
        let address = PeerAddress::from(address);
        let mut state = self.lock();
        state
            .devices
            .entry(address.clone())
            .and_modify(|d| d.name = name.to_string())
            .or_insert_with(|| Device {
                name: name.to_string(),
                radio_enabled: true,
                reachable: true,
                visible: true,
                dial_latency: Duration::ZERO,
                advertise_count: 0,
                advertisement: None,
            });
        LoopbackRadio {
            medium: self.clone(),
            address,
            scan: Arc::new(Mutex::new(None)),
        }
    }

    /// Switches a device's radio on or off.  Switching it off also drops its
    /// advertisement.
    pub fn set_radio_enabled(&self, address: &PeerAddress, enabled: bool) {
        self.update(address, |d| {
            d.radio_enabled = enabled;
            if !enabled {
                d.advertisement = None;
            }
        });
    }

    /// An unreachable device refuses every dial.
    pub fn set_reachable(&self, address: &PeerAddress, reachable: bool) {
        self.update(address, |d| d.reachable = reachable);
    }

    /// An invisible device never appears in scans.
    pub fn set_visible(&self, address: &PeerAddress, visible: bool) {
        self.update(address, |d| d.visible = visible);
    }

    /// Delay every dial *to* `address` by `latency`.
    pub fn set_dial_latency(&self, address: &PeerAddress, latency: Duration) {
        self.update(address, |d| d.dial_latency = latency);
    }

    /// How many times the device at `address` has started advertising.
    pub fn advertise_count(&self, address: &PeerAddress) -> usize {
        self.lock()
            .devices
            .get(address)
            .map_or(0, |d| d.advertise_count)
    }

    fn lock(&self) -> MutexGuard<'_, MediumState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, address: &PeerAddress, f: impl FnOnce(&mut Device)) {
        if let Some(device) = self.lock().devices.get_mut(address) {
            f(device);
        }
    }
}

/// One simulated device's radio.
#[derive(Clone)]
pub struct LoopbackRadio {
    medium: LoopbackMedium,
    address: PeerAddress,
    scan: Arc<Mutex<Option<CancellationToken>>>,
}

impl LoopbackRadio {
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    fn own_name(&self) -> String {
        self.medium
            .lock()
            .devices
            .get(&self.address)
            .map(|d| d.name.clone())
            .unwrap_or_default()
    }

    fn scan_slot(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.scan.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn connect_error(address: &PeerAddress, kind: std::io::ErrorKind, text: &str) -> TransportError {
    TransportError::ConnectFailed {
        address: address.clone(),
        source: std::io::Error::new(kind, text.to_string()),
    }
}

#[async_trait]
impl RadioTransport for LoopbackRadio {
    fn advertise(
        &self,
        service_name: &str,
        service_id: Uuid,
    ) -> Result<Box<dyn ListenHandle>, TransportError> {
        let mut state = self.medium.lock();
        state.next_advertisement += 1;
        let id = state.next_advertisement;
        let device = state
            .devices
            .get_mut(&self.address)
            .ok_or_else(|| TransportError::ResourceUnavailable("device not registered".to_string()))?;
        if !device.radio_enabled {
            return Err(TransportError::ResourceUnavailable(
                "radio is switched off".to_string(),
            ));
        }
        let (tx, rx) = mpsc::channel(LISTEN_BACKLOG);
        device.advertisement = Some(Advertisement { id, service_id, tx });
        device.advertise_count += 1;
        debug!(address = %self.address, %service_name, "loopback device advertising");
        Ok(Box::new(LoopbackListener {
            medium: self.medium.clone(),
            address: self.address.clone(),
            id,
            rx,
        }))
    }

    async fn dial(
        &self,
        address: &PeerAddress,
        service_id: Uuid,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let local_name = self.own_name();
        let latency = {
            let state = self.medium.lock();
            let enabled = state
                .devices
                .get(&self.address)
                .map_or(false, |d| d.radio_enabled);
            if !enabled {
                return Err(connect_error(
                    address,
                    std::io::ErrorKind::NotConnected,
                    "local radio is switched off",
                ));
            }
            state
                .devices
                .get(address)
                .map(|d| d.dial_latency)
                .ok_or_else(|| connect_error(address, std::io::ErrorKind::NotFound, "no such device"))?
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let (remote_name, tx) = {
            let state = self.medium.lock();
            let target = state
                .devices
                .get(address)
                .ok_or_else(|| connect_error(address, std::io::ErrorKind::NotFound, "no such device"))?;
            let advertisement = match &target.advertisement {
                Some(a) if target.reachable && a.service_id == service_id => a,
                _ => {
                    return Err(connect_error(
                        address,
                        std::io::ErrorKind::ConnectionRefused,
                        "service not reachable",
                    ))
                }
            };
            (target.name.clone(), advertisement.tx.clone())
        };

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let inbound: Box<dyn Connection> = Box::new(LoopbackConnection {
            peer_name: local_name,
            stream: remote,
        });
        tx.send(inbound).await.map_err(|_| {
            connect_error(address, std::io::ErrorKind::ConnectionRefused, "listener closed")
        })?;
        Ok(Box::new(LoopbackConnection {
            peer_name: remote_name,
            stream: local,
        }))
    }
}

impl Discovery for LoopbackRadio {
    fn start_scan(&self) -> Result<mpsc::Receiver<ScanEvent>, TransportError> {
        let peers: Vec<(String, PeerAddress)> = {
            let state = self.medium.lock();
            let enabled = state
                .devices
                .get(&self.address)
                .map_or(false, |d| d.radio_enabled);
            if !enabled {
                return Err(TransportError::ResourceUnavailable(
                    "radio is switched off".to_string(),
                ));
            }
            let mut peers: Vec<_> = state
                .devices
                .iter()
                .filter(|(address, d)| {
                    **address != self.address
                        && d.radio_enabled
                        && d.visible
                        && d.advertisement.is_some()
                })
                .map(|(address, d)| (d.name.clone(), address.clone()))
                .collect();
            peers.sort_by(|a, b| a.1.cmp(&b.1));
            peers
        };

        let token = CancellationToken::new();
        if let Some(previous) = self.scan_slot().replace(token.clone()) {
            previous.cancel();
        }

        let (tx, rx) = mpsc::channel(peers.len() + 1);
        let timing = self.medium.timing.clone();
        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + timing.scan_window;
            for (name, address) in peers {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(timing.observe_interval) => {}
                }
                if tx.send(ScanEvent::PeerObserved { name, address }).await.is_err() {
                    return;
                }
            }
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
            let _ = tx.send(ScanEvent::Finished).await;
        });
        Ok(rx)
    }

    fn cancel_scan(&self) {
        if let Some(token) = self.scan_slot().take() {
            token.cancel();
        }
    }
}

struct LoopbackListener {
    medium: LoopbackMedium,
    address: PeerAddress,
    id: u64,
    rx: mpsc::Receiver<Box<dyn Connection>>,
}

#[async_trait]
impl ListenHandle for LoopbackListener {
    async fn accept(&mut self) -> Result<Box<dyn Connection>, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        let id = self.id;
        self.medium.update(&self.address, |d| {
            if d.advertisement.as_ref().map(|a| a.id) == Some(id) {
                d.advertisement = None;
            }
        });
    }
}

struct LoopbackConnection {
    peer_name: String,
    stream: DuplexStream,
}

#[async_trait]
impl Connection for LoopbackConnection {
    fn remote_peer_name(&self) -> &str {
        &self.peer_name
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        read_message(&mut self.stream, buf)
            .await
            .map_err(TransportError::StreamBroken)
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream
            .write_all(bytes)
            .await
            .map_err(TransportError::StreamBroken)?;
        self.stream
            .shutdown()
            .await
            .map_err(TransportError::StreamBroken)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream
            .shutdown()
            .await
            .map_err(TransportError::StreamBroken)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICE: Uuid = Uuid::from_u128(7);

    async fn collect_scan(mut rx: mpsc::Receiver<ScanEvent>) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let finished = event == ScanEvent::Finished;
            events.push(event);
            if finished {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn test_dial_reaches_advertised_device_and_exchanges_names() {
        // Arrange
        let medium = LoopbackMedium::new();
        let alice = medium.device("Alice", "0x01");
        let bob = medium.device("Bob", "0x02");
        let mut listener = bob.advertise("NearChat", SERVICE).unwrap();

        // Act
        let mut outbound = alice.dial(&PeerAddress::from("0x02"), SERVICE).await.unwrap();
        let mut inbound = listener.accept().await.unwrap();
        outbound.write(b"hi").await.unwrap();
        let mut buf = [0u8; 16];
        let n = inbound.read(&mut buf).await.unwrap();

        // Assert
        assert_eq!(outbound.remote_peer_name(), "Bob");
        assert_eq!(inbound.remote_peer_name(), "Alice");
        assert_eq!(&buf[..n], b"hi");
    }

    #[tokio::test]
    async fn test_dial_to_silent_device_fails() {
        let medium = LoopbackMedium::new();
        let alice = medium.device("Alice", "0x01");
        let _bob = medium.device("Bob", "0x02");

        let result = alice.dial(&PeerAddress::from("0x02"), SERVICE).await;

        assert!(matches!(result, Err(TransportError::ConnectFailed { .. })));
    }

    #[tokio::test]
    async fn test_dial_with_other_service_id_fails() {
        let medium = LoopbackMedium::new();
        let alice = medium.device("Alice", "0x01");
        let bob = medium.device("Bob", "0x02");
        let _listener = bob.advertise("NearChat", SERVICE).unwrap();

        let result = alice.dial(&PeerAddress::from("0x02"), Uuid::from_u128(8)).await;

        assert!(matches!(result, Err(TransportError::ConnectFailed { .. })));
    }

    #[tokio::test]
    async fn test_dropping_listener_stops_advertising() {
        // Arrange
        let medium = LoopbackMedium::new();
        let alice = medium.device("Alice", "0x01");
        let bob = medium.device("Bob", "0x02");
        let listener = bob.advertise("NearChat", SERVICE).unwrap();

        // Act
        drop(listener);
        let result = alice.dial(&PeerAddress::from("0x02"), SERVICE).await;

        // Assert
        assert!(result.is_err());
        assert_eq!(medium.advertise_count(&PeerAddress::from("0x02")), 1);
    }

    #[test]
    fn test_advertise_with_radio_off_is_resource_unavailable() {
        let medium = LoopbackMedium::new();
        let bob = medium.device("Bob", "0x02");
        medium.set_radio_enabled(&PeerAddress::from("0x02"), false);

        let result = bob.advertise("NearChat", SERVICE);

        assert!(matches!(result, Err(TransportError::ResourceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_scan_reports_visible_advertising_devices_then_finishes() {
        // Arrange
        let medium = LoopbackMedium::with_timing(LoopbackTiming {
            scan_window: Duration::from_millis(50),
            observe_interval: Duration::from_millis(1),
        });
        let alice = medium.device("Alice", "0x01");
        let bob = medium.device("Bob", "0x02");
        let carol = medium.device("Carol", "0x03");
        let _dave = medium.device("Dave", "0x04");
        let _bob_listener = bob.advertise("NearChat", SERVICE).unwrap();
        let _carol_listener = carol.advertise("NearChat", SERVICE).unwrap();
        let _alice_listener = alice.advertise("NearChat", SERVICE).unwrap();
        medium.set_visible(&PeerAddress::from("0x03"), false);

        // Act
        let events = collect_scan(alice.start_scan().unwrap()).await;

        // Assert – Carol is hidden, Dave is not advertising, Alice is us
        assert_eq!(
            events,
            vec![
                ScanEvent::PeerObserved {
                    name: "Bob".to_string(),
                    address: PeerAddress::from("0x02")
                },
                ScanEvent::Finished
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_scan_finishes_early() {
        // Arrange – a scan window far longer than the test timeout
        let medium = LoopbackMedium::with_timing(LoopbackTiming {
            scan_window: Duration::from_secs(60),
            observe_interval: Duration::from_millis(1),
        });
        let alice = medium.device("Alice", "0x01");
        let rx = alice.start_scan().unwrap();

        // Act
        alice.cancel_scan();
        let events = tokio::time::timeout(Duration::from_secs(5), collect_scan(rx))
            .await
            .expect("cancelled scan must finish");

        // Assert
        assert_eq!(events, vec![ScanEvent::Finished]);
    }
}
