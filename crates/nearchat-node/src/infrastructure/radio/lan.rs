//! LAN radio: TCP links and UDP broadcast inquiry.
//!
//! # Advertising
//!
//! `advertise` binds the TCP listener on `listen_port` and starts a beacon
//! responder on the UDP `discovery_port`.  The responder runs on a dedicated
//! thread with a 500 ms read timeout so it can notice shutdown; it stops when
//! the listen handle is dropped.
//!
//! # Scanning
//!
//! A scan broadcasts one `Probe` datagram to `broadcast_address:discovery_port`
//! and collects the `Beacon` answers until the scan window closes or the scan
//! is cancelled.  Every beacon names the device and the TCP port it accepts
//! connections on; the peer address is `source_ip:port`.
//!
//! # Connections
//!
//! Both ends send a name preamble right after the TCP handshake (see
//! `nearchat_core::protocol::preamble`).  The listener drops connections whose
//! preamble is missing or malformed and keeps accepting.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use nearchat_core::protocol::{
    decode_discovery, encode_discovery, read_preamble, write_preamble, DiscoveryMessage,
};
use nearchat_core::{
    Connection, Discovery, ListenHandle, PeerAddress, ProtocolError, RadioTransport, ScanEvent,
    TransportError,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::read_message;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const RESPONDER_READ_TIMEOUT: Duration = Duration::from_millis(500);
const SCAN_EVENT_CAPACITY: usize = 64;

/// Settings for the LAN radio.
#[derive(Debug, Clone)]
pub struct LanRadioConfig {
    /// Display name sent in every preamble and beacon.
    pub name: String,
    /// Service id scans look for.
    pub service_id: Uuid,
    pub bind_address: IpAddr,
    pub broadcast_address: IpAddr,
    /// TCP port to accept connections on.  `0` picks a free port.
    pub listen_port: u16,
    /// UDP port beacons are answered on and probes are sent to.
    pub discovery_port: u16,
    /// How long a scan collects beacons.
    pub scan_window: Duration,
}

impl Default for LanRadioConfig {
    fn default() -> Self {
        Self {
            name: "NearChat".to_string(),
            service_id: Uuid::from_u128(0xfa87c0d0_afac_11de_8a39_0800200c9a66),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            broadcast_address: IpAddr::V4(Ipv4Addr::BROADCAST),
            listen_port: 24900,
            discovery_port: 24901,
            scan_window: Duration::from_secs(12),
        }
    }
}

/// Radio adapter over the local network.
pub struct LanRadio {
    config: LanRadioConfig,
    /// Random per-process id used to ignore our own beacons.
    instance: Uuid,
    scan: Mutex<Option<CancellationToken>>,
}

impl LanRadio {
    pub fn new(config: LanRadioConfig) -> Self {
        Self {
            config,
            instance: Uuid::new_v4(),
            scan: Mutex::new(None),
        }
    }

    fn scan_slot(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.scan.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RadioTransport for LanRadio {
    fn advertise(
        &self,
        service_name: &str,
        service_id: Uuid,
    ) -> Result<Box<dyn ListenHandle>, TransportError> {
        let addr = SocketAddr::new(self.config.bind_address, self.config.listen_port);
        let std_listener = std::net::TcpListener::bind(addr)
            .map_err(|e| TransportError::ResourceUnavailable(format!("bind {addr}: {e}")))?;
        std_listener
            .set_nonblocking(true)
            .map_err(|e| TransportError::ResourceUnavailable(e.to_string()))?;
        let listener = TcpListener::from_std(std_listener)
            .map_err(|e| TransportError::ResourceUnavailable(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| TransportError::ResourceUnavailable(e.to_string()))?
            .port();

        let running = Arc::new(AtomicBool::new(true));
        let beacon = DiscoveryMessage::Beacon {
            service_id,
            instance: self.instance,
            name: self.config.name.clone(),
            port,
        };
        // Without a responder the device still accepts connections; it just
        // cannot be found by scanning.
        if let Err(e) = start_beacon_responder(
            SocketAddr::new(self.config.bind_address, self.config.discovery_port),
            beacon,
            Arc::clone(&running),
        ) {
            warn!("beacon responder unavailable, device will not be discoverable: {e}");
        }

        info!(%service_name, port, "advertising on TCP");
        Ok(Box::new(LanListener {
            listener,
            name: self.config.name.clone(),
            running,
        }))
    }

    async fn dial(
        &self,
        address: &PeerAddress,
        _service_id: Uuid,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let target: SocketAddr = address
            .as_str()
            .parse()
            .map_err(|_| TransportError::InvalidAddress(address.clone()))?;
        let connect_failed = |source: std::io::Error| TransportError::ConnectFailed {
            address: address.clone(),
            source,
        };

        let mut stream = TcpStream::connect(target).await.map_err(connect_failed)?;
        let peer_name = exchange_names(&mut stream, &self.config.name)
            .await
            .map_err(|e| connect_failed(protocol_to_io(e)))?;
        debug!(%target, %peer_name, "outbound link established");
        Ok(Box::new(LanConnection { stream, peer_name }))
    }
}

impl Discovery for LanRadio {
    fn start_scan(&self) -> Result<mpsc::Receiver<ScanEvent>, TransportError> {
        let unavailable = |e: std::io::Error| TransportError::ResourceUnavailable(e.to_string());
        let std_socket =
            UdpSocket::bind(SocketAddr::new(self.config.bind_address, 0)).map_err(unavailable)?;
        std_socket.set_broadcast(true).map_err(unavailable)?;
        std_socket.set_nonblocking(true).map_err(unavailable)?;
        let socket = tokio::net::UdpSocket::from_std(std_socket).map_err(unavailable)?;

        let probe = encode_discovery(&DiscoveryMessage::Probe {
            service_id: self.config.service_id,
        })
        .map_err(|e| TransportError::ResourceUnavailable(e.to_string()))?;

        let token = CancellationToken::new();
        if let Some(previous) = self.scan_slot().replace(token.clone()) {
            previous.cancel();
        }

        let (tx, rx) = mpsc::channel(SCAN_EVENT_CAPACITY);
        let destination = SocketAddr::new(self.config.broadcast_address, self.config.discovery_port);
        let scan = ScanTask {
            socket,
            service_id: self.config.service_id,
            instance: self.instance,
            window: self.config.scan_window,
            tx,
        };
        tokio::spawn(scan.run(probe, destination, token));
        Ok(rx)
    }

    fn cancel_scan(&self) {
        if let Some(token) = self.scan_slot().take() {
            token.cancel();
        }
    }
}

struct ScanTask {
    socket: tokio::net::UdpSocket,
    service_id: Uuid,
    instance: Uuid,
    window: Duration,
    tx: mpsc::Sender<ScanEvent>,
}

impl ScanTask {
    async fn run(self, probe: Vec<u8>, destination: SocketAddr, token: CancellationToken) {
        if let Err(e) = self.socket.send_to(&probe, destination).await {
            warn!("failed to broadcast probe to {destination}: {e}");
        }

        let deadline = tokio::time::sleep(self.window);
        tokio::pin!(deadline);
        let mut seen = HashSet::new();
        let mut buf = vec![0u8; 1024];
        loop {
            let received = tokio::select! {
                _ = token.cancelled() => break,
                _ = &mut deadline => break,
                result = self.socket.recv_from(&mut buf) => result,
            };
            let (len, src) = match received {
                Ok(pair) => pair,
                Err(e) => {
                    debug!("scan recv error: {e}");
                    continue;
                }
            };
            match decode_discovery(&buf[..len]) {
                Ok(DiscoveryMessage::Beacon {
                    service_id,
                    instance,
                    name,
                    port,
                }) if service_id == self.service_id && instance != self.instance => {
                    if !seen.insert(instance) {
                        continue;
                    }
                    let address = PeerAddress::from(SocketAddr::new(src.ip(), port));
                    debug!(%name, %address, "beacon received");
                    if self
                        .tx
                        .send(ScanEvent::PeerObserved { name, address })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => debug!("ignoring datagram from {src}: {e}"),
            }
        }
        let _ = self.tx.send(ScanEvent::Finished).await;
    }
}

/// Binds the discovery port and answers matching probes on a dedicated thread
/// until `running` is cleared.
fn start_beacon_responder(
    addr: SocketAddr,
    beacon: DiscoveryMessage,
    running: Arc<AtomicBool>,
) -> std::io::Result<()> {
    let socket = UdpSocket::bind(addr)?;
    socket.set_read_timeout(Some(RESPONDER_READ_TIMEOUT))?;
    let reply = encode_discovery(&beacon).map_err(protocol_to_io)?;
    let service_id = beacon.service_id();

    std::thread::Builder::new()
        .name("nearchat-beacon".to_string())
        .spawn(move || responder_loop(socket, service_id, reply, running))?;
    info!("beacon responder listening on UDP {addr}");
    Ok(())
}

fn responder_loop(socket: UdpSocket, service_id: Uuid, reply: Vec<u8>, running: Arc<AtomicBool>) {
    let mut buf = vec![0u8; 1024];
    while running.load(Ordering::Relaxed) {
        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if is_timeout_error(&e) => continue,
            Err(e) => {
                warn!("beacon responder recv error: {e}");
                continue;
            }
        };
        match decode_discovery(&buf[..len]) {
            Ok(DiscoveryMessage::Probe { service_id: probed }) if probed == service_id => {
                debug!("probe from {src}");
                if let Err(e) = socket.send_to(&reply, src) {
                    warn!("failed to answer probe from {src}: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => debug!("ignoring datagram from {src}: {e}"),
        }
    }
    info!("beacon responder stopped");
}

fn is_timeout_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

fn protocol_to_io(error: ProtocolError) -> std::io::Error {
    match error {
        ProtocolError::Io(e) => e,
        other => std::io::Error::new(std::io::ErrorKind::InvalidData, other.to_string()),
    }
}

/// Sends our name and reads the peer's, bounded by [`HANDSHAKE_TIMEOUT`].
async fn exchange_names(stream: &mut TcpStream, own_name: &str) -> Result<String, ProtocolError> {
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(stream, own_name)).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "name preamble timed out",
        ))),
    }
}

async fn handshake(stream: &mut TcpStream, own_name: &str) -> Result<String, ProtocolError> {
    write_preamble(&mut *stream, own_name).await?;
    read_preamble(stream).await
}

struct LanListener {
    listener: TcpListener,
    name: String,
    running: Arc<AtomicBool>,
}

#[async_trait]
impl ListenHandle for LanListener {
    async fn accept(&mut self) -> Result<Box<dyn Connection>, TransportError> {
        loop {
            let (mut stream, src) = self
                .listener
                .accept()
                .await
                .map_err(TransportError::StreamBroken)?;
            match exchange_names(&mut stream, &self.name).await {
                Ok(peer_name) => {
                    debug!(%src, %peer_name, "inbound link established");
                    return Ok(Box::new(LanConnection { stream, peer_name }));
                }
                Err(e) => warn!("dropping connection from {src}: {e}"),
            }
        }
    }
}

impl Drop for LanListener {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

struct LanConnection {
    stream: TcpStream,
    peer_name: String,
}

#[async_trait]
impl Connection for LanConnection {
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
        match self.stream.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(TransportError::StreamBroken(e)),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn free_tcp_port() -> u16 {
        std::net::TcpListener::bind((LOCALHOST, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn free_udp_port() -> u16 {
        UdpSocket::bind((LOCALHOST, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn radio(name: &str, listen_port: u16, discovery_port: u16) -> LanRadio {
        LanRadio::new(LanRadioConfig {
            name: name.to_string(),
            bind_address: LOCALHOST,
            broadcast_address: LOCALHOST,
            listen_port,
            discovery_port,
            scan_window: Duration::from_millis(300),
            ..LanRadioConfig::default()
        })
    }

    async fn collect_scan(mut rx: mpsc::Receiver<ScanEvent>) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = event == ScanEvent::Finished;
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn test_dial_and_accept_exchange_names_and_one_message() {
        // Arrange
        let port = free_tcp_port();
        let bob = radio("Bob", port, free_udp_port());
        let alice = radio("Alice", 0, free_udp_port());
        let mut listener = bob.advertise("NearChat", bob.config.service_id).unwrap();
        let address = PeerAddress::from(SocketAddr::new(LOCALHOST, port));

        // Act
        let (outbound, inbound) = tokio::join!(
            alice.dial(&address, alice.config.service_id),
            listener.accept()
        );
        let mut outbound = outbound.unwrap();
        let mut inbound = inbound.unwrap();
        outbound.write(b"hi over tcp").await.unwrap();
        let mut buf = [0u8; 64];
        let n = inbound.read(&mut buf).await.unwrap();

        // Assert
        assert_eq!(outbound.remote_peer_name(), "Bob");
        assert_eq!(inbound.remote_peer_name(), "Alice");
        assert_eq!(&buf[..n], b"hi over tcp");
    }

    #[tokio::test]
    async fn test_scan_discovers_advertising_peer() {
        // Arrange – Alice probes the port Bob's responder is bound to
        let port = free_tcp_port();
        let discovery_port = free_udp_port();
        let bob = radio("Bob", port, discovery_port);
        let alice = radio("Alice", 0, discovery_port);
        let _listener = bob.advertise("NearChat", bob.config.service_id).unwrap();

        // Act
        let events = collect_scan(alice.start_scan().unwrap()).await;

        // Assert
        assert_eq!(
            events,
            vec![
                ScanEvent::PeerObserved {
                    name: "Bob".to_string(),
                    address: PeerAddress::from(SocketAddr::new(LOCALHOST, port)),
                },
                ScanEvent::Finished
            ]
        );
    }

    #[tokio::test]
    async fn test_scan_ignores_own_beacon() {
        // Arrange – one radio advertising and scanning on the same port
        let solo = radio("Solo", free_tcp_port(), free_udp_port());
        let _listener = solo.advertise("NearChat", solo.config.service_id).unwrap();

        // Act
        let events = collect_scan(solo.start_scan().unwrap()).await;

        // Assert
        assert_eq!(events, vec![ScanEvent::Finished]);
    }

    #[tokio::test]
    async fn test_cancel_scan_finishes_before_window() {
        // Arrange
        let alice = LanRadio::new(LanRadioConfig {
            scan_window: Duration::from_secs(60),
            ..radio("Alice", 0, free_udp_port()).config
        });
        let rx = alice.start_scan().unwrap();

        // Act
        alice.cancel_scan();
        let events = tokio::time::timeout(Duration::from_secs(5), collect_scan(rx))
            .await
            .expect("cancelled scan must finish");

        // Assert
        assert_eq!(events, vec![ScanEvent::Finished]);
    }

    #[tokio::test]
    async fn test_dial_rejects_non_socket_address() {
        let alice = radio("Alice", 0, free_udp_port());

        let result = alice
            .dial(&PeerAddress::from("0xAA"), alice.config.service_id)
            .await;

        assert!(matches!(result, Err(TransportError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn test_dial_to_closed_port_is_connect_failed() {
        // Arrange – the port was free a moment ago, nobody listens on it
        let port = free_tcp_port();
        let alice = radio("Alice", 0, free_udp_port());

        // Act
        let result = alice
            .dial(
                &PeerAddress::from(SocketAddr::new(LOCALHOST, port)),
                alice.config.service_id,
            )
            .await;

        // Assert
        assert!(matches!(result, Err(TransportError::ConnectFailed { .. })));
    }

    #[tokio::test]
    async fn test_advertise_on_taken_port_is_resource_unavailable() {
        // Arrange
        let taken = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();
        let bob = radio("Bob", port, free_udp_port());

        // Act
        let result = bob.advertise("NearChat", bob.config.service_id);

        // Assert
        assert!(matches!(result, Err(TransportError::ResourceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_listener_drops_client_with_bad_preamble_and_keeps_accepting() {
        // Arrange
        let port = free_tcp_port();
        let bob = radio("Bob", port, free_udp_port());
        let alice = radio("Alice", 0, free_udp_port());
        let mut listener = bob.advertise("NearChat", bob.config.service_id).unwrap();
        let address = PeerAddress::from(SocketAddr::new(LOCALHOST, port));

        // Act – a client announcing a zero-length name, then a proper dial
        let mut bad = TcpStream::connect((LOCALHOST, port)).await.unwrap();
        bad.write_all(&[0]).await.unwrap();
        let (accepted, dialed) = tokio::join!(
            listener.accept(),
            alice.dial(&address, alice.config.service_id)
        );

        // Assert
        assert_eq!(accepted.unwrap().remote_peer_name(), "Alice");
        assert_eq!(dialed.unwrap().remote_peer_name(), "Bob");
    }
}
