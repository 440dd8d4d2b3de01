//! Connection state machine values and the records that flow through it.
//!
//! # Connection lifecycle
//!
//! ```text
//!            start()                 connect()
//!   None ─────────────►  Listening ─────────────►  Connecting
//!    ▲                     ▲  │                       │   │
//!    │                     │  │ inbound accepted      │   │ dial failed
//!    │     read finished   │  ▼                       │   ▼
//!    │                   Connected ◄──────────────────┘ Listening
//!    │                       │         dial succeeded
//!    └───────────────────────┘
//!       payload written (dialed session only)
//! ```
//!
//! A dialed session that delivered its payload ends in `None`; the dispatcher
//! calls `start()` to resume listening.  Every failure path ends in
//! `Listening` so inbound traffic from other peers keeps flowing.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::events::SessionFailure;

/// Current state of the single transport session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not listening and not dialing.
    None,
    /// Advertising presence and waiting for an inbound connection.
    Listening,
    /// An outbound dial attempt is in progress.
    Connecting,
    /// Exactly one live session exists and its remote peer name is known.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionState::None => "none",
            ConnectionState::Listening => "listening",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(text)
    }
}

/// Opaque transport address of a peer.
///
/// The core never interprets the text: the loopback radio uses arbitrary
/// labels such as `"0xAA"`, the LAN radio uses `ip:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerAddress {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<std::net::SocketAddr> for PeerAddress {
    fn from(value: std::net::SocketAddr) -> Self {
        Self(value.to_string())
    }
}

/// A peer observed during a scan.
///
/// Records are keyed by display name; a later observation of the same name
/// replaces the address.  Records are never evicted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub display_name: String,
    pub address: PeerAddress,
}

/// One outstanding "send this payload to this named peer" request.
///
/// Each call to `send` produces an independent value; queued requests never
/// share storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub destination: String,
    pub payload: Vec<u8>,
}

impl PendingSend {
    pub fn new(destination: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            destination: destination.into(),
            payload: payload.into(),
        }
    }
}

/// Generation number of one outbound dial attempt.
///
/// A newer attempt supersedes every older one; completions carrying an
/// older id are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptId(pub u64);

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Sequence number of one discovery scan.  Later scans compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ScanId(pub u64);

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scan-{}", self.0)
    }
}

/// Terminal outcome of one dial attempt, as seen by whoever issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialOutcome {
    /// The payload was written to a session connected to the destination.
    Delivered,
    /// The attempt failed; the session manager has returned to listening.
    Failed(SessionFailure),
    /// A newer `connect`, `start`, or `stop` superseded the attempt.
    Cancelled,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display_is_lowercase() {
        assert_eq!(ConnectionState::None.to_string(), "none");
        assert_eq!(ConnectionState::Listening.to_string(), "listening");
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
    }

    #[test]
    fn test_peer_address_from_socket_addr_uses_ip_and_port() {
        // Arrange
        let socket: std::net::SocketAddr = "192.168.1.20:24900".parse().unwrap();

        // Act
        let address = PeerAddress::from(socket);

        // Assert
        assert_eq!(address.as_str(), "192.168.1.20:24900");
    }

    #[test]
    fn test_pending_send_values_are_independent() {
        // Arrange – two requests built from the same buffer
        let mut text = b"hello".to_vec();
        let first = PendingSend::new("Bob", text.clone());
        text.clear();
        text.extend_from_slice(b"bye");
        let second = PendingSend::new("Carol", text);

        // Assert – the first request is unaffected by later edits
        assert_eq!(first.destination, "Bob");
        assert_eq!(first.payload, b"hello");
        assert_eq!(second.payload, b"bye");
    }

    #[test]
    fn test_attempt_ids_order_by_generation() {
        assert!(AttemptId(2) > AttemptId(1));
        assert_eq!(AttemptId(7).to_string(), "#7");
    }

    #[test]
    fn test_scan_id_default_is_zero() {
        assert_eq!(ScanId::default(), ScanId(0));
        assert!(ScanId(1) > ScanId::default());
    }
}
