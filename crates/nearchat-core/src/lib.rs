//! # nearchat-core
//!
//! Shared library for NearChat containing the domain types, the contract of
//! the short-range radio transport, and the wire formats used by the LAN
//! radio adapter.
//!
//! This crate has no dependency on sockets or platform radio APIs.  The node
//! crate supplies concrete transports and the components that drive them.
//!
//! # Architecture overview
//!
//! NearChat delivers short text messages between nearby devices.  A peer is
//! addressed by its human-readable display name; the node discovers the
//! peer's transport address with a scan, opens a one-shot connection, writes
//! the message, and closes the connection again.
//!
//! - **`domain`** – Connection states, peer records, pending sends, attempt
//!   identifiers, and the [`NodeEvent`] stream every component reports on.
//!
//! - **`transport`** – The external capability as traits: advertise presence,
//!   accept inbound connections, dial outbound connections, read/write one
//!   message, and scan for peers.
//!
//! - **`protocol`** – Discovery datagrams and the connection name preamble
//!   spoken by the LAN radio adapter.

pub mod domain;
pub mod protocol;
pub mod transport;

pub use domain::events::{EventSink, NodeEvent, SessionFailure};
pub use domain::state::{
    AttemptId, ConnectionState, DialOutcome, PeerAddress, PeerRecord, PendingSend, ScanId,
};
pub use protocol::ProtocolError;
pub use transport::{
    Connection, Discovery, ListenHandle, RadioTransport, ScanEvent, TransportError,
};
