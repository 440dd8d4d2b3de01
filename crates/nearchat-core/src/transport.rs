//! Contract of the short-range radio transport.
//!
//! The node consumes the radio only through these traits.  Blocking
//! operations are `async` and are cancelled by dropping their future; a
//! dropped [`ListenHandle`] or [`Connection`] closes the underlying socket.
//!
//! ```text
//! RadioTransport::advertise ──► ListenHandle::accept ──► Connection (inbound)
//! RadioTransport::dial      ──────────────────────────► Connection (outbound)
//! Discovery::start_scan     ──► ScanEvent::PeerObserved … ScanEvent::Finished
//! ```

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::state::PeerAddress;

/// Errors raised by transport implementations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The listening capability could not be created (radio off or busy).
    #[error("radio resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// The dial could not establish a link.
    #[error("failed to connect to {address}: {source}")]
    ConnectFailed {
        address: PeerAddress,
        #[source]
        source: std::io::Error,
    },

    /// A read or write failed on an established connection.
    #[error("stream broken: {0}")]
    StreamBroken(#[source] std::io::Error),

    /// The address text is not valid for this transport.
    #[error("invalid peer address: {0}")]
    InvalidAddress(PeerAddress),

    /// The listening handle was closed.
    #[error("listener closed")]
    Closed,
}

/// A listening capability created by [`RadioTransport::advertise`].
#[async_trait]
pub trait ListenHandle: Send {
    /// Waits for the next inbound connection.
    async fn accept(&mut self) -> Result<Box<dyn Connection>, TransportError>;
}

/// One established link, used for exactly one message.
#[async_trait]
pub trait Connection: Send {
    /// Display name of the device on the other end.
    fn remote_peer_name(&self) -> &str;

    /// Reads one message into `buf`, returning the number of bytes read.
    /// Zero means the peer closed without sending anything.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Writes the whole message and signals its end to the peer.
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Closes the link.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Connection-oriented half of the radio.
#[async_trait]
pub trait RadioTransport: Send + Sync {
    /// Starts advertising the service and returns the listening capability.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ResourceUnavailable`] if the radio is off or
    /// the service cannot be registered.
    fn advertise(
        &self,
        service_name: &str,
        service_id: Uuid,
    ) -> Result<Box<dyn ListenHandle>, TransportError>;

    /// Opens an outbound connection to `address`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectFailed`] if the link cannot be made.
    async fn dial(
        &self,
        address: &PeerAddress,
        service_id: Uuid,
    ) -> Result<Box<dyn Connection>, TransportError>;
}

/// Events produced by a discovery scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// A device answered the inquiry.
    PeerObserved { name: String, address: PeerAddress },
    /// The scan ended, either because its window elapsed or it was cancelled.
    Finished,
}

/// Inquiry half of the radio.
pub trait Discovery: Send + Sync {
    /// Starts a scan.  Events arrive on the returned receiver and end with
    /// [`ScanEvent::Finished`].
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ResourceUnavailable`] if the radio cannot scan.
    fn start_scan(&self) -> Result<mpsc::Receiver<ScanEvent>, TransportError>;

    /// Cancels the running scan, if any.
    fn cancel_scan(&self);
}
