//! Events reported by the node components to the presentation layer.
//!
//! Every component holds a clone of the same [`EventSink`].  The sink wraps an
//! unbounded channel so emitting never blocks and can happen while the
//! session lock is held; that is what keeps `StateChanged` events in the
//! order the transitions happened.

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

use crate::domain::state::{AttemptId, ConnectionState, PeerAddress, ScanId};

/// A non-fatal transport failure.
///
/// Failures are handled locally by returning the session manager to
/// `Listening`; they are reported so the front end can tell the user.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionFailure {
    /// The dial could not establish a link to the peer.
    #[error("unable to connect to {address}: {reason}")]
    ConnectFailed { address: PeerAddress, reason: String },

    /// A read or write failed in the middle of a session.
    #[error("connection was lost: {reason}")]
    StreamBroken { reason: String },

    /// The dialed device answered with a different name than the destination.
    #[error("connected to {actual} but the message is addressed to {expected}")]
    PeerMismatch { expected: String, actual: String },

    /// A bounded wait expired.
    #[error("{operation} timed out")]
    TimedOut { operation: &'static str },

    /// The listening capability stopped working and could not be restored.
    #[error("listener unavailable: {reason}")]
    ListenerLost { reason: String },
}

/// Everything the node reports upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// The session manager moved to a new state.
    StateChanged(ConnectionState),
    /// An inbound session delivered one message.
    MessageReceived { from: String, payload: Vec<u8> },
    /// A dialed session wrote its payload.
    MessageSent {
        attempt: AttemptId,
        destination: String,
        payload: Vec<u8>,
    },
    /// A session is connected and the remote device's name is known.
    DeviceNameResolved { peer: String },
    /// A discovery scan began.
    ScanStarted { scan: ScanId },
    /// A scan observed a peer.
    PeerDiscovered { name: String, address: PeerAddress },
    /// A scan completed, whether or not the searched-for peer was found.
    ScanFinished { scan: ScanId },
    /// The destination was still unknown after a full scan; the send was dropped.
    Unreachable { destination: String },
    /// A connect, read, or write failed.  `attempt` is set when the failure
    /// belongs to an outbound dial.
    TransientFailure {
        attempt: Option<AttemptId>,
        failure: SessionFailure,
    },
    /// The dispatcher finished with one queued send and moved on.
    SendFinished { destination: String, delivered: bool },
}

/// Cloneable sending side of the node event stream.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<NodeEvent>,
}

impl EventSink {
    /// Creates a sink together with the receiver the front end reads from.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emits one event.  A dropped receiver is not an error: the node keeps
    /// working without an observer.
    pub fn emit(&self, event: NodeEvent) {
        if self.tx.send(event).is_err() {
            trace!("node event dropped: receiver closed");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_delivers_events_in_order() {
        // Arrange
        let (sink, mut rx) = EventSink::channel();

        // Act
        sink.emit(NodeEvent::StateChanged(ConnectionState::Listening));
        sink.emit(NodeEvent::StateChanged(ConnectionState::Connecting));

        // Assert
        assert_eq!(
            rx.try_recv().unwrap(),
            NodeEvent::StateChanged(ConnectionState::Listening)
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            NodeEvent::StateChanged(ConnectionState::Connecting)
        );
    }

    #[test]
    fn test_emit_after_receiver_dropped_does_not_panic() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(NodeEvent::Unreachable {
            destination: "Ghost".to_string(),
        });
    }

    #[test]
    fn test_session_failure_messages_name_the_peer() {
        let failure = SessionFailure::ConnectFailed {
            address: PeerAddress::from("0xAA"),
            reason: "refused".to_string(),
        };
        assert_eq!(failure.to_string(), "unable to connect to 0xAA: refused");

        let mismatch = SessionFailure::PeerMismatch {
            expected: "Bob".to_string(),
            actual: "Mallory".to_string(),
        };
        assert!(mismatch.to_string().contains("Mallory"));
    }
}
