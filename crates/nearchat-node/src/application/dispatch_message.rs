//! DispatchMessageUseCase: delivers queued messages to peers addressed by name.
//!
//! Each `send` becomes an independent [`PendingSend`] in a FIFO queue.  A
//! single worker task takes one request at a time and drives it to a
//! terminal outcome before looking at the next:
//!
//! ```text
//! lookup(dest) ──hit──────────────────────────────► connect(addr, send)
//!     │                                                   │
//!    miss                                     Delivered / Failed / timeout
//!     ▼                                                   ▼
//! begin_scan(dest) ─► scan_finished ─► lookup(dest)    start()  (resume listening)
//!                                         │
//!                                        miss ─► Unreachable(dest), drop
//! ```
//!
//! The dispatcher never retries and never reroutes: an unreachable or failed
//! send is reported and dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nearchat_core::{
    AttemptId, DialOutcome, EventSink, NodeEvent, PeerAddress, PendingSend, ScanId,
    SessionFailure,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Error returned by the session manager's `start`.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The listening capability could not be created.
    #[error("cannot start listening: {0}")]
    ResourceUnavailable(String),
}

/// Error type for [`MessageDispatcher::send`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("refusing to send an empty message")]
    EmptyPayload,
    #[error("dispatcher has shut down")]
    Closed,
}

/// Handle to one dial attempt started by [`SessionControl::connect`].
#[derive(Debug)]
pub struct DialAttempt {
    pub id: AttemptId,
    /// Resolves once the attempt reaches a terminal outcome.  A dropped sender
    /// means the attempt was torn down without reporting.
    pub outcome: oneshot::Receiver<DialOutcome>,
}

/// The part of the session manager the dispatcher drives.
#[cfg_attr(test, mockall::automock)]
pub trait SessionControl: Send + Sync {
    /// Resumes listening; cancels any outstanding dial.
    fn start(&self) -> Result<(), SessionError>;

    /// Dials `address` and writes `send.payload` once connected to
    /// `send.destination`.  Supersedes any outstanding dial.
    fn connect(&self, address: PeerAddress, send: PendingSend) -> DialAttempt;
}

/// The part of the peer resolver the dispatcher drives.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Synchronous lookup of a display name.
    fn lookup(&self, name: &str) -> Option<PeerAddress>;

    /// Starts (or restarts) a scan, optionally ending it early once `target`
    /// is observed.
    fn begin_scan(&self, target: Option<&str>) -> ScanId;

    /// Waits until `scan`, or a scan that superseded it, has finished.
    async fn scan_finished(&self, scan: ScanId);
}

/// Tunables for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Upper bound on one send attempt after the address is resolved.
    pub send_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(30),
        }
    }
}

/// Terminal outcome of one queued send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    Failed,
    Unreachable,
}

/// FIFO message dispatcher.
///
/// Dropping the dispatcher stops its worker; requests still queued are
/// discarded.
pub struct MessageDispatcher {
    queue: mpsc::UnboundedSender<PendingSend>,
    queued: Arc<AtomicUsize>,
    worker: JoinHandle<()>,
}

impl MessageDispatcher {
    /// Spawns the dispatch worker on the current Tokio runtime.
    pub fn spawn(
        session: Arc<dyn SessionControl>,
        peers: Arc<dyn PeerDirectory>,
        events: EventSink,
        config: DispatchConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let worker = DispatchWorker {
            session,
            peers,
            events,
            config,
        };
        let handle = tokio::spawn(worker.run(rx, Arc::clone(&queued)));
        Self {
            queue: tx,
            queued,
            worker: handle,
        }
    }

    /// Queues `payload` for delivery to the peer named `destination`.
    ///
    /// The outcome is reported on the event stream.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::EmptyPayload`] for an empty message and
    /// [`DispatchError::Closed`] after shutdown.
    pub fn send(
        &self,
        destination: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), DispatchError> {
        let request = PendingSend::new(destination, payload);
        if request.payload.is_empty() {
            return Err(DispatchError::EmptyPayload);
        }
        self.queued.fetch_add(1, Ordering::SeqCst);
        if self.queue.send(request).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(DispatchError::Closed);
        }
        Ok(())
    }

    /// Number of sends accepted but not yet finished, including the one in flight.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Stops the worker.  The send in flight, if any, is abandoned.
    pub fn shutdown(&self) {
        self.worker.abort();
    }
}

impl Drop for MessageDispatcher {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

struct DispatchWorker {
    session: Arc<dyn SessionControl>,
    peers: Arc<dyn PeerDirectory>,
    events: EventSink,
    config: DispatchConfig,
}

impl DispatchWorker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<PendingSend>, queued: Arc<AtomicUsize>) {
        while let Some(request) = rx.recv().await {
            let destination = request.destination.clone();
            let outcome = self.process(request).await;
            debug!(%destination, ?outcome, "send finished");
            queued.fetch_sub(1, Ordering::SeqCst);
            self.events.emit(NodeEvent::SendFinished {
                destination,
                delivered: outcome == SendOutcome::Delivered,
            });
        }
        debug!("dispatch queue closed");
    }

    async fn process(&self, request: PendingSend) -> SendOutcome {
        let Some(address) = self.resolve(&request.destination).await else {
            warn!(destination = %request.destination, "destination unreachable after scan");
            self.events.emit(NodeEvent::Unreachable {
                destination: request.destination,
            });
            return SendOutcome::Unreachable;
        };

        info!(destination = %request.destination, %address, "connecting to deliver message");
        let attempt = self.session.connect(address, request);
        let attempt_id = attempt.id;

        let outcome = match tokio::time::timeout(self.config.send_timeout, attempt.outcome).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => DialOutcome::Cancelled,
            Err(_) => {
                warn!(attempt = %attempt_id, "send attempt timed out");
                let failure = SessionFailure::TimedOut {
                    operation: "send attempt",
                };
                self.events.emit(NodeEvent::TransientFailure {
                    attempt: Some(attempt_id),
                    failure: failure.clone(),
                });
                DialOutcome::Failed(failure)
            }
        };

        // Resume listening after every attempt so other peers can reach us.
        if let Err(e) = self.session.start() {
            error!("failed to resume listening after send: {e}");
        }

        match outcome {
            DialOutcome::Delivered => SendOutcome::Delivered,
            DialOutcome::Failed(failure) => {
                debug!(attempt = %attempt_id, "send failed: {failure}");
                SendOutcome::Failed
            }
            DialOutcome::Cancelled => {
                debug!(attempt = %attempt_id, "send attempt was superseded");
                SendOutcome::Failed
            }
        }
    }

    async fn resolve(&self, destination: &str) -> Option<PeerAddress> {
        if let Some(address) = self.peers.lookup(destination) {
            return Some(address);
        }
        debug!(%destination, "address unknown; scanning");
        let scan = self.peers.begin_scan(Some(destination));
        self.peers.scan_finished(scan).await;
        self.peers.lookup(destination)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
