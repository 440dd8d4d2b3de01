//! SessionManager: the single transport session state machine.
//!
//! Two independently scheduled paths share one [`ConnectionState`]:
//!
//! - the **accept loop**, spawned by `start()`, which waits for inbound
//!   connections and reads exactly one message from each;
//! - at most one **dial task**, spawned by `connect()`, which opens an
//!   outbound connection, writes exactly one message, and closes it.
//!
//! Every transition happens under one mutex.  Accept, connect, read, and write
//! run outside it.  Each background task carries a generation number and a
//! [`CancellationToken`]; before committing a transition a task checks that it
//! still owns its slot, so a superseded dial that races past cancellation
//! cannot touch the state.
//!
//! The two paths never hold a live session at the same time.  A dial issued
//! while an inbound message is being read waits for the read to finish, and an
//! inbound connection accepted while a dial is outstanding waits for the dial
//! to settle.  Waiters are woken through a shared [`Notify`].
//!
//! A delivered dial leaves the state at `None` until the next `start()`.  The
//! accept loop keeps serving inbound messages meanwhile, and such a session
//! ends in `None` as well.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nearchat_core::{
    AttemptId, Connection, ConnectionState, DialOutcome, EventSink, ListenHandle, NodeEvent,
    PeerAddress, PendingSend, RadioTransport, SessionFailure, TransportError,
};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::dispatch_message::{DialAttempt, SessionControl, SessionError};

/// Settings for the session manager.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Service name advertised to peers.
    pub service_name: String,
    /// Service id both ends must agree on.
    pub service_id: Uuid,
    /// Upper bound on establishing an outbound connection.
    pub connect_timeout: Duration,
    /// Upper bound on the single read or write of a session.
    pub io_timeout: Duration,
    /// Size of the inbound read buffer; longer messages are truncated.
    pub max_message_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_name: "NearChat".to_string(),
            service_id: Uuid::from_u128(0xfa87c0d0_afac_11de_8a39_0800200c9a66),
            connect_timeout: Duration::from_secs(12),
            io_timeout: Duration::from_secs(10),
            max_message_bytes: 1024,
        }
    }
}

struct TaskSlot {
    generation: u64,
    token: CancellationToken,
}

struct DialSlot {
    attempt: AttemptId,
    token: CancellationToken,
}

struct Inner {
    state: ConnectionState,
    accept: Option<TaskSlot>,
    dial: Option<DialSlot>,
    /// Generation of the accept loop whose inbound session is live.
    inbound: Option<u64>,
    connected_peer: Option<String>,
    /// Whether a finished session returns to `Listening`.  Cleared by a
    /// delivered dial, set again by the next `start()`.
    resume_listening: bool,
    next_generation: u64,
}

impl Inner {
    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn owns_dial(&self, attempt: AttemptId) -> bool {
        self.dial.as_ref().map(|d| d.attempt) == Some(attempt)
    }

    fn owns_accept(&self, generation: u64) -> bool {
        self.accept.as_ref().map(|a| a.generation) == Some(generation)
    }
}

struct Shared {
    transport: Arc<dyn RadioTransport>,
    config: SessionConfig,
    events: EventSink,
    inner: Mutex<Inner>,
    /// Signalled whenever a dial or an inbound session settles.
    settled: Notify,
}

/// The transport session manager.  Cheap to clone; clones share one state.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    /// Creates a manager in [`ConnectionState::None`].  Nothing runs until
    /// [`start`](Self::start) or [`connect`](Self::connect) is called.
    pub fn new(transport: Arc<dyn RadioTransport>, config: SessionConfig, events: EventSink) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                events,
                inner: Mutex::new(Inner {
                    state: ConnectionState::None,
                    accept: None,
                    dial: None,
                    inbound: None,
                    connected_peer: None,
                    resume_listening: false,
                    next_generation: 0,
                }),
                settled: Notify::new(),
            }),
        }
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Name of the peer on the other end of the live session, if any.
    pub fn connected_peer(&self) -> Option<String> {
        self.shared.lock().connected_peer.clone()
    }

    /// Returns `true` while an accept loop is running.
    pub fn is_accepting(&self) -> bool {
        self.shared.lock().accept.is_some()
    }

    /// Cancels any outstanding dial, makes sure the accept loop is running,
    /// and moves to `Listening`.  Safe to call repeatedly: an accept loop that
    /// is already running is reused, not duplicated.
    ///
    /// A live inbound session is never interrupted; the state stays
    /// `Connected` until its read completes.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ResourceUnavailable`] if the radio cannot
    /// advertise the service.  The state is then `None`.
    pub fn start(&self) -> Result<(), SessionError> {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if let Some(dial) = inner.dial.take() {
            debug!(attempt = %dial.attempt, "start cancels outstanding dial");
            dial.token.cancel();
            inner.connected_peer = None;
        }
        let result = shared.listen(&mut inner);
        drop(inner);
        shared.settled.notify_waiters();
        result.map_err(|e| {
            error!("failed to start listening: {e}");
            SessionError::ResourceUnavailable(e.to_string())
        })
    }

    /// Starts a dial to `address` that writes `send.payload` once connected to
    /// a device named `send.destination`.
    ///
    /// A previous outstanding dial is cancelled; its outcome resolves to
    /// [`DialOutcome::Cancelled`] and never touches the state.
    pub fn connect(&self, address: PeerAddress, send: PendingSend) -> DialAttempt {
        let shared = &self.shared;
        let (tx, rx) = oneshot::channel();
        let token = CancellationToken::new();

        let mut inner = shared.lock();
        if let Some(previous) = inner.dial.take() {
            debug!(attempt = %previous.attempt, "dial superseded");
            previous.token.cancel();
        }
        let attempt = AttemptId(inner.next_generation());
        inner.dial = Some(DialSlot {
            attempt,
            token: token.clone(),
        });
        if inner.inbound.is_none() {
            inner.connected_peer = None;
            shared.set_state(&mut inner, ConnectionState::Connecting);
        }
        drop(inner);
        shared.settled.notify_waiters();

        info!(%attempt, %address, destination = %send.destination, "dialing");
        let task_shared = Arc::clone(shared);
        tokio::spawn(async move {
            let outcome = task_shared.run_dial(attempt, address, send, token).await;
            debug!(%attempt, ?outcome, "dial settled");
            // The issuer may have stopped waiting.
            let _ = tx.send(outcome);
        });

        DialAttempt {
            id: attempt,
            outcome: rx,
        }
    }

    /// Cancels the dial and the accept loop and moves to `None`.  No background
    /// work touches the state afterwards.
    pub fn stop(&self) {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if let Some(dial) = inner.dial.take() {
            dial.token.cancel();
        }
        if let Some(accept) = inner.accept.take() {
            accept.token.cancel();
        }
        inner.inbound = None;
        inner.connected_peer = None;
        inner.resume_listening = false;
        shared.set_state(&mut inner, ConnectionState::None);
        drop(inner);
        shared.settled.notify_waiters();
        info!("session manager stopped");
    }
}

impl SessionControl for SessionManager {
    fn start(&self) -> Result<(), SessionError> {
        SessionManager::start(self)
    }

    fn connect(&self, address: PeerAddress, send: PendingSend) -> DialAttempt {
        SessionManager::connect(self, address, send)
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies a transition and reports it.  Called with the lock held so
    /// events leave in transition order.
    fn set_state(&self, inner: &mut Inner, next: ConnectionState) {
        if inner.state == next {
            return;
        }
        debug!("{} -> {}", inner.state, next);
        inner.state = next;
        self.events.emit(NodeEvent::StateChanged(next));
    }

    /// Ensures the accept loop runs and, unless an inbound session is live,
    /// moves to `Listening`.
    fn listen(self: &Arc<Self>, inner: &mut Inner) -> Result<(), TransportError> {
        if inner.accept.is_none() {
            let listener = match self
                .transport
                .advertise(&self.config.service_name, self.config.service_id)
            {
                Ok(listener) => listener,
                Err(e) => {
                    inner.resume_listening = false;
                    self.set_state(inner, ConnectionState::None);
                    return Err(e);
                }
            };
            let generation = inner.next_generation();
            let token = CancellationToken::new();
            inner.accept = Some(TaskSlot {
                generation,
                token: token.clone(),
            });
            tokio::spawn(Arc::clone(self).accept_loop(listener, generation, token));
        }
        inner.resume_listening = true;
        if inner.inbound.is_none() {
            self.set_state(inner, ConnectionState::Listening);
        }
        Ok(())
    }

    // ── Dial path ─────────────────────────────────────────────────────────────

    async fn run_dial(
        self: Arc<Self>,
        attempt: AttemptId,
        address: PeerAddress,
        send: PendingSend,
        token: CancellationToken,
    ) -> DialOutcome {
        if !self.wait_for_inbound_to_finish(attempt, &token).await {
            return DialOutcome::Cancelled;
        }

        let dialed = tokio::select! {
            _ = token.cancelled() => None,
            result = tokio::time::timeout(
                self.config.connect_timeout,
                self.transport.dial(&address, self.config.service_id),
            ) => Some(result),
        };
        let mut connection = match dialed {
            None => return DialOutcome::Cancelled,
            Some(Ok(Ok(connection))) => connection,
            Some(Ok(Err(e))) => {
                let failure = SessionFailure::ConnectFailed {
                    address,
                    reason: e.to_string(),
                };
                return self.dial_failed(attempt, failure);
            }
            Some(Err(_)) => {
                let failure = SessionFailure::TimedOut {
                    operation: "connect",
                };
                return self.dial_failed(attempt, failure);
            }
        };

        let peer = connection.remote_peer_name().to_string();
        if !self.commit_connected(attempt, &peer, &send.destination) {
            close_quietly(connection.as_mut()).await;
            if peer != send.destination {
                let failure = SessionFailure::PeerMismatch {
                    expected: send.destination,
                    actual: peer,
                };
                return self.dial_failed(attempt, failure);
            }
            return DialOutcome::Cancelled;
        }

        let written = tokio::select! {
            _ = token.cancelled() => None,
            result = tokio::time::timeout(
                self.config.io_timeout,
                connection.write(&send.payload),
            ) => Some(result),
        };
        close_quietly(connection.as_mut()).await;

        match written {
            None => DialOutcome::Cancelled,
            Some(Ok(Ok(()))) => self.delivered(attempt, send),
            Some(Ok(Err(e))) => self.dial_failed(
                attempt,
                SessionFailure::StreamBroken {
                    reason: e.to_string(),
                },
            ),
            Some(Err(_)) => self.dial_failed(attempt, SessionFailure::TimedOut { operation: "write" }),
        }
    }

    /// Reports a completed write and moves to `None`.  A write that finished
    /// after its attempt was superseded is not reported.
    fn delivered(&self, attempt: AttemptId, send: PendingSend) -> DialOutcome {
        let mut inner = self.lock();
        if !inner.owns_dial(attempt) {
            debug!(%attempt, "write of superseded dial completed");
            return DialOutcome::Cancelled;
        }
        info!(%attempt, destination = %send.destination, bytes = send.payload.len(), "message sent");
        self.events.emit(NodeEvent::MessageSent {
            attempt,
            destination: send.destination,
            payload: send.payload,
        });
        inner.dial = None;
        inner.connected_peer = None;
        inner.resume_listening = false;
        self.set_state(&mut inner, ConnectionState::None);
        drop(inner);
        self.settled.notify_waiters();
        DialOutcome::Delivered
    }

    /// Parks the dial while an inbound session is live.  Returns `false` if
    /// the attempt was cancelled or superseded meanwhile.
    async fn wait_for_inbound_to_finish(&self, attempt: AttemptId, token: &CancellationToken) -> bool {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.lock();
                if !inner.owns_dial(attempt) {
                    return false;
                }
                if inner.inbound.is_none() {
                    return true;
                }
            }
            debug!(%attempt, "dial waits for inbound session");
            tokio::select! {
                _ = token.cancelled() => return false,
                _ = notified => {}
            }
        }
    }

    /// Moves to `Connected` if `attempt` still owns the dial slot and the
    /// remote device is the one the message is addressed to.
    fn commit_connected(&self, attempt: AttemptId, peer: &str, destination: &str) -> bool {
        let mut inner = self.lock();
        if !inner.owns_dial(attempt) || peer != destination {
            return false;
        }
        inner.connected_peer = Some(peer.to_string());
        self.set_state(&mut inner, ConnectionState::Connected);
        self.events.emit(NodeEvent::DeviceNameResolved {
            peer: peer.to_string(),
        });
        true
    }

    /// Reports a failed dial and heals back to `Listening`.  A failure of a
    /// superseded attempt is discarded.
    fn dial_failed(self: &Arc<Self>, attempt: AttemptId, failure: SessionFailure) -> DialOutcome {
        let mut inner = self.lock();
        if !inner.owns_dial(attempt) {
            debug!(%attempt, "discarding failure of superseded dial: {failure}");
            return DialOutcome::Cancelled;
        }
        warn!(%attempt, "dial failed: {failure}");
        inner.dial = None;
        inner.connected_peer = None;
        self.events.emit(NodeEvent::TransientFailure {
            attempt: Some(attempt),
            failure: failure.clone(),
        });
        if let Err(e) = self.listen(&mut inner) {
            error!("cannot resume listening after failed dial: {e}");
            self.events.emit(NodeEvent::TransientFailure {
                attempt: None,
                failure: SessionFailure::ListenerLost {
                    reason: e.to_string(),
                },
            });
        }
        drop(inner);
        self.settled.notify_waiters();
        DialOutcome::Failed(failure)
    }

    // ── Accept path ───────────────────────────────────────────────────────────

    async fn accept_loop(
        self: Arc<Self>,
        mut listener: Box<dyn ListenHandle>,
        generation: u64,
        token: CancellationToken,
    ) {
        info!(service = %self.config.service_name, "accept loop started");
        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                result = listener.accept() => result,
            };
            match accepted {
                Ok(connection) => self.serve_inbound(generation, &token, connection).await,
                Err(e) => {
                    self.listener_lost(generation, e);
                    break;
                }
            }
        }
        debug!("accept loop stopped");
    }

    async fn serve_inbound(
        &self,
        generation: u64,
        token: &CancellationToken,
        mut connection: Box<dyn Connection>,
    ) {
        let peer = connection.remote_peer_name().to_string();
        debug!(%peer, "inbound connection accepted");

        if !self.wait_for_dial_to_settle(generation, token, &peer).await {
            close_quietly(connection.as_mut()).await;
            return;
        }

        let mut buf = vec![0u8; self.config.max_message_bytes];
        let read = tokio::select! {
            _ = token.cancelled() => None,
            result = tokio::time::timeout(self.config.io_timeout, connection.read(&mut buf)) => Some(result),
        };
        close_quietly(connection.as_mut()).await;
        // Cancelled reads belong to stop(), which already reset the state.
        let Some(read) = read else {
            return;
        };

        let mut inner = self.lock();
        if inner.inbound != Some(generation) {
            return;
        }
        inner.inbound = None;
        inner.connected_peer = None;
        match read {
            Ok(Ok(n)) if n > 0 => {
                buf.truncate(n);
                info!(%peer, bytes = n, "message received");
                self.events.emit(NodeEvent::MessageReceived {
                    from: peer,
                    payload: buf,
                });
            }
            Ok(Ok(_)) => {
                warn!(%peer, "peer closed without sending a message");
                self.inbound_failed(SessionFailure::StreamBroken {
                    reason: "peer closed without sending a message".to_string(),
                });
            }
            Ok(Err(e)) => {
                warn!(%peer, "inbound read failed: {e}");
                self.inbound_failed(SessionFailure::StreamBroken {
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                warn!(%peer, "inbound read timed out");
                self.inbound_failed(SessionFailure::TimedOut { operation: "read" });
            }
        }
        let next = if inner.dial.is_some() {
            ConnectionState::Connecting
        } else if inner.resume_listening {
            ConnectionState::Listening
        } else {
            ConnectionState::None
        };
        self.set_state(&mut inner, next);
        drop(inner);
        self.settled.notify_waiters();
    }

    /// Parks an accepted connection while a dial is outstanding, then claims
    /// the session and moves to `Connected`.  Returns `false` if the accept
    /// loop was stopped meanwhile.
    async fn wait_for_dial_to_settle(
        &self,
        generation: u64,
        token: &CancellationToken,
        peer: &str,
    ) -> bool {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if !inner.owns_accept(generation) {
                    return false;
                }
                if inner.dial.is_none() {
                    inner.inbound = Some(generation);
                    inner.connected_peer = Some(peer.to_string());
                    self.set_state(&mut inner, ConnectionState::Connected);
                    self.events.emit(NodeEvent::DeviceNameResolved {
                        peer: peer.to_string(),
                    });
                    return true;
                }
            }
            debug!(%peer, "inbound connection waits for outstanding dial");
            tokio::select! {
                _ = token.cancelled() => return false,
                _ = notified => {}
            }
        }
    }

    fn inbound_failed(&self, failure: SessionFailure) {
        self.events.emit(NodeEvent::TransientFailure {
            attempt: None,
            failure,
        });
    }

    fn listener_lost(&self, generation: u64, error: TransportError) {
        let mut inner = self.lock();
        if !inner.owns_accept(generation) {
            return;
        }
        error!("listener lost: {error}");
        inner.accept = None;
        inner.resume_listening = false;
        self.events.emit(NodeEvent::TransientFailure {
            attempt: None,
            failure: SessionFailure::ListenerLost {
                reason: error.to_string(),
            },
        });
        if inner.dial.is_none() && inner.inbound.is_none() {
            self.set_state(&mut inner, ConnectionState::None);
        }
    }
}

async fn close_quietly(connection: &mut dyn Connection) {
    if let Err(e) = connection.close().await {
        debug!("error while closing connection: {e}");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
