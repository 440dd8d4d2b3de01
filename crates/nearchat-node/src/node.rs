//! ChatNode: wires the session manager, resolver, and dispatcher together.
//!
//! One node owns exactly one [`SessionManager`] and one [`PeerResolver`], and
//! all three components report on the same event stream.
//!
//! ```text
//! ChatNode::new(radio, config)
//!  ├─ SessionManager  (radio as RadioTransport)
//!  ├─ PeerResolver    (radio as Discovery)
//!  └─ MessageDispatcher ── SessionControl ──► SessionManager
//!                      └── PeerDirectory  ──► PeerResolver
//! ```

use std::sync::Arc;

use nearchat_core::{
    ConnectionState, Discovery, EventSink, NodeEvent, PeerRecord, RadioTransport, ScanId,
};
use tokio::sync::mpsc;
use tracing::info;

use crate::application::dispatch_message::{
    DispatchError, MessageDispatcher, PeerDirectory, SessionControl, SessionError,
};
use crate::infrastructure::resolver::PeerResolver;
use crate::infrastructure::session::SessionManager;
use crate::infrastructure::storage::config::AppConfig;

/// A running NearChat node.
pub struct ChatNode {
    name: String,
    session: SessionManager,
    resolver: PeerResolver,
    dispatcher: MessageDispatcher,
}

impl ChatNode {
    /// Builds a node on `radio` and returns it with its event receiver.
    ///
    /// Must be called inside a Tokio runtime.  The node is idle until
    /// [`start`](Self::start).
    pub fn new<R>(radio: Arc<R>, config: &AppConfig) -> (Self, mpsc::UnboundedReceiver<NodeEvent>)
    where
        R: RadioTransport + Discovery + 'static,
    {
        let (events, rx) = EventSink::channel();
        let transport: Arc<dyn RadioTransport> = radio.clone();
        let discovery: Arc<dyn Discovery> = radio;

        let session = SessionManager::new(transport, config.session_config(), events.clone());
        let resolver = PeerResolver::new(discovery, config.resolver_config(), events.clone());
        let dispatcher = MessageDispatcher::spawn(
            Arc::new(session.clone()) as Arc<dyn SessionControl>,
            Arc::new(resolver.clone()) as Arc<dyn PeerDirectory>,
            events,
            config.dispatch_config(),
        );

        let node = Self {
            name: config.node.name.clone(),
            session,
            resolver,
            dispatcher,
        };
        (node, rx)
    }

    /// Display name this node advertises.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts listening for inbound messages.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ResourceUnavailable`] if the radio cannot
    /// advertise.
    pub fn start(&self) -> Result<(), SessionError> {
        info!(name = %self.name, "node starting");
        self.session.start()
    }

    /// Queues `payload` for the peer named `destination`.
    ///
    /// # Errors
    ///
    /// See [`MessageDispatcher::send`].
    pub fn send(
        &self,
        destination: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), DispatchError> {
        self.dispatcher.send(destination, payload)
    }

    /// Starts an untargeted scan that refreshes the peer table.
    pub fn scan(&self) -> ScanId {
        self.resolver.begin_scan(None)
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn known_peers(&self) -> Vec<PeerRecord> {
        self.resolver.known_peers()
    }

    /// Sends accepted but not yet finished.
    pub fn pending_sends(&self) -> usize {
        self.dispatcher.queued()
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn resolver(&self) -> &PeerResolver {
        &self.resolver
    }

    /// Stops all background work.  Queued sends are dropped.
    pub fn stop(&self) {
        self.dispatcher.shutdown();
        self.resolver.stop();
        self.session.stop();
        info!(name = %self.name, "node stopped");
    }
}
