//! PeerResolver: maps display names to transport addresses.
//!
//! The peer table is filled by scan observations and read synchronously.  It
//! has its own lock, independent of the session manager's, because scan
//! events keep arriving while a send is in progress.
//!
//! At most one scan is active.  Starting a scan while one runs cancels the
//! old one; waiters on the old scan are released when the new one finishes.
//! A scan started with a target ends early as soon as the target is seen.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use nearchat_core::{
    Discovery, EventSink, NodeEvent, PeerAddress, PeerRecord, ScanEvent, ScanId,
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::dispatch_message::PeerDirectory;

/// Settings for the resolver.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Upper bound on one scan; the underlying scan is cancelled afterwards.
    pub scan_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(15),
        }
    }
}

struct ActiveScan {
    id: ScanId,
    token: CancellationToken,
}

#[derive(Default)]
struct ScanSlot {
    last: ScanId,
    active: Option<ActiveScan>,
}

struct Shared {
    discovery: Arc<dyn Discovery>,
    config: ResolverConfig,
    events: EventSink,
    peers: RwLock<HashMap<String, PeerAddress>>,
    scan: Mutex<ScanSlot>,
    /// Id of the newest scan that has finished.
    finished: watch::Sender<ScanId>,
}

/// Name-to-address resolver.  Cheap to clone; clones share one table.
#[derive(Clone)]
pub struct PeerResolver {
    shared: Arc<Shared>,
}

impl PeerResolver {
    pub fn new(discovery: Arc<dyn Discovery>, config: ResolverConfig, events: EventSink) -> Self {
        let (finished, _) = watch::channel(ScanId::default());
        Self {
            shared: Arc::new(Shared {
                discovery,
                config,
                events,
                peers: RwLock::new(HashMap::new()),
                scan: Mutex::new(ScanSlot::default()),
                finished,
            }),
        }
    }

    /// Records `address` for `name`, replacing any earlier address.
    pub fn on_peer_observed(&self, name: &str, address: PeerAddress) {
        self.shared.record(name.to_string(), address);
    }

    pub fn lookup(&self, name: &str) -> Option<PeerAddress> {
        self.shared.read_peers().get(name).cloned()
    }

    /// Snapshot of every known peer, sorted by name.
    pub fn known_peers(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self
            .shared
            .read_peers()
            .iter()
            .map(|(name, address)| PeerRecord {
                display_name: name.clone(),
                address: address.clone(),
            })
            .collect();
        peers.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        peers
    }

    pub fn is_scanning(&self) -> bool {
        self.shared.lock_scan().active.is_some()
    }

    /// Starts a scan, superseding any active one, and returns its id.
    ///
    /// With a `target`, the scan ends as soon as that name is observed.
    /// `ScanFinished` is emitted when the scan ends, whether or not the
    /// target was found.  If the radio cannot scan, the scan finishes
    /// immediately.
    pub fn begin_scan(&self, target: Option<&str>) -> ScanId {
        let shared = &self.shared;
        let mut slot = shared.lock_scan();
        if let Some(previous) = slot.active.take() {
            debug!(scan = %previous.id, "scan superseded");
            previous.token.cancel();
            shared.discovery.cancel_scan();
        }
        let id = ScanId(slot.last.0 + 1);
        slot.last = id;

        match shared.discovery.start_scan() {
            Ok(rx) => {
                let token = CancellationToken::new();
                slot.active = Some(ActiveScan {
                    id,
                    token: token.clone(),
                });
                info!(scan = %id, target = target.unwrap_or("*"), "discovery started");
                shared.events.emit(NodeEvent::ScanStarted { scan: id });
                let target = target.map(str::to_string);
                tokio::spawn(Arc::clone(shared).pump(id, target, token, rx));
            }
            Err(e) => {
                warn!(scan = %id, "cannot scan: {e}");
                shared.publish_finished(id);
            }
        }
        id
    }

    /// Resolves once `scan`, or a scan that superseded it, has finished.
    pub async fn scan_finished(&self, scan: ScanId) {
        let mut rx = self.shared.finished.subscribe();
        // The sender lives as long as `self`, so this only returns on success.
        let _ = rx.wait_for(|finished| *finished >= scan).await;
    }

    /// Cancels the active scan.  Waiters are released.
    pub fn stop(&self) {
        let shared = &self.shared;
        let mut slot = shared.lock_scan();
        if let Some(active) = slot.active.take() {
            active.token.cancel();
            shared.discovery.cancel_scan();
            shared.publish_finished(active.id);
        }
    }
}

#[async_trait]
impl PeerDirectory for PeerResolver {
    fn lookup(&self, name: &str) -> Option<PeerAddress> {
        PeerResolver::lookup(self, name)
    }

    fn begin_scan(&self, target: Option<&str>) -> ScanId {
        PeerResolver::begin_scan(self, target)
    }

    async fn scan_finished(&self, scan: ScanId) {
        PeerResolver::scan_finished(self, scan).await
    }
}

impl Shared {
    fn read_peers(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, PeerAddress>> {
        self.peers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_scan(&self) -> MutexGuard<'_, ScanSlot> {
        self.scan.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, name: String, address: PeerAddress) {
        let previous = self
            .peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), address.clone());
        if previous.as_ref() != Some(&address) {
            debug!(%name, %address, "peer recorded");
        }
        self.events.emit(NodeEvent::PeerDiscovered { name, address });
    }

    async fn pump(
        self: Arc<Self>,
        id: ScanId,
        target: Option<String>,
        token: CancellationToken,
        mut rx: mpsc::Receiver<ScanEvent>,
    ) {
        let deadline = tokio::time::sleep(self.config.scan_timeout);
        tokio::pin!(deadline);
        let mut cancel_underlying = false;
        loop {
            tokio::select! {
                // Superseded or stopped; whoever cancelled owns the slot now.
                _ = token.cancelled() => return,
                _ = &mut deadline => {
                    debug!(scan = %id, "scan window elapsed");
                    cancel_underlying = true;
                    break;
                }
                event = rx.recv() => match event {
                    Some(ScanEvent::PeerObserved { name, address }) => {
                        let is_target = target.as_deref() == Some(name.as_str());
                        self.record(name, address);
                        if is_target {
                            info!(scan = %id, "target found, ending scan early");
                            cancel_underlying = true;
                            break;
                        }
                    }
                    Some(ScanEvent::Finished) | None => break,
                },
            }
        }
        self.complete(id, cancel_underlying);
    }

    fn complete(&self, id: ScanId, cancel_underlying: bool) {
        let mut slot = self.lock_scan();
        if slot.active.as_ref().map(|a| a.id) != Some(id) {
            return;
        }
        slot.active = None;
        if cancel_underlying {
            self.discovery.cancel_scan();
        }
        self.publish_finished(id);
    }

    fn publish_finished(&self, id: ScanId) {
        self.finished.send_if_modified(|finished| {
            if *finished < id {
                *finished = id;
                true
            } else {
                false
            }
        });
        info!(scan = %id, "discovery finished");
        self.events.emit(NodeEvent::ScanFinished { scan: id });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
