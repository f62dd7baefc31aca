//! Per-peer state owned exclusively by the dispatcher: advertised
//! definitions, active subscriptions, and the bounded inbound-from-bus
//! queue used to push packets back out to the peer's transport.

use crate::packet::{Definition, DefinitionKind, Packet};
use hashbrown::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Default capacity of a peer's bounded in/out queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Stable identity for a peer for the lifetime of its connection. Used to
/// tag packets at the dispatcher's merge point instead of a brittle
/// positional registry index, which breaks under concurrent removals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// A newly created peer, returned by `new_peer`. `out_rx` must be handed to
/// a forwarder task (see `dispatcher::forward_peer_traffic`) and `admission`
/// sent to the dispatcher's admission queue; `into_parts` splits the two so
/// the caller can spawn the forwarder before admitting the peer.
pub struct NewPeer {
    pub id: PeerId,
    pub in_tx: flume::Sender<Packet>,
    pub out_rx: flume::Receiver<Packet>,
}

impl NewPeer {
    pub fn into_parts(self) -> (Admission, flume::Receiver<Packet>) {
        (
            Admission {
                id: self.id,
                in_tx: self.in_tx,
            },
            self.out_rx,
        )
    }
}

/// What actually travels over the admission queue: just enough to build a
/// `PeerSession`. The peer's outbound-to-bus half (`out_rx`) never reaches
/// the dispatcher directly; a forwarder task drains it instead.
pub struct Admission {
    pub id: PeerId,
    pub in_tx: flume::Sender<Packet>,
}

/// Handle the transport side keeps: the producer end of the peer's
/// outbound-to-bus queue, and the consumer end of its inbound-from-bus
/// queue.
pub struct PeerHandle {
    pub id: PeerId,
    pub out_tx: flume::Sender<Packet>,
    pub in_rx: flume::Receiver<Packet>,
}

/// Creates a peer session. Returns the dispatcher-facing half (`NewPeer`,
/// to send on the admission queue) and the transport-facing half
/// (`PeerHandle`, retained by the reader/writer tasks).
pub fn new_peer(capacity: usize) -> (NewPeer, PeerHandle) {
    let (in_tx, in_rx) = flume::bounded(capacity);
    let (out_tx, out_rx) = flume::bounded(capacity);
    let id = PeerId::next();
    (
        NewPeer { id, in_tx, out_rx },
        PeerHandle { id, out_tx, in_rx },
    )
}

/// The dispatcher's bookkeeping for one admitted peer.
pub struct PeerSession {
    pub id: PeerId,
    actions: HashMap<String, Definition>,
    events: HashMap<String, Definition>,
    subscriptions: HashSet<String>,
    in_tx: flume::Sender<Packet>,
}

impl PeerSession {
    pub fn new(id: PeerId, in_tx: flume::Sender<Packet>) -> Self {
        Self {
            id,
            actions: HashMap::new(),
            events: HashMap::new(),
            subscriptions: HashSet::new(),
            in_tx,
        }
    }

    /// Non-blocking enqueue onto the inbound-from-bus queue. If full, drops
    /// the packet for this peer only and logs a warning; never blocks the
    /// dispatcher loop.
    pub fn deliver(&self, packet: Packet) {
        if let Err(flume::TrySendError::Full(_)) = self.in_tx.try_send(packet) {
            warn!(peer = %self.id, "inbound queue full, dropping packet for this peer");
        }
        // A `Disconnected` error means the peer's writer task already went
        // away; the dispatcher will observe this independently via the
        // peer's outbound queue closing, so it is not logged again here.
    }

    pub fn add_subscription(&mut self, identifier: &str) {
        self.subscriptions.insert(identifier.to_owned());
    }

    pub fn remove_subscription(&mut self, identifier: &str) {
        self.subscriptions.remove(identifier);
    }

    pub fn is_subscribed(&self, identifier: &str) -> bool {
        self.subscriptions.contains(identifier)
    }

    pub fn has_action(&self, identifier: &str) -> bool {
        self.actions.contains_key(identifier)
    }

    /// Idempotent insertion into the peer's per-kind set, keyed by
    /// identifier. Returns `true` iff this peer had not already advertised
    /// `def.identifier` for this kind, so the caller can gate catalog
    /// refcounting on a genuine new advertisement rather than a repeat.
    pub fn record_advertised(&mut self, def: Definition) -> bool {
        match def.kind {
            DefinitionKind::Action => self.actions.insert(def.identifier.clone(), def).is_none(),
            DefinitionKind::Event => self.events.insert(def.identifier.clone(), def).is_none(),
        }
    }

    pub fn record_unadvertised(&mut self, identifier: &str, kind: DefinitionKind) -> Option<Definition> {
        match kind {
            DefinitionKind::Action => self.actions.remove(identifier),
            DefinitionKind::Event => self.events.remove(identifier),
        }
    }

    /// Every definition this peer currently advertises (actions ∪ events),
    /// consumed on disconnect to decrement the catalog.
    pub fn all_advertised(&self) -> impl Iterator<Item = &Definition> {
        self.actions.values().chain(self.events.values())
    }

    /// Closes the inbound-from-bus queue by dropping its sender. Consumes
    /// the session so the dispatcher cannot call this twice on the same
    /// peer.
    pub fn close(self) {
        drop(self.in_tx);
    }
}
