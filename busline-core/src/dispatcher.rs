//! The dispatcher event loop: the single task that owns the peer registry
//! and the catalog, and fairly multiplexes every connected peer's
//! outbound-to-bus traffic plus the admission queue.
//!
//! Mirrors the two-channel `select!` shape of a pub/sub hub: one channel
//! for peers arriving, one for already-admitted peers' traffic. Because the
//! peer count changes at runtime, per-peer outbound queues are not selected
//! on directly; instead each admitted peer gets a small forwarder future
//! (`forward_peer_traffic`) that tags its packets with the peer's identity
//! and funnels them into the single `traffic` channel. This keeps the
//! dispatcher itself independent of any particular async runtime —
//! callers spawn the forwarder future with whatever executor they use
//! for the transport.

use crate::catalog::Catalog;
use crate::packet::Packet;
use crate::peer::{Admission, PeerId, PeerSession};
use futures::FutureExt;
use hashbrown::HashMap;
use tracing::{debug, info, warn};

/// One event from an admitted peer's outbound-to-bus queue, tagged with the
/// peer's identity so the dispatcher can tell sources apart at the merge
/// point (preferred over positional indices, which are brittle under
/// concurrent removals).
pub struct Traffic {
    pub peer: PeerId,
    pub kind: TrafficKind,
}

pub enum TrafficKind {
    Packet(Packet),
    /// The peer's outbound-to-bus queue closed: treat as disconnect.
    Closed,
}

/// The channels a transport adapter needs to admit peers and feed their
/// traffic to the dispatcher.
#[derive(Clone)]
pub struct DispatcherHandles {
    pub admission_tx: flume::Sender<Admission>,
    pub traffic_tx: flume::Sender<Traffic>,
}

/// Capacity of the admission queue. Transports may block up to this bound
/// when admitting a peer.
pub const DEFAULT_ADMISSION_CAPACITY: usize = 16;

/// Builds a fresh dispatcher and the handles transports use to talk to it.
pub fn channel(admission_capacity: usize) -> (Dispatcher, DispatcherHandles) {
    let (admission_tx, admission_rx) = flume::bounded(admission_capacity);
    let (traffic_tx, traffic_rx) = flume::unbounded();
    (
        Dispatcher {
            registry: HashMap::new(),
            catalog: Catalog::new(),
            admission_rx,
            traffic_rx,
        },
        DispatcherHandles {
            admission_tx,
            traffic_tx,
        },
    )
}

/// Drains one peer's outbound-to-bus queue, tagging every packet (and the
/// eventual close) with its origin before forwarding to the dispatcher's
/// merged traffic channel. Runtime-agnostic: the caller spawns this with
/// whatever executor it is already using for the peer's transport tasks.
pub async fn forward_peer_traffic(
    id: PeerId,
    out_rx: flume::Receiver<Packet>,
    traffic_tx: flume::Sender<Traffic>,
) {
    loop {
        match out_rx.recv_async().await {
            Ok(packet) => {
                if traffic_tx
                    .send_async(Traffic {
                        peer: id,
                        kind: TrafficKind::Packet(packet),
                    })
                    .await
                    .is_err()
                {
                    return; // dispatcher is gone
                }
            }
            Err(_) => {
                let _ = traffic_tx
                    .send_async(Traffic {
                        peer: id,
                        kind: TrafficKind::Closed,
                    })
                    .await;
                return;
            }
        }
    }
}

/// The central serialization point: owns the registry and catalog, and is
/// the only task that ever mutates them.
pub struct Dispatcher {
    registry: HashMap<PeerId, PeerSession>,
    catalog: Catalog,
    admission_rx: flume::Receiver<Admission>,
    traffic_rx: flume::Receiver<Traffic>,
}

impl Dispatcher {
    /// Runs forever, absent process termination. No error escapes this
    /// loop: every fallible step logs and continues rather than
    /// propagating.
    pub async fn run(mut self) {
        loop {
            futures::select! {
                admitted = self.admission_rx.recv_async().fuse() => {
                    match admitted {
                        Ok(new_peer) => self.handle_admission(new_peer),
                        Err(_) => {
                            info!("admission queue closed, dispatcher shutting down");
                            return;
                        }
                    }
                }
                traffic = self.traffic_rx.recv_async().fuse() => {
                    match traffic {
                        Ok(Traffic { peer, kind: TrafficKind::Packet(packet) }) => {
                            self.handle_packet(peer, packet);
                        }
                        Ok(Traffic { peer, kind: TrafficKind::Closed }) => {
                            self.handle_disconnect(peer);
                        }
                        Err(_) => {
                            // No peers have ever connected and every forwarder
                            // sender clone has dropped; nothing to do but keep
                            // waiting on admission.
                        }
                    }
                }
            }
        }
    }

    fn handle_admission(&mut self, admission: Admission) {
        let Admission { id, in_tx } = admission;
        let session = PeerSession::new(id, in_tx);

        // Replay the current catalog before the peer can see anything else,
        // and before it is visible to other peers' broadcasts. The peer has
        // no advertisements of its own yet, so there is nothing to exclude
        // from the replay.
        for def in self.catalog.snapshot() {
            session.deliver(Packet::Def(def));
        }

        info!(peer = %id, "peer admitted");
        self.registry.insert(id, session);
    }

    fn handle_disconnect(&mut self, peer: PeerId) {
        let Some(session) = self.registry.remove(&peer) else {
            return;
        };

        let retired: Vec<_> = session.all_advertised().cloned().collect();
        session.close();

        for def in retired {
            if let Some(removed) = self.catalog.remove(&def.identifier) {
                self.broadcast_except(peer, Packet::Undef(removed));
            }
        }

        info!(peer = %peer, "peer disconnected");
    }

    fn handle_packet(&mut self, origin: PeerId, packet: Packet) {
        match packet {
            Packet::Event(data) => {
                debug!(peer = %origin, identifier = %data.identifier, "event");
                let identifier = data.identifier.clone();
                let packet = Packet::Event(data);
                for (id, session) in self.registry.iter() {
                    if *id != origin && session.is_subscribed(&identifier) {
                        session.deliver(packet.clone());
                    }
                }
            }
            Packet::Action(data) => {
                debug!(peer = %origin, identifier = %data.identifier, "action");
                let identifier = data.identifier.clone();
                let packet = Packet::Action(data);
                for (id, session) in self.registry.iter() {
                    if *id != origin && session.has_action(&identifier) {
                        session.deliver(packet.clone());
                    }
                }
            }
            Packet::Sub(r) => {
                if let Some(session) = self.registry.get_mut(&origin) {
                    session.add_subscription(&r.identifier);
                }
            }
            Packet::Unsub(r) => {
                if let Some(session) = self.registry.get_mut(&origin) {
                    session.remove_subscription(&r.identifier);
                }
            }
            Packet::Def(def) => self.handle_def(origin, def),
            Packet::Undef(def) => self.handle_undef(origin, def),
        }
    }

    fn handle_def(&mut self, origin: PeerId, def: crate::packet::Definition) {
        let Some(session) = self.registry.get_mut(&origin) else {
            return;
        };
        // Only a genuinely new advertisement from this peer may raise the
        // catalog's refcount; a repeat `Def` from the same peer must not,
        // or a disconnect/`Undef` later decrements only once and leaves a
        // ghost entry no peer actually advertises (see catalog invariant).
        if !session.record_advertised(def.clone()) {
            return;
        }
        let is_new = self.catalog.add(def.clone());
        if is_new {
            self.broadcast_except(origin, Packet::Def(def));
        }
    }

    fn handle_undef(&mut self, origin: PeerId, def: crate::packet::Definition) {
        let Some(session) = self.registry.get_mut(&origin) else {
            return;
        };
        let Some(stored) = session.record_unadvertised(&def.identifier, def.kind) else {
            warn!(
                peer = %origin,
                identifier = %def.identifier,
                "undef for a definition this peer never advertised"
            );
            return;
        };
        if let Some(removed) = self.catalog.remove(&stored.identifier) {
            self.broadcast_except(origin, Packet::Undef(removed));
        }
    }

    fn broadcast_except(&self, origin: PeerId, packet: Packet) {
        for (id, session) in self.registry.iter() {
            if *id != origin {
                session.deliver(packet.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{DataPacket, Definition, DefinitionKind, Fields, IdentifierRef};
    use crate::peer::new_peer;
    use std::time::Duration;

    /// Minimal async test harness: a dispatcher plus a handful of peers,
    /// each with direct access to its out_tx (to send as if from the
    /// transport) and in_rx (to observe delivered packets).
    struct Harness {
        admission_tx: flume::Sender<Admission>,
        traffic_tx: flume::Sender<Traffic>,
    }

    struct TestPeer {
        id: PeerId,
        out_tx: flume::Sender<Packet>,
        in_rx: flume::Receiver<Packet>,
    }

    impl Harness {
        fn spawn_dispatcher() -> Self {
            let (dispatcher, handles) = channel(DEFAULT_ADMISSION_CAPACITY);
            tokio::spawn(dispatcher.run());
            Self {
                admission_tx: handles.admission_tx,
                traffic_tx: handles.traffic_tx,
            }
        }

        async fn admit(&self) -> TestPeer {
            let (new_peer, handle) = new_peer(10);
            let (admission, out_rx) = new_peer.into_parts();
            let id = admission.id;
            tokio::spawn(forward_peer_traffic(id, out_rx, self.traffic_tx.clone()));
            self.admission_tx.send_async(admission).await.unwrap();
            TestPeer {
                id,
                out_tx: handle.out_tx,
                in_rx: handle.in_rx,
            }
        }
    }

    fn event(identifier: &str, n: i64) -> Packet {
        let mut data = Fields::new();
        data.insert("n".to_owned(), serde_json::json!(n));
        Packet::Event(DataPacket {
            identifier: identifier.to_owned(),
            data,
        })
    }

    #[tokio::test]
    async fn scenario_event_delivered_only_to_subscriber() {
        let harness = Harness::spawn_dispatcher();
        let a = harness.admit().await;
        let b = harness.admit().await;

        b.out_tx
            .send_async(Packet::Sub(crate::packet::IdentifierRef {
                identifier: "tick".into(),
            }))
            .await
            .unwrap();
        // b's subscription and a's event travel through independent
        // forwarder tasks with no ordering guarantee between them; give
        // the dispatcher a beat to apply the subscription first.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        a.out_tx.send_async(event("tick", 1)).await.unwrap();

        let received = tokio::time::timeout(std::time::Duration::from_secs(1), b.in_rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        match received {
            Packet::Event(d) => assert_eq!(d.data["n"], serde_json::json!(1)),
            other => panic!("expected event, got {other:?}"),
        }

        assert!(a.in_rx.try_recv().is_err());
        let _ = a.id;
    }

    #[tokio::test]
    async fn action_is_delivered_only_to_the_peer_that_advertised_it() {
        let harness = Harness::spawn_dispatcher();
        let a = harness.admit().await;
        let b = harness.admit().await;
        let c = harness.admit().await;

        a.out_tx
            .send_async(Packet::Def(Definition::new("reset", DefinitionKind::Action)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // b and c should each have seen exactly one Def, from a's broadcast.
        let b_def = tokio::time::timeout(Duration::from_secs(1), b.in_rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(b_def, Packet::Def(ref d) if d.identifier == "reset"));
        assert!(b.in_rx.try_recv().is_err());

        c.out_tx
            .send_async(Packet::Action(DataPacket {
                identifier: "reset".into(),
                data: Fields::new(),
            }))
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), a.in_rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(received, Packet::Action(ref d) if d.identifier == "reset"));
        assert!(b.in_rx.try_recv().is_err(), "b never advertised the action");
    }

    #[tokio::test]
    async fn duplicate_definitions_collapse_and_disconnect_refcounts_correctly() {
        let harness = Harness::spawn_dispatcher();
        let a = harness.admit().await;
        let b = harness.admit().await;
        let c = harness.admit().await;

        a.out_tx
            .send_async(Packet::Def(Definition::new("tick", DefinitionKind::Event)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        b.out_tx
            .send_async(Packet::Def(Definition::new("tick", DefinitionKind::Event)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        c.out_tx
            .send_async(Packet::Sub(IdentifierRef {
                identifier: "tick".into(),
            }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        a.out_tx.send_async(event("tick", 7)).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), c.in_rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert!(
            matches!(first, Packet::Def(ref d) if d.identifier == "tick"),
            "c should see a's Def but not a second one from b's redundant advertisement"
        );
        let second = tokio::time::timeout(Duration::from_secs(1), c.in_rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(second, Packet::Event(ref d) if d.data["n"] == serde_json::json!(7)));
        assert!(c.in_rx.try_recv().is_err());

        // a disconnects: refcount drops from 2 to 1, no Undef yet.
        drop(a.out_tx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(c.in_rx.try_recv().is_err());

        // b disconnects: refcount hits zero, Undef broadcasts to c.
        drop(b.out_tx);
        let undef = tokio::time::timeout(Duration::from_secs(1), c.in_rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(undef, Packet::Undef(ref d) if d.identifier == "tick"));
    }

    #[tokio::test]
    async fn admission_replay_sends_current_catalog_and_nothing_else() {
        let harness = Harness::spawn_dispatcher();
        let a = harness.admit().await;
        a.out_tx
            .send_async(Packet::Def(Definition::new("ping", DefinitionKind::Event)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let b = harness.admit().await;
        let replayed = tokio::time::timeout(Duration::from_secs(1), b.in_rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(replayed, Packet::Def(ref d) if d.identifier == "ping"));
        assert!(b.in_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_def_from_the_same_peer_does_not_inflate_refcount() {
        let harness = Harness::spawn_dispatcher();
        let a = harness.admit().await;
        let observer = harness.admit().await;

        // a advertises "tick" twice; the catalog must only ever see this
        // as one advertisement from a, or a single disconnect/Undef later
        // leaves a ghost entry that is replayed to every future peer.
        a.out_tx
            .send_async(Packet::Def(Definition::new("tick", DefinitionKind::Event)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        a.out_tx
            .send_async(Packet::Def(Definition::new("tick", DefinitionKind::Event)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Only one Def should have reached the observer, proving the
        // second advertisement did not retrigger a catalog transition.
        let first = tokio::time::timeout(Duration::from_secs(1), observer.in_rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, Packet::Def(ref d) if d.identifier == "tick"));
        assert!(observer.in_rx.try_recv().is_err());

        // a disconnects: the single advertisement must fully retire the
        // entry and broadcast exactly one Undef, not leave it at refcount 1.
        drop(a.out_tx);
        let undef = tokio::time::timeout(Duration::from_secs(1), observer.in_rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(undef, Packet::Undef(ref d) if d.identifier == "tick"));

        // A newly admitted peer must not see a ghost "tick" entry replayed.
        let newcomer = harness.admit().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(newcomer.in_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn undef_for_unknown_identifier_is_harmless() {
        let harness = Harness::spawn_dispatcher();
        let a = harness.admit().await;
        a.out_tx
            .send_async(Packet::Undef(Definition::new("ghost", DefinitionKind::Event)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.in_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn flooding_a_slow_consumer_does_not_stall_delivery_to_others() {
        let harness = Harness::spawn_dispatcher();

        // A peer with a capacity-1 inbound queue that is never drained.
        let (slow_new, slow_handle) = new_peer(1);
        let (slow_admission, slow_out_rx) = slow_new.into_parts();
        tokio::spawn(forward_peer_traffic(
            slow_admission.id,
            slow_out_rx,
            harness.traffic_tx.clone(),
        ));
        harness.admission_tx.send_async(slow_admission).await.unwrap();
        slow_handle
            .out_tx
            .send_async(Packet::Sub(IdentifierRef {
                identifier: "flood".into(),
            }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let publisher = harness.admit().await;
        for n in 0..20 {
            publisher.out_tx.send_async(event("flood", n)).await.unwrap();
        }

        // A later, unrelated packet from a third peer still gets delivered,
        // proving the flood never blocked the dispatcher's event loop.
        let observer = harness.admit().await;
        observer
            .out_tx
            .send_async(Packet::Sub(IdentifierRef {
                identifier: "heartbeat".into(),
            }))
            .await
            .unwrap();
        publisher.out_tx.send_async(event("heartbeat", 1)).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), observer.in_rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(got, Packet::Event(ref d) if d.identifier == "heartbeat"));

        // The slow peer's queue never grew past its capacity.
        assert!(slow_handle.in_rx.len() <= 1);
    }
}
