//! The shared peer registry.
//!
//! Every transport reads and writes peer state through these operations
//! only. Mutations are serialized under one lock and reads hand back
//! cloned snapshots, so nobody ever observes a half-updated peer.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;

use crate::peer::{Direction, MessageRecord, Peer, PeerId, TransportInfo, TransportKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    NewPeer {
        peer_id: PeerId,
        transport: TransportKind,
    },
    PeerInactive {
        peer_id: PeerId,
        transport: TransportKind,
    },
    PeerRemoved {
        peer_id: PeerId,
    },
}

#[derive(Default)]
struct Inner {
    peers: HashMap<PeerId, Peer>,
    subscribers: Vec<mpsc::UnboundedSender<RegistryEvent>>,
}

impl Inner {
    fn emit(&mut self, event: RegistryEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[derive(Default)]
pub struct PeerRegistry {
    inner: Mutex<Inner>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking subscriber cannot leave peer state half-written, so a
        // poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue of registry events. Delivery never blocks a mutation.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RegistryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }

    /// Create the peer or merge `info` into its entry for `transport`.
    pub fn upsert(&self, peer_id: &PeerId, transport: TransportKind, info: TransportInfo) -> Peer {
        let now = SystemTime::now();
        let mut inner = self.lock();

        if let Some(peer) = inner.peers.get_mut(peer_id) {
            peer.last_seen = now;
            peer.transports.entry(transport).or_default().merge(info);
            peer.active.insert(transport);
            return peer.clone();
        }

        let peer = Peer::new(peer_id.clone(), transport, info, now);
        inner.peers.insert(peer_id.clone(), peer.clone());
        tracing::info!("New peer {} via {}", peer_id, transport);
        inner.emit(RegistryEvent::NewPeer {
            peer_id: peer_id.clone(),
            transport,
        });
        peer
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<Peer> {
        self.lock().peers.get(peer_id).cloned()
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.lock().peers.contains_key(peer_id)
    }

    pub fn all_peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.lock().peers.values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn active_peers(&self, transport: Option<TransportKind>) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .lock()
            .peers
            .values()
            .filter(|p| p.is_active(transport))
            .cloned()
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn len(&self) -> usize {
        self.lock().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take `transport` out of the peer's active set and forget its link.
    /// The peer itself stays known.
    pub fn mark_inactive(&self, peer_id: &PeerId, transport: TransportKind) {
        let mut inner = self.lock();
        let Some(peer) = inner.peers.get_mut(peer_id) else {
            return;
        };
        if let Some(info) = peer.transports.get_mut(&transport) {
            info.connection = None;
        }
        if peer.active.remove(&transport) {
            tracing::info!("Peer {} inactive on {}", peer_id, transport);
            inner.emit(RegistryEvent::PeerInactive {
                peer_id: peer_id.clone(),
                transport,
            });
        }
    }

    /// Forget the link id on a transport entry, but only if it is still
    /// `connection`; a newer link may already have replaced it.
    pub fn clear_connection(&self, peer_id: &PeerId, transport: TransportKind, connection: u64) -> bool {
        let mut inner = self.lock();
        let Some(info) = inner
            .peers
            .get_mut(peer_id)
            .and_then(|p| p.transports.get_mut(&transport))
        else {
            return false;
        };
        if info.connection == Some(connection) {
            info.connection = None;
            true
        } else {
            false
        }
    }

    pub fn record_message(
        &self,
        peer_id: &PeerId,
        transport: TransportKind,
        payload: &str,
        direction: Direction,
    ) {
        let now = SystemTime::now();
        let mut inner = self.lock();
        if let Some(peer) = inner.peers.get_mut(peer_id) {
            peer.push_history(MessageRecord {
                timestamp: now,
                direction,
                transport,
                payload: payload.to_string(),
            });
            if direction == Direction::Inbound {
                peer.last_seen = now;
            }
        }
    }

    /// Evict every peer silent for longer than `timeout`.
    pub fn sweep_stale(&self, timeout: Duration) -> Vec<PeerId> {
        self.sweep_stale_at(SystemTime::now(), timeout)
    }

    pub fn sweep_stale_at(&self, now: SystemTime, timeout: Duration) -> Vec<PeerId> {
        let mut inner = self.lock();
        let stale: Vec<PeerId> = inner
            .peers
            .values()
            .filter(|p| now.duration_since(p.last_seen).unwrap_or_default() > timeout)
            .map(|p| p.id.clone())
            .collect();

        for peer_id in &stale {
            inner.peers.remove(peer_id);
            tracing::info!("Evicted stale peer {}", peer_id);
            inner.emit(RegistryEvent::PeerRemoved {
                peer_id: peer_id.clone(),
            });
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::HISTORY_CAPACITY;
    use std::net::{IpAddr, Ipv4Addr};

    fn lan(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<RegistryEvent>) -> Vec<RegistryEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[test]
    fn upsert_is_idempotent() {
        let registry = PeerRegistry::new();
        let mut rx = registry.subscribe();
        let id = PeerId::from("peer-x");

        registry.upsert(&id, TransportKind::Broadcast, TransportInfo::at(lan(10), 5555));
        registry.upsert(&id, TransportKind::Broadcast, TransportInfo::at(lan(10), 5555));

        assert_eq!(registry.len(), 1);
        assert_eq!(
            drain(&mut rx),
            vec![RegistryEvent::NewPeer {
                peer_id: id.clone(),
                transport: TransportKind::Broadcast
            }]
        );
    }

    #[test]
    fn same_peer_on_two_transports_is_one_peer() {
        let registry = PeerRegistry::new();
        let id = PeerId::from("peer-x");

        registry.upsert(&id, TransportKind::Broadcast, TransportInfo::at(lan(10), 5555));
        let peer = registry.upsert(&id, TransportKind::Direct, TransportInfo::at(lan(10), 5556));

        assert_eq!(registry.len(), 1);
        assert_eq!(peer.transports.len(), 2);
        assert!(peer.is_active(Some(TransportKind::Broadcast)));
        assert!(peer.is_active(Some(TransportKind::Direct)));
    }

    #[test]
    fn upsert_on_one_transport_leaves_the_other_alone() {
        let registry = PeerRegistry::new();
        let id = PeerId::from("peer-x");

        registry.upsert(
            &id,
            TransportKind::Direct,
            TransportInfo::at(lan(10), 5556).with_connection(3),
        );
        registry.upsert(&id, TransportKind::Broadcast, TransportInfo::at(lan(11), 5555));

        let peer = registry.get(&id).unwrap();
        let direct = peer.info(TransportKind::Direct).unwrap();
        assert_eq!(direct.address, Some(lan(10)));
        assert_eq!(direct.port, Some(5556));
        assert_eq!(direct.connection, Some(3));
    }

    #[test]
    fn mark_inactive_keeps_peer() {
        let registry = PeerRegistry::new();
        let mut rx = registry.subscribe();
        let id = PeerId::from("peer-x");

        registry.upsert(
            &id,
            TransportKind::Direct,
            TransportInfo::at(lan(10), 5556).with_connection(1),
        );
        registry.mark_inactive(&id, TransportKind::Direct);
        registry.mark_inactive(&id, TransportKind::Direct);

        let peer = registry.get(&id).unwrap();
        assert!(!peer.is_active(None));
        assert_eq!(peer.info(TransportKind::Direct).unwrap().connection, None);
        assert!(registry.active_peers(None).is_empty());
        assert_eq!(registry.all_peers().len(), 1);

        let inactive = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, RegistryEvent::PeerInactive { .. }))
            .count();
        assert_eq!(inactive, 1);
    }

    #[test]
    fn active_peers_filters_by_transport() {
        let registry = PeerRegistry::new();
        registry.upsert(&"a".into(), TransportKind::Direct, TransportInfo::default());
        registry.upsert(&"b".into(), TransportKind::Broadcast, TransportInfo::default());
        registry.upsert(&"c".into(), TransportKind::Direct, TransportInfo::default());
        registry.mark_inactive(&"c".into(), TransportKind::Direct);

        let direct: Vec<String> = registry
            .active_peers(Some(TransportKind::Direct))
            .into_iter()
            .map(|p| p.id.to_string())
            .collect();
        assert_eq!(direct, vec!["a"]);
        assert_eq!(registry.active_peers(None).len(), 2);
    }

    #[test]
    fn stale_peer_is_evicted_once() {
        let registry = PeerRegistry::new();
        let mut rx = registry.subscribe();
        let old = PeerId::from("peer-old");
        registry.upsert(&old, TransportKind::Broadcast, TransportInfo::default());
        drain(&mut rx);

        let later = SystemTime::now() + Duration::from_secs(301);
        let removed = registry.sweep_stale_at(later, Duration::from_secs(300));
        assert_eq!(removed, vec![old.clone()]);
        assert!(registry.all_peers().is_empty());

        assert!(registry.sweep_stale_at(later, Duration::from_secs(300)).is_empty());
        assert_eq!(drain(&mut rx), vec![RegistryEvent::PeerRemoved { peer_id: old }]);
    }

    #[test]
    fn fresh_peer_survives_sweep() {
        let registry = PeerRegistry::new();
        registry.upsert(&"peer-y".into(), TransportKind::Broadcast, TransportInfo::default());
        assert!(registry.sweep_stale(Duration::from_secs(300)).is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn outbound_messages_do_not_refresh_last_seen() {
        let registry = PeerRegistry::new();
        let id = PeerId::from("peer-x");
        let seen = registry
            .upsert(&id, TransportKind::Direct, TransportInfo::default())
            .last_seen;

        std::thread::sleep(Duration::from_millis(5));
        registry.record_message(&id, TransportKind::Direct, "out", Direction::Outbound);
        assert_eq!(registry.get(&id).unwrap().last_seen, seen);

        registry.record_message(&id, TransportKind::Direct, "in", Direction::Inbound);
        assert!(registry.get(&id).unwrap().last_seen > seen);
    }

    #[test]
    fn history_is_bounded() {
        let registry = PeerRegistry::new();
        let id = PeerId::from("peer-x");
        registry.upsert(&id, TransportKind::Direct, TransportInfo::default());

        for i in 0..(HISTORY_CAPACITY + 5) {
            registry.record_message(&id, TransportKind::Direct, &format!("m{}", i), Direction::Inbound);
        }

        let history = registry.get(&id).unwrap().history;
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(history.front().unwrap().payload, "m5");
        assert_eq!(history.back().unwrap().payload, format!("m{}", HISTORY_CAPACITY + 4));
    }

    #[test]
    fn messages_for_unknown_peers_are_ignored() {
        let registry = PeerRegistry::new();
        registry.record_message(&"ghost".into(), TransportKind::Direct, "boo", Direction::Inbound);
        registry.mark_inactive(&"ghost".into(), TransportKind::Direct);
        assert!(registry.is_empty());
    }

    #[test]
    fn clear_connection_only_matches_current_link() {
        let registry = PeerRegistry::new();
        let id = PeerId::from("peer-x");
        registry.upsert(&id, TransportKind::Direct, TransportInfo::default().with_connection(2));

        assert!(!registry.clear_connection(&id, TransportKind::Direct, 1));
        assert!(registry.clear_connection(&id, TransportKind::Direct, 2));
        assert_eq!(registry.get(&id).unwrap().info(TransportKind::Direct).unwrap().connection, None);
    }

    #[test]
    fn concurrent_upserts_and_sweeps() {
        let registry = std::sync::Arc::new(PeerRegistry::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let id = PeerId::new(format!("peer-{}-{}", t, i % 10));
                        registry.upsert(&id, TransportKind::Broadcast, TransportInfo::default());
                        registry.sweep_stale(Duration::from_secs(300));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.len(), 40);
    }
}
