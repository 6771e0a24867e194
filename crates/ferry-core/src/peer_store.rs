//! Known peers, their addresses and protocols.

use crate::event::HostEvent;
use crate::identity::PeerId;
use crate::multiaddr::Multiaddr;
use dashmap::DashMap;
use std::time::Instant;
use tokio::sync::broadcast;

/// Everything known about a peer
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Dialable addresses
    pub addrs: Vec<Multiaddr>,
    /// Protocols the peer handles
    pub protocols: Vec<String>,
    /// Last update
    pub updated_at: Instant,
}

impl Default for PeerRecord {
    fn default() -> Self {
        Self {
            addrs: Vec::new(),
            protocols: Vec::new(),
            updated_at: Instant::now(),
        }
    }
}

/// Concurrent peer store
///
/// A store attached to a host publishes
/// [`HostEvent::PeerProtocolsChanged`] whenever a peer's protocol list
/// changes.
#[derive(Debug, Default)]
pub struct PeerStore {
    peers: DashMap<PeerId, PeerRecord>,
    events: Option<broadcast::Sender<HostEvent>>,
}

impl PeerStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store publishing protocol changes on `events`
    #[must_use]
    pub fn with_events(events: broadcast::Sender<HostEvent>) -> Self {
        Self {
            peers: DashMap::new(),
            events: Some(events),
        }
    }

    /// Merge `addrs` into the peer's address list
    pub fn add_addrs(&self, peer: PeerId, addrs: impl IntoIterator<Item = Multiaddr>) {
        let mut record = self.peers.entry(peer).or_default();
        for addr in addrs {
            let addr = addr.without_peer_id();
            if !record.addrs.contains(&addr) {
                record.addrs.push(addr);
            }
        }
        record.updated_at = Instant::now();
    }

    /// Replace the peer's protocol list; returns whether it changed
    pub fn set_protocols(&self, peer: PeerId, protocols: Vec<String>) -> bool {
        let changed = {
            let mut record = self.peers.entry(peer).or_default();
            record.updated_at = Instant::now();
            if record.protocols == protocols {
                false
            } else {
                record.protocols = protocols.clone();
                true
            }
        };

        if changed {
            if let Some(events) = &self.events {
                // No subscribers is not an error
                let _ = events.send(HostEvent::PeerProtocolsChanged { peer, protocols });
            }
        }
        changed
    }

    /// Snapshot of a peer's record
    #[must_use]
    pub fn get(&self, peer: &PeerId) -> Option<PeerRecord> {
        self.peers.get(peer).map(|r| r.value().clone())
    }

    /// Known addresses of a peer
    #[must_use]
    pub fn addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.peers
            .get(peer)
            .map(|r| r.addrs.clone())
            .unwrap_or_default()
    }

    /// Whether the peer is known to handle `protocol`
    #[must_use]
    pub fn supports(&self, peer: &PeerId, protocol: &str) -> bool {
        self.peers
            .get(peer)
            .is_some_and(|r| r.protocols.iter().any(|p| p == protocol))
    }

    /// Peers known to handle `protocol`
    #[must_use]
    pub fn peers_with_protocol(&self, protocol: &str) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|entry| entry.protocols.iter().any(|p| p == protocol))
            .map(|entry| *entry.key())
            .collect()
    }

    /// Forget a peer
    pub fn remove(&self, peer: &PeerId) -> Option<PeerRecord> {
        self.peers.remove(peer).map(|(_, record)| record)
    }

    /// Number of known peers
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peers are known
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addrs_are_deduplicated_without_peer_suffix() {
        let store = PeerStore::new();
        let peer = PeerId::random();
        let addr: Multiaddr = "/memory/3".parse().unwrap();

        store.add_addrs(peer, [addr.clone(), addr.with_peer_id(peer)]);
        assert_eq!(store.addrs(&peer), vec![addr]);
    }

    #[test]
    fn test_protocol_lookup() {
        let store = PeerStore::new();
        let relay = PeerId::random();
        let other = PeerId::random();
        store.set_protocols(relay, vec!["/hop".into(), "/id".into()]);
        store.set_protocols(other, vec!["/id".into()]);

        assert!(store.supports(&relay, "/hop"));
        assert!(!store.supports(&other, "/hop"));
        assert_eq!(store.peers_with_protocol("/hop"), vec![relay]);
        assert_eq!(store.len(), 2);

        store.remove(&relay);
        assert!(store.peers_with_protocol("/hop").is_empty());
    }

    #[test]
    fn test_protocol_changes_are_published() {
        let (tx, mut rx) = broadcast::channel(8);
        let store = PeerStore::with_events(tx);
        let peer = PeerId::random();

        assert!(store.set_protocols(peer, vec!["/id".into()]));
        assert!(!store.set_protocols(peer, vec!["/id".into()]));
        assert!(store.set_protocols(peer, vec!["/hop".into(), "/id".into()]));

        assert_eq!(
            rx.try_recv().unwrap(),
            HostEvent::PeerProtocolsChanged {
                peer,
                protocols: vec!["/id".into()],
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            HostEvent::PeerProtocolsChanged {
                peer,
                protocols: vec!["/hop".into(), "/id".into()],
            }
        );
        assert!(rx.try_recv().is_err());
    }
}
