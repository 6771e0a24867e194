//! Circuit listener: advertises relayed addresses for held reservations.

use async_trait::async_trait;
use dashmap::DashMap;
use ferry_core::{Listener, Multiaddr, PeerId, Protocol};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone)]
struct RelayEntry {
    addrs: Vec<Multiaddr>,
    configured: bool,
    order: u64,
}

/// The set of relays we are reachable through
///
/// Each held reservation contributes `<relay-addr>/p2p/<relay>/p2p-circuit`
/// for every address of the relay. The host appends its own `/p2p` id.
#[derive(Debug, Default)]
pub struct CircuitListener {
    relays: DashMap<PeerId, RelayEntry>,
    next_order: AtomicU64,
}

impl CircuitListener {
    /// Create an empty listener
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise `relay` under `addrs`, replacing any previous entry
    pub fn add_relay(&self, relay: PeerId, addrs: Vec<Multiaddr>, configured: bool) {
        let order = match self.relays.get(&relay) {
            Some(existing) => existing.order,
            None => self.next_order.fetch_add(1, Ordering::Relaxed),
        };
        self.relays.insert(
            relay,
            RelayEntry {
                addrs,
                configured,
                order,
            },
        );
    }

    /// Stop advertising `relay`
    pub fn remove_relay(&self, relay: &PeerId) -> bool {
        self.relays.remove(relay).is_some()
    }

    /// Number of relays advertised
    #[must_use]
    pub fn relay_count(&self) -> usize {
        self.relays.len()
    }

    /// Whether `relay` is advertised
    #[must_use]
    pub fn has_relay(&self, relay: &PeerId) -> bool {
        self.relays.contains_key(relay)
    }

    /// Whether `relay` was added from an explicit listen address
    #[must_use]
    pub fn is_configured(&self, relay: &PeerId) -> bool {
        self.relays.get(relay).is_some_and(|entry| entry.configured)
    }

    /// Advertised relays in the order they were added
    #[must_use]
    pub fn relays(&self) -> Vec<PeerId> {
        let mut relays: Vec<(u64, PeerId)> = self
            .relays
            .iter()
            .map(|entry| (entry.order, *entry.key()))
            .collect();
        relays.sort_unstable_by_key(|(order, _)| *order);
        relays.into_iter().map(|(_, peer)| peer).collect()
    }

    /// Circuit addresses advertised through `relay`
    #[must_use]
    pub fn relay_addrs(&self, relay: &PeerId) -> Vec<Multiaddr> {
        let Some(entry) = self.relays.get(relay).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        if entry.addrs.is_empty() {
            return vec![circuit_addr(&Multiaddr::empty(), *relay)];
        }

        let mut addrs = Vec::with_capacity(entry.addrs.len());
        for addr in &entry.addrs {
            let circuit = circuit_addr(addr, *relay);
            if !addrs.contains(&circuit) {
                addrs.push(circuit);
            }
        }
        addrs
    }

    /// Drop every relay
    pub fn clear(&self) {
        self.relays.clear();
    }
}

/// Circuit address for `relay` reached through `addr`
#[must_use]
pub fn circuit_addr(addr: &Multiaddr, relay: PeerId) -> Multiaddr {
    addr.with_peer_id(relay).with(Protocol::P2pCircuit)
}

#[async_trait]
impl Listener for CircuitListener {
    fn addrs(&self) -> Vec<Multiaddr> {
        self.relays()
            .iter()
            .flat_map(|relay| self.relay_addrs(relay))
            .collect()
    }

    async fn close(&self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addrs_per_relay() {
        let listener = CircuitListener::new();
        let r1 = PeerId::random();
        let r2 = PeerId::random();
        listener.add_relay(r1, vec!["/memory/1".parse().unwrap()], false);
        listener.add_relay(r2, vec![], true);

        let addrs = listener.addrs();
        assert_eq!(addrs.len(), 2);
        assert_eq!(
            addrs[0].to_string(),
            format!("/memory/1/p2p/{r1}/p2p-circuit")
        );
        assert_eq!(addrs[1].to_string(), format!("/p2p/{r2}/p2p-circuit"));
        assert!(addrs.iter().all(Multiaddr::is_circuit));
    }

    #[test]
    fn test_remove_relay() {
        let listener = CircuitListener::new();
        let r1 = PeerId::random();
        let r2 = PeerId::random();
        listener.add_relay(r1, vec!["/memory/1".parse().unwrap()], false);
        listener.add_relay(r2, vec!["/memory/2".parse().unwrap()], false);
        assert_eq!(listener.relay_count(), 2);

        assert!(listener.remove_relay(&r1));
        assert!(!listener.remove_relay(&r1));
        assert_eq!(listener.relay_count(), 1);
        assert_eq!(listener.relays(), vec![r2]);
        assert_eq!(listener.addrs().len(), 1);
    }

    #[test]
    fn test_readd_keeps_order() {
        let listener = CircuitListener::new();
        let r1 = PeerId::random();
        let r2 = PeerId::random();
        listener.add_relay(r1, vec![], false);
        listener.add_relay(r2, vec![], false);
        listener.add_relay(r1, vec!["/memory/7".parse().unwrap()], true);

        assert_eq!(listener.relays(), vec![r1, r2]);
        assert!(listener.is_configured(&r1));
        assert!(!listener.is_configured(&r2));
    }
}
