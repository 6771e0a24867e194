//! Relay candidate registry.
//!
//! Tracks every peer seen advertising HOP, in discovery order, together with
//! the state of our reservation on it. Slot accounting counts pending
//! attempts so concurrent discoveries cannot overshoot the target.

use ferry_core::PeerId;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::RwLock;

/// State of our reservation on a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservationStatus {
    /// No reservation attempted or the last one ended
    None,
    /// RESERVE in flight
    Pending,
    /// Reservation held
    Active,
    /// Last attempt failed
    Failed,
}

/// A peer known to support HOP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCandidate {
    /// Candidate peer
    pub peer: PeerId,
    /// First discovery
    pub discovered_at: Instant,
    /// Discovery order, lower is earlier
    pub sequence: u64,
    /// Reservation state
    pub status: ReservationStatus,
    /// Explicitly configured via a circuit listen address
    pub configured: bool,
}

impl RelayCandidate {
    fn is_busy(&self) -> bool {
        matches!(
            self.status,
            ReservationStatus::Pending | ReservationStatus::Active
        )
    }
}

#[derive(Default)]
struct RegistryState {
    candidates: HashMap<PeerId, RelayCandidate>,
    next_sequence: u64,
}

impl RegistryState {
    fn discovered_slots_in_use(&self) -> usize {
        self.candidates
            .values()
            .filter(|c| !c.configured && c.is_busy())
            .count()
    }
}

/// Candidate registry behind a single lock
#[derive(Default)]
pub struct CandidateRegistry {
    state: RwLock<RegistryState>,
}

impl CandidateRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a HOP-capable peer; returns whether it was new
    pub async fn add(&self, peer: PeerId) -> bool {
        let mut state = self.state.write().await;
        if state.candidates.contains_key(&peer) {
            return false;
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.candidates.insert(
            peer,
            RelayCandidate {
                peer,
                discovered_at: Instant::now(),
                sequence,
                status: ReservationStatus::None,
                configured: false,
            },
        );
        true
    }

    /// Claim a discovered-relay slot for `peer`
    ///
    /// Succeeds only if `peer` is neither pending nor active and fewer than
    /// `max` discovered relays are pending or active; the candidate becomes
    /// [`ReservationStatus::Pending`].
    pub async fn begin_reservation(&self, peer: &PeerId, max: usize) -> bool {
        let mut state = self.state.write().await;
        if state.discovered_slots_in_use() >= max {
            return false;
        }
        match state.candidates.get_mut(peer) {
            Some(candidate) if !candidate.is_busy() => {
                candidate.status = ReservationStatus::Pending;
                true
            }
            _ => false,
        }
    }

    /// Mark `peer` as an explicitly configured relay with a pending reservation
    pub async fn begin_configured(&self, peer: PeerId) {
        let mut state = self.state.write().await;
        let sequence = state.next_sequence;
        let candidate = state.candidates.entry(peer).or_insert(RelayCandidate {
            peer,
            discovered_at: Instant::now(),
            sequence,
            status: ReservationStatus::None,
            configured: true,
        });
        candidate.configured = true;
        candidate.status = ReservationStatus::Pending;
        if candidate.sequence == sequence {
            state.next_sequence += 1;
        }
    }

    /// Set `peer`'s reservation state
    pub async fn set_status(&self, peer: &PeerId, status: ReservationStatus) {
        if let Some(candidate) = self.state.write().await.candidates.get_mut(peer) {
            candidate.status = status;
        }
    }

    /// Clear an active or pending reservation, returning the prior candidate state
    pub async fn demote(&self, peer: &PeerId) -> Option<RelayCandidate> {
        let mut state = self.state.write().await;
        let candidate = state.candidates.get_mut(peer)?;
        let prior = candidate.clone();
        if candidate.is_busy() {
            candidate.status = ReservationStatus::None;
        }
        Some(prior)
    }

    /// Forget every pending and active reservation
    pub async fn reset(&self) {
        for candidate in self.state.write().await.candidates.values_mut() {
            if candidate.is_busy() {
                candidate.status = ReservationStatus::None;
            }
        }
    }

    /// Candidate snapshot
    pub async fn get(&self, peer: &PeerId) -> Option<RelayCandidate> {
        self.state.read().await.candidates.get(peer).cloned()
    }

    /// Reservation state of `peer`
    pub async fn status(&self, peer: &PeerId) -> Option<ReservationStatus> {
        self.state.read().await.candidates.get(peer).map(|c| c.status)
    }

    /// Candidates not pending or active, earliest discovered first
    pub async fn idle_candidates(&self) -> Vec<PeerId> {
        let state = self.state.read().await;
        let mut idle: Vec<&RelayCandidate> =
            state.candidates.values().filter(|c| !c.is_busy()).collect();
        idle.sort_by_key(|c| c.sequence);
        idle.into_iter().map(|c| c.peer).collect()
    }

    /// Discovery order of `peer`, if known
    pub async fn sequence(&self, peer: &PeerId) -> Option<u64> {
        self.state.read().await.candidates.get(peer).map(|c| c.sequence)
    }

    /// Relays currently held, earliest discovered first
    pub async fn active(&self) -> Vec<PeerId> {
        let state = self.state.read().await;
        let mut active: Vec<&RelayCandidate> = state
            .candidates
            .values()
            .filter(|c| c.status == ReservationStatus::Active)
            .collect();
        active.sort_by_key(|c| c.sequence);
        active.into_iter().map(|c| c.peer).collect()
    }

    /// Discovered (non-configured) relays pending or active
    pub async fn slots_in_use(&self) -> usize {
        self.state.read().await.discovered_slots_in_use()
    }

    /// Number of candidates
    pub async fn len(&self) -> usize {
        self.state.read().await.candidates.len()
    }

    /// Whether no candidates are known
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.candidates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_discovery_order_kept() {
        let registry = CandidateRegistry::new();
        let peers: Vec<PeerId> = (0..3).map(|_| PeerId::random()).collect();
        for peer in &peers {
            assert!(registry.add(*peer).await);
        }
        assert!(!registry.add(peers[0]).await);
        assert_eq!(registry.idle_candidates().await, peers);
    }

    #[tokio::test]
    async fn test_pending_counts_toward_slots() {
        let registry = CandidateRegistry::new();
        let a = PeerId::random();
        let b = PeerId::random();
        registry.add(a).await;
        registry.add(b).await;

        assert!(registry.begin_reservation(&a, 1).await);
        assert!(!registry.begin_reservation(&b, 1).await);
        assert!(!registry.begin_reservation(&a, 2).await);

        registry.set_status(&a, ReservationStatus::Failed).await;
        assert!(registry.begin_reservation(&b, 1).await);
    }

    #[tokio::test]
    async fn test_concurrent_claims_respect_limit() {
        let registry = std::sync::Arc::new(CandidateRegistry::new());
        let peers: Vec<PeerId> = (0..3).map(|_| PeerId::random()).collect();
        for peer in &peers {
            registry.add(*peer).await;
        }

        let claims = peers.iter().map(|peer| {
            let registry = registry.clone();
            let peer = *peer;
            tokio::spawn(async move { registry.begin_reservation(&peer, 1).await })
        });
        let mut granted = 0;
        for claim in claims {
            if claim.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }

    #[tokio::test]
    async fn test_configured_relays_do_not_use_slots() {
        let registry = CandidateRegistry::new();
        let configured = PeerId::random();
        let discovered = PeerId::random();
        registry.begin_configured(configured).await;
        registry.set_status(&configured, ReservationStatus::Active).await;
        registry.add(discovered).await;

        assert_eq!(registry.slots_in_use().await, 0);
        assert!(registry.begin_reservation(&discovered, 1).await);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_demote_returns_prior_state() {
        let registry = CandidateRegistry::new();
        let peer = PeerId::random();
        registry.add(peer).await;
        registry.set_status(&peer, ReservationStatus::Active).await;

        let prior = registry.demote(&peer).await.unwrap();
        assert_eq!(prior.status, ReservationStatus::Active);
        assert_eq!(registry.status(&peer).await, Some(ReservationStatus::None));
        assert!(registry.active().await.is_empty());
    }
}
