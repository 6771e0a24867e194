//! Reservation store.

use crate::config::ReservationConfig;
use crate::error::{RelayError, Result};
use crate::limit::Limit;
use crate::protocol::Status;
use ferry_core::{Multiaddr, PeerId};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// An active reservation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Reserving peer
    pub peer: PeerId,
    /// Address of the reserving connection
    pub addr: Multiaddr,
    /// Local expiry
    pub expires_at: Instant,
    /// Expiry as unix seconds, as advertised to the peer
    pub expire_unix: u64,
    /// Limit applied to circuits terminating at this peer
    pub limit: Limit,
}

impl Reservation {
    /// Whether the reservation has run out
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Reservations keyed by peer, at most one per peer
pub struct ReservationStore {
    config: ReservationConfig,
    reservations: RwLock<HashMap<PeerId, Reservation>>,
}

impl ReservationStore {
    /// Create an empty store
    #[must_use]
    pub fn new(config: ReservationConfig) -> Self {
        Self {
            config,
            reservations: RwLock::new(HashMap::new()),
        }
    }

    /// Create or replace `peer`'s reservation
    ///
    /// Expired entries are swept first. A peer without a reservation is
    /// refused once the store is full; a peer renewing is never refused.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Status`] with [`Status::ReservationRefused`] when
    /// the store is at capacity.
    pub async fn reserve(
        &self,
        peer: PeerId,
        addr: Multiaddr,
        requested: Option<Limit>,
    ) -> Result<Reservation> {
        let mut reservations = self.reservations.write().await;
        reservations.retain(|_, r| !r.is_expired());

        if reservations.len() >= self.config.max_reservations && !reservations.contains_key(&peer) {
            return Err(RelayError::Status(Status::ReservationRefused));
        }

        let ttl = self.config.reservation_ttl();
        let reservation = Reservation {
            peer,
            addr,
            expires_at: Instant::now() + ttl,
            expire_unix: unix_now().saturating_add(ttl.as_secs()),
            limit: self.effective_limit(requested),
        };
        reservations.insert(peer, reservation.clone());

        Ok(reservation)
    }

    /// Limit for a new reservation
    ///
    /// With `apply_default_limit` each bound is the tighter of the requested
    /// and the default one; a bound the peer leaves unset keeps the default.
    /// Without it the request is taken as is.
    #[must_use]
    pub fn effective_limit(&self, requested: Option<Limit>) -> Limit {
        let requested = requested.unwrap_or_default();
        if !self.config.apply_default_limit {
            return requested;
        }

        let default = self.config.default_limit();
        Limit {
            data: tighter(requested.data, default.data),
            duration: tighter(requested.duration, default.duration),
        }
    }

    /// Whether `peer` holds a live reservation
    pub async fn has_reservation(&self, peer: &PeerId) -> bool {
        self.reservations
            .read()
            .await
            .get(peer)
            .is_some_and(|r| !r.is_expired())
    }

    /// `peer`'s live reservation
    pub async fn get(&self, peer: &PeerId) -> Option<Reservation> {
        self.reservations
            .read()
            .await
            .get(peer)
            .filter(|r| !r.is_expired())
            .cloned()
    }

    /// Drop `peer`'s reservation; returns whether one existed
    pub async fn evict(&self, peer: &PeerId) -> bool {
        self.reservations.write().await.remove(peer).is_some()
    }

    /// Drop expired reservations; returns how many were removed
    pub async fn sweep(&self) -> usize {
        let mut reservations = self.reservations.write().await;
        let before = reservations.len();
        reservations.retain(|_, r| !r.is_expired());
        before - reservations.len()
    }

    /// Number of stored reservations
    pub async fn len(&self) -> usize {
        self.reservations.read().await.len()
    }

    /// Whether the store is empty
    pub async fn is_empty(&self) -> bool {
        self.reservations.read().await.is_empty()
    }

    /// Drop everything
    pub async fn clear(&self) {
        self.reservations.write().await.clear();
    }

    /// Reservation lifetime
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.config.reservation_ttl()
    }
}

fn tighter<T: Ord>(requested: Option<T>, default: Option<T>) -> Option<T> {
    match (requested, default) {
        (Some(requested), Some(default)) => Some(requested.min(default)),
        (requested, default) => requested.or(default),
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
