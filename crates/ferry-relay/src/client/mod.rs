//! Relay client: relay selection, circuit listening and circuit dialing.
//!
//! The client side is a [`RelayTransport`] registered on a host. It
//!
//! - dials `/p2p-circuit` addresses through a relay's HOP service
//! - answers STOP requests from relays it holds a reservation on
//! - watches identify results for HOP-capable peers and keeps up to
//!   `discover_relays` reservations, replacing relays that go away
//! - advertises `<relay-addr>/p2p/<relay>/p2p-circuit` for each reservation

pub mod controller;
mod dialer;
pub mod listener;
pub mod registry;
pub mod reservation;
mod stop;
pub mod transport;

pub use listener::CircuitListener;
pub use registry::{CandidateRegistry, RelayCandidate, ReservationStatus};
pub use reservation::ActiveReservation;
pub use transport::RelayTransport;

use crate::config::RelayClientConfig;
use dashmap::DashMap;
use ferry_core::{Connection, Host, PeerId, WeakHost};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// State shared by the transport, the STOP handler and the controller
pub(crate) struct ClientInner {
    pub(crate) config: RelayClientConfig,
    pub(crate) registry: CandidateRegistry,
    pub(crate) listener: Arc<CircuitListener>,
    pub(crate) reservations: RwLock<HashMap<PeerId, ActiveReservation>>,
    pub(crate) refreshers: DashMap<PeerId, JoinHandle<()>>,
    pub(crate) host: OnceLock<WeakHost>,
}

impl ClientInner {
    pub(crate) fn new(config: RelayClientConfig) -> Self {
        Self {
            config,
            registry: CandidateRegistry::new(),
            listener: Arc::new(CircuitListener::new()),
            reservations: RwLock::new(HashMap::new()),
            refreshers: DashMap::new(),
            host: OnceLock::new(),
        }
    }

    /// The host this client is attached to, while it exists
    pub(crate) fn host(&self) -> Option<Host> {
        self.host.get().and_then(WeakHost::upgrade)
    }

    pub(crate) async fn has_reservation(&self, relay: &PeerId) -> bool {
        self.reservations.read().await.contains_key(relay)
    }

    pub(crate) fn cancel_refreshers(&self) {
        for entry in self.refreshers.iter() {
            entry.value().abort();
        }
        self.refreshers.clear();
    }
}

/// An open non-transient connection to `peer`
pub(crate) fn direct_connection(host: &Host, peer: &PeerId) -> Option<Connection> {
    host.connections(peer).into_iter().find(|c| !c.is_transient())
}
