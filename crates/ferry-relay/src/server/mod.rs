//! Relay server: reservations and circuit forwarding.
//!
//! The server registers the HOP protocol on a [`Host`]. Peers reserve a slot
//! with RESERVE; other peers reach them with CONNECT, which the relay turns
//! into a STOP stream over its existing connection to the reserved peer and
//! then bridges under the reservation's limits.

pub mod bridge;
mod hop;
pub mod metrics;
pub mod store;

pub use metrics::{MetricsSnapshot, RelayMetrics};
pub use store::{Reservation, ReservationStore};

use crate::config::RelayServerConfig;
use crate::error::Result;
use crate::protocol::HOP_PROTOCOL;
use ferry_core::{Connection, HandlerOptions, Host, HostEvent, Stream};
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use tokio::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

pub(crate) struct ServerInner {
    pub(crate) config: RelayServerConfig,
    pub(crate) store: ReservationStore,
    pub(crate) metrics: RelayMetrics,
    pub(crate) active_circuits: AtomicUsize,
}

/// Circuit relay v2 server
#[derive(Clone)]
pub struct RelayServer {
    inner: Arc<ServerInner>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl RelayServer {
    /// Create a relay server
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`](crate::RelayError::Config) if the
    /// configuration does not validate.
    pub fn new(config: RelayServerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ServerInner {
                store: ReservationStore::new(config.reservations.clone()),
                config,
                metrics: RelayMetrics::new(),
                active_circuits: AtomicUsize::new(0),
            }),
            tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Register HOP on `host` and start background maintenance
    pub async fn start(&self, host: &Host) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }

        let inner = self.inner.clone();
        let weak = host.downgrade();
        host.handle(
            HOP_PROTOCOL,
            Arc::new(move |stream: Stream, connection: Connection| {
                let inner = inner.clone();
                let weak = weak.clone();
                async move {
                    if let Some(host) = weak.upgrade() {
                        hop::handle_hop(inner, host, stream, connection).await;
                    }
                }
            }),
            HandlerOptions::default(),
        );

        tasks.push(self.spawn_sweep_task());
        tasks.push(self.spawn_eviction_task(host));

        tracing::info!(
            "Relay server started on {} (max {} reservations)",
            host.peer_id().short(),
            self.inner.config.reservations.max_reservations
        );
    }

    /// Unregister HOP, stop maintenance and drop all reservations
    pub async fn stop(&self, host: &Host) {
        host.unhandle(HOP_PROTOCOL);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.inner.store.clear().await;
        tracing::info!("Relay server stopped");
    }

    /// Periodically drop expired reservations
    fn spawn_sweep_task(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let interval = inner.config.reservations.clear_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let removed = inner.store.sweep().await;
                if removed > 0 {
                    tracing::debug!("Swept {} expired reservations", removed);
                }
            }
        })
    }

    /// Evict a peer's reservation when its last connection closes
    fn spawn_eviction_task(&self, host: &Host) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let mut events = host.subscribe();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(HostEvent::PeerDisconnected(peer)) => {
                        if inner.store.evict(&peer).await {
                            tracing::debug!("Evicted reservation of {}", peer.short());
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Relay event loop lagged by {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Reservation store
    #[must_use]
    pub fn store(&self) -> &ReservationStore {
        &self.inner.store
    }

    /// Counter snapshot
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &RelayServerConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
