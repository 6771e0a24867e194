//! The circuit relay transport.

use super::controller::{self, listen_configured};
use super::{ActiveReservation, CandidateRegistry, CircuitListener, ClientInner, dialer, stop};
use crate::config::RelayClientConfig;
use crate::error::Result;
use crate::protocol::STOP_PROTOCOL;
use async_trait::async_trait;
use ferry_core::{
    Connection, DialOptions, HandlerOptions, Host, Listener, Multiaddr, Stream, Transport,
    TransportResult,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Transport for `/p2p-circuit` addresses
///
/// Register it on a host next to a direct transport. Dialing a circuit
/// address goes through the named relay; listening on one reserves a slot on
/// that relay. With `discover_relays > 0` the transport also picks relays on
/// its own from identified peers.
pub struct RelayTransport {
    inner: Arc<ClientInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayTransport {
    /// Create a relay transport
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`](crate::RelayError::Config) if the configuration
    /// does not validate.
    pub fn new(config: RelayClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ClientInner::new(config)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// The circuit listener advertising our relayed addresses
    #[must_use]
    pub fn listener(&self) -> Arc<CircuitListener> {
        self.inner.listener.clone()
    }

    /// Number of relays we are currently reachable through
    #[must_use]
    pub fn relay_count(&self) -> usize {
        self.inner.listener.relay_count()
    }

    /// Reservations currently held
    pub async fn reservations(&self) -> Vec<ActiveReservation> {
        let mut reservations: Vec<ActiveReservation> =
            self.inner.reservations.read().await.values().cloned().collect();
        reservations.sort_by_key(|r| r.expires_at);
        reservations
    }

    /// Relay candidates seen so far
    #[must_use]
    pub fn registry(&self) -> &CandidateRegistry {
        &self.inner.registry
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &RelayClientConfig {
        &self.inner.config
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn name(&self) -> &'static str {
        "circuit-relay"
    }

    fn can_dial(&self, addr: &Multiaddr) -> bool {
        addr.is_circuit()
    }

    fn can_listen(&self, addr: &Multiaddr) -> bool {
        addr.is_circuit()
    }

    async fn start(&self, host: &Host) -> TransportResult<()> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Ok(());
        }

        // A transport belongs to one host for its whole life
        let _ = self.inner.host.set(host.downgrade());

        let inner = self.inner.clone();
        let weak = host.downgrade();
        host.handle(
            STOP_PROTOCOL,
            Arc::new(move |stream: Stream, connection: Connection| {
                let inner = inner.clone();
                let weak = weak.clone();
                async move {
                    if let Some(host) = weak.upgrade() {
                        stop::handle_stop(inner, host, stream, connection).await;
                    }
                }
            }),
            HandlerOptions::default(),
        );

        host.add_listener(self.inner.listener.clone());
        tasks.push(tokio::spawn(controller::run(
            self.inner.clone(),
            host.subscribe(),
        )));

        tracing::debug!(
            "Relay transport started (discovering {} relays)",
            self.inner.config.discover_relays
        );
        Ok(())
    }

    async fn stop(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.inner.cancel_refreshers();
        if let Some(host) = self.inner.host() {
            host.unhandle(STOP_PROTOCOL);
        }
        self.inner.listener.clear();
        self.inner.reservations.write().await.clear();
        self.inner.registry.reset().await;
        tracing::debug!("Relay transport stopped");
    }

    async fn dial(&self, host: &Host, addr: &Multiaddr, options: DialOptions) -> TransportResult<Connection> {
        Ok(dialer::dial(&self.inner, host, addr, options).await?)
    }

    async fn listen(&self, host: &Host, addr: &Multiaddr) -> TransportResult<Arc<dyn Listener>> {
        Ok(listen_configured(&self.inner, host, addr).await?)
    }
}

impl std::fmt::Debug for RelayTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayTransport")
            .field("config", &self.inner.config)
            .field("relays", &self.inner.listener.relay_count())
            .finish_non_exhaustive()
    }
}
