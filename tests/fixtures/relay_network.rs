//! Relay network fixture
//!
//! One relay host running a [`RelayServer`] on an in-process memory network,
//! plus helpers to add peers that reserve on it or dial through it.
//!
//! # Example
//!
//! ```no_run
//! use ferry_integration_tests::fixtures::RelayNetwork;
//!
//! # async fn run() -> ferry_relay::Result<()> {
//! let net = RelayNetwork::new().await?;
//! let (listener, _transport) = net.reserved_peer().await?;
//! let dialer = net.peer(0).await?.0;
//! let connection = dialer.dial(&RelayNetwork::circuit_addr(&listener).unwrap()).await?;
//! assert!(connection.is_transient());
//! net.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::test_helpers::wait_until;
use ferry_core::memory::{MemoryNetwork, MemoryTransport};
use ferry_core::{Host, Multiaddr, Protocol};
use ferry_relay::{RelayClientConfig, RelayServer, RelayServerConfig, RelayTransport, Result};
use std::sync::Arc;

/// A relay and the network it lives on
pub struct RelayNetwork {
    pub network: MemoryNetwork,
    pub relay: Host,
    pub server: RelayServer,
}

impl RelayNetwork {
    /// Start a relay with the default server configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the relay host cannot start or listen.
    pub async fn new() -> Result<Self> {
        Self::with_config(RelayServerConfig::default()).await
    }

    /// Start a relay with a custom server configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the relay host
    /// cannot start or listen.
    pub async fn with_config(config: RelayServerConfig) -> Result<Self> {
        let network = MemoryNetwork::new();
        let relay = Host::builder()
            .transport(Arc::new(MemoryTransport::new(network.clone())))
            .build();
        relay.start().await?;
        relay
            .listen(&[Multiaddr::from(Protocol::Memory(0))])
            .await?;

        let server = RelayServer::new(config)?;
        server.start(&relay).await;

        Ok(Self {
            network,
            relay,
            server,
        })
    }

    /// The relay's listen address
    ///
    /// # Panics
    ///
    /// Panics if the relay stopped listening.
    pub fn relay_addr(&self) -> Multiaddr {
        self.relay
            .addresses()
            .into_iter()
            .next()
            .expect("relay listens on the memory network")
    }

    /// A started peer with a relay transport discovering `discover` relays
    ///
    /// # Errors
    ///
    /// Returns an error if the peer cannot start.
    pub async fn peer(&self, discover: usize) -> Result<(Host, Arc<RelayTransport>)> {
        self.peer_with(RelayClientConfig::discover(discover), false)
            .await
    }

    /// A started peer with explicit client settings
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the peer cannot
    /// start.
    pub async fn peer_with(
        &self,
        config: RelayClientConfig,
        identify_transient: bool,
    ) -> Result<(Host, Arc<RelayTransport>)> {
        let transport = Arc::new(RelayTransport::new(config)?);
        let host = Host::builder()
            .transport(Arc::new(MemoryTransport::new(self.network.clone())))
            .transport(transport.clone())
            .identify_transient(identify_transient)
            .build();
        host.start().await?;
        Ok((host, transport))
    }

    /// A peer holding a reservation on the relay
    ///
    /// # Errors
    ///
    /// Returns an error if the peer cannot start or reach the relay.
    ///
    /// # Panics
    ///
    /// Panics if no reservation is made in time.
    pub async fn reserved_peer(&self) -> Result<(Host, Arc<RelayTransport>)> {
        let (host, transport) = self.peer(1).await?;
        host.dial(&self.relay_addr()).await?;
        wait_until("reservation", || async { transport.relay_count() == 1 }).await;
        Ok((host, transport))
    }

    /// First circuit address `host` advertises
    pub fn circuit_addr(host: &Host) -> Option<Multiaddr> {
        host.addresses().into_iter().find(Multiaddr::is_circuit)
    }

    /// Stop the relay service and host
    pub async fn shutdown(&self) {
        self.server.stop(&self.relay).await;
        self.relay.stop().await;
    }
}
