//! Transport abstraction.
//!
//! A transport turns a [`Multiaddr`] into an authenticated [`Connection`] and
//! can listen on addresses it understands. The [`Host`] keeps an ordered list
//! of transports and uses the first one that accepts an address.

use crate::connection::Connection;
use crate::error::TransportError;
use crate::host::Host;
use crate::identity::PeerId;
use crate::multiaddr::Multiaddr;
use async_trait::async_trait;
use std::sync::Arc;

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Per-dial options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DialOptions {
    /// Peer the caller expects to reach, when the address does not name it
    pub peer: Option<PeerId>,
}

/// An active listener
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Addresses this listener is reachable on
    fn addrs(&self) -> Vec<Multiaddr>;

    /// Stop listening
    async fn close(&self);
}

/// A way of reaching peers
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Whether this transport can dial `addr`
    fn can_dial(&self, addr: &Multiaddr) -> bool;

    /// Whether this transport can listen on `addr`
    fn can_listen(&self, addr: &Multiaddr) -> bool;

    /// Called once when the host starts
    async fn start(&self, _host: &Host) -> TransportResult<()> {
        Ok(())
    }

    /// Called once when the host stops
    async fn stop(&self) {}

    /// Establish a connection to `addr`
    async fn dial(
        &self,
        host: &Host,
        addr: &Multiaddr,
        options: DialOptions,
    ) -> TransportResult<Connection>;

    /// Start listening on `addr`
    async fn listen(&self, host: &Host, addr: &Multiaddr) -> TransportResult<Arc<dyn Listener>>;
}
