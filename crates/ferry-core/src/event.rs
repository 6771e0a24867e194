//! Host events.

use crate::connection::{ConnectionId, ConnectionKind};
use crate::identity::PeerId;
use crate::multiaddr::Multiaddr;

/// Broadcast channel capacity for host events
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Events published by a [`Host`](crate::host::Host)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// A connection was registered
    ConnectionOpened {
        /// Remote peer
        peer: PeerId,
        /// Connection id
        connection: ConnectionId,
        /// Direct or transient
        kind: ConnectionKind,
    },

    /// A connection closed
    ConnectionClosed {
        /// Remote peer
        peer: PeerId,
        /// Connection id
        connection: ConnectionId,
        /// Direct or transient
        kind: ConnectionKind,
    },

    /// First connection to a peer opened
    PeerConnected(PeerId),

    /// Last connection to a peer closed
    PeerDisconnected(PeerId),

    /// A peer's protocols and listen addresses were learned
    PeerIdentified {
        /// Remote peer
        peer: PeerId,
        /// Protocols the peer handles
        protocols: Vec<String>,
        /// Addresses the peer listens on
        listen_addrs: Vec<Multiaddr>,
        /// Whether identification ran over a transient connection
        transient: bool,
    },

    /// The protocols recorded for a peer in the peer store changed
    PeerProtocolsChanged {
        /// Peer whose record changed
        peer: PeerId,
        /// New protocol list
        protocols: Vec<String>,
    },

    /// The host's own advertised addresses changed
    SelfAddressesChanged(Vec<Multiaddr>),
}
