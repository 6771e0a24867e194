//! Ferry host substrate.
//!
//! Provides the pieces a relay-capable peer is built on:
//!
//! - [`identity`]: Ed25519 keypairs and BLAKE3-derived [`PeerId`]s
//! - [`multiaddr`]: self-describing addresses, including `/p2p-circuit`
//! - [`mux`]: a small stream multiplexer over any ordered byte pipe
//! - [`connection`]: authenticated connections, direct or transient, with the
//!   transient gate enforced on stream open and accept
//! - [`host`]: transports, listeners, protocol handlers, peer store and events
//! - [`memory`]: an in-process transport for tests and demos

pub mod codec;
pub mod connection;
pub mod error;
pub mod event;
pub mod host;
pub mod identify;
pub mod identity;
pub mod memory;
pub mod multiaddr;
pub mod mux;
pub mod peer_store;
pub mod registrar;
pub mod stream;
pub mod transport;
pub mod upgrade;

pub use connection::{
    Connection, ConnectionId, ConnectionKind, ConnectionLimits, StreamOptions,
};
pub use error::{CodecError, ConnectionError, TransportError};
pub use event::HostEvent;
pub use host::{Host, HostBuilder, WeakHost};
pub use identity::{Keypair, PeerId};
pub use multiaddr::{Multiaddr, Protocol};
pub use registrar::{HandlerOptions, StreamHandler};
pub use stream::{Direction, Stream};
pub use transport::{DialOptions, Listener, Transport, TransportResult};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
