//! Circuit relay v2 for Ferry hosts.
//!
//! A peer that cannot accept direct connections reserves a slot on a relay
//! and advertises `<relay-addr>/p2p/<relay>/p2p-circuit` addresses. Other
//! peers dial those addresses; the relay asks the reserved peer to accept the
//! circuit and then forwards bytes under a data and duration budget.
//!
//! - [`server`]: the relay side (reservation store, HOP handling, bridging)
//! - [`client`]: the [`RelayTransport`] (circuit dialing, STOP handling,
//!   automatic relay selection)
//! - [`protocol`]: HOP and STOP wire messages
//!
//! Connections established through a relay are
//! [transient](ferry_core::ConnectionKind::Transient): protocols must opt in
//! to run over them.

pub mod client;
pub mod config;
pub mod error;
pub mod limit;
pub mod protocol;
pub mod server;
pub mod voucher;

pub use client::{ActiveReservation, CircuitListener, RelayTransport};
pub use config::{RelayClientConfig, RelayServerConfig, ReservationConfig};
pub use error::{ProtocolError, RelayError, Result};
pub use limit::{Limit, LimitTracker};
pub use protocol::{HOP_PROTOCOL, STOP_PROTOCOL, Status};
pub use server::{MetricsSnapshot, RelayServer};
pub use voucher::{SignedVoucher, Voucher};
