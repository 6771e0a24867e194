//! Test fixtures

mod relay_network;

pub use relay_network::RelayNetwork;
