//! Self-describing network addresses.
//!
//! A [`Multiaddr`] is a stack of protocol components written as
//! `/ip4/10.0.0.1/tcp/4001/p2p/<peer-id>`. Relayed reachability is expressed
//! by encapsulation: `<relay-addr>/p2p-circuit/p2p/<target-peer-id>`.

use crate::error::MultiaddrError;
use crate::identity::PeerId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// A single multiaddr component
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// IPv4 address
    Ip4(Ipv4Addr),
    /// IPv6 address
    Ip6(Ipv6Addr),
    /// DNS name
    Dns(String),
    /// TCP port
    Tcp(u16),
    /// UDP port
    Udp(u16),
    /// In-process memory transport port
    Memory(u64),
    /// Peer identity
    P2p(PeerId),
    /// Relay circuit marker
    P2pCircuit,
}

impl Protocol {
    /// Protocol name as it appears in the text form
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Ip4(_) => "ip4",
            Protocol::Ip6(_) => "ip6",
            Protocol::Dns(_) => "dns",
            Protocol::Tcp(_) => "tcp",
            Protocol::Udp(_) => "udp",
            Protocol::Memory(_) => "memory",
            Protocol::P2p(_) => "p2p",
            Protocol::P2pCircuit => "p2p-circuit",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Ip4(ip) => write!(f, "/ip4/{ip}"),
            Protocol::Ip6(ip) => write!(f, "/ip6/{ip}"),
            Protocol::Dns(name) => write!(f, "/dns/{name}"),
            Protocol::Tcp(port) => write!(f, "/tcp/{port}"),
            Protocol::Udp(port) => write!(f, "/udp/{port}"),
            Protocol::Memory(port) => write!(f, "/memory/{port}"),
            Protocol::P2p(peer) => write!(f, "/p2p/{peer}"),
            Protocol::P2pCircuit => f.write_str("/p2p-circuit"),
        }
    }
}

/// Network address made of stacked protocol components
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Multiaddr {
    components: Vec<Protocol>,
}

impl Multiaddr {
    /// Empty address
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Append a component, builder style
    #[must_use]
    pub fn with(mut self, protocol: Protocol) -> Self {
        self.components.push(protocol);
        self
    }

    /// Append a component in place
    pub fn push(&mut self, protocol: Protocol) {
        self.components.push(protocol);
    }

    /// Iterate over components
    pub fn iter(&self) -> impl Iterator<Item = &Protocol> {
        self.components.iter()
    }

    /// Number of components
    #[must_use]
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Whether the address has no components
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Append all components of `other`
    #[must_use]
    pub fn encapsulate(&self, other: &Multiaddr) -> Multiaddr {
        let mut components = self.components.clone();
        components.extend(other.components.iter().cloned());
        Multiaddr { components }
    }

    /// Peer id in the trailing `/p2p` component, if any
    #[must_use]
    pub fn peer_id(&self) -> Option<PeerId> {
        match self.components.last() {
            Some(Protocol::P2p(peer)) => Some(*peer),
            _ => None,
        }
    }

    /// Copy of this address with a trailing `/p2p` component removed
    #[must_use]
    pub fn without_peer_id(&self) -> Multiaddr {
        let mut components = self.components.clone();
        if matches!(components.last(), Some(Protocol::P2p(_))) {
            components.pop();
        }
        Multiaddr { components }
    }

    /// Copy of this address ending in `/p2p/<peer>`, replacing any trailing id
    #[must_use]
    pub fn with_peer_id(&self, peer: PeerId) -> Multiaddr {
        self.without_peer_id().with(Protocol::P2p(peer))
    }

    /// Whether the address contains a `/p2p-circuit` marker
    #[must_use]
    pub fn is_circuit(&self) -> bool {
        self.components
            .iter()
            .any(|p| matches!(p, Protocol::P2pCircuit))
    }

    /// Number of `/p2p-circuit` markers
    #[must_use]
    pub fn circuit_count(&self) -> usize {
        self.components
            .iter()
            .filter(|p| matches!(p, Protocol::P2pCircuit))
            .count()
    }

    /// Split around the last `/p2p-circuit` marker
    ///
    /// Returns the components before and after the marker, or `None` if the
    /// address contains no marker.
    #[must_use]
    pub fn split_last_circuit(&self) -> Option<(Multiaddr, Multiaddr)> {
        let index = self
            .components
            .iter()
            .rposition(|p| matches!(p, Protocol::P2pCircuit))?;
        let before = Multiaddr {
            components: self.components[..index].to_vec(),
        };
        let after = Multiaddr {
            components: self.components[index + 1..].to_vec(),
        };
        Some((before, after))
    }

    /// Binary encoding, as carried in wire messages
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        // Vec<Protocol> serialization cannot fail for the in-memory form
        bincode::serialize(&self.components).unwrap_or_default()
    }

    /// Decode the binary encoding
    ///
    /// # Errors
    ///
    /// Returns [`MultiaddrError::Decode`] for malformed input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MultiaddrError> {
        let components: Vec<Protocol> =
            bincode::deserialize(bytes).map_err(|e| MultiaddrError::Decode(e.to_string()))?;
        Ok(Multiaddr { components })
    }
}

impl From<Protocol> for Multiaddr {
    fn from(protocol: Protocol) -> Self {
        Multiaddr {
            components: vec![protocol],
        }
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for component in &self.components {
            write!(f, "{component}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Multiaddr({self})")
    }
}

impl FromStr for Multiaddr {
    type Err = MultiaddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('/')
            .ok_or(MultiaddrError::MissingLeadingSlash)?;
        let mut parts = rest.split('/').filter(|p| !p.is_empty());
        let mut components = Vec::new();

        while let Some(name) = parts.next() {
            let protocol = match name {
                "p2p-circuit" => Protocol::P2pCircuit,
                "ip4" => Protocol::Ip4(parse_value(parts.next(), "ip4")?),
                "ip6" => Protocol::Ip6(parse_value(parts.next(), "ip6")?),
                "dns" => Protocol::Dns(
                    parts
                        .next()
                        .ok_or(MultiaddrError::MissingValue("dns"))?
                        .to_string(),
                ),
                "tcp" => Protocol::Tcp(parse_value(parts.next(), "tcp")?),
                "udp" => Protocol::Udp(parse_value(parts.next(), "udp")?),
                "memory" => Protocol::Memory(parse_value(parts.next(), "memory")?),
                "p2p" => Protocol::P2p(parse_value(parts.next(), "p2p")?),
                other => return Err(MultiaddrError::UnknownProtocol(other.to_string())),
            };
            components.push(protocol);
        }

        Ok(Multiaddr { components })
    }
}

fn parse_value<T: FromStr>(value: Option<&str>, protocol: &'static str) -> Result<T, MultiaddrError> {
    let value = value.ok_or(MultiaddrError::MissingValue(protocol))?;
    value.parse().map_err(|_| MultiaddrError::InvalidValue {
        protocol,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let peer = PeerId::random();
        let text = format!("/ip4/127.0.0.1/tcp/4001/p2p/{peer}");
        let addr: Multiaddr = text.parse().unwrap();
        assert_eq!(addr.len(), 3);
        assert_eq!(addr.peer_id(), Some(peer));
        assert_eq!(addr.to_string(), text);
    }

    #[test]
    fn test_circuit_split() {
        let relay = PeerId::random();
        let target = PeerId::random();
        let addr: Multiaddr = format!("/memory/4/p2p/{relay}/p2p-circuit/p2p/{target}")
            .parse()
            .unwrap();

        assert!(addr.is_circuit());
        let (relay_part, target_part) = addr.split_last_circuit().unwrap();
        assert_eq!(relay_part.peer_id(), Some(relay));
        assert_eq!(target_part.peer_id(), Some(target));
    }

    #[test]
    fn test_split_uses_last_marker() {
        let a = PeerId::random();
        let b = PeerId::random();
        let addr: Multiaddr = format!("/memory/1/p2p/{a}/p2p-circuit/p2p/{b}/p2p-circuit")
            .parse()
            .unwrap();
        let (relay_part, target_part) = addr.split_last_circuit().unwrap();
        assert!(relay_part.is_circuit());
        assert!(target_part.is_empty());
        assert_eq!(addr.circuit_count(), 2);
    }

    #[test]
    fn test_with_and_without_peer_id() {
        let peer = PeerId::random();
        let addr: Multiaddr = "/memory/9".parse().unwrap();
        let with = addr.with_peer_id(peer);
        assert_eq!(with.peer_id(), Some(peer));
        assert_eq!(with.without_peer_id(), addr);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            "memory/1".parse::<Multiaddr>(),
            Err(MultiaddrError::MissingLeadingSlash)
        );
        assert_eq!(
            "/quic/1".parse::<Multiaddr>(),
            Err(MultiaddrError::UnknownProtocol("quic".to_string()))
        );
        assert_eq!(
            "/tcp".parse::<Multiaddr>(),
            Err(MultiaddrError::MissingValue("tcp"))
        );
        assert!(matches!(
            "/tcp/notaport".parse::<Multiaddr>(),
            Err(MultiaddrError::InvalidValue { protocol: "tcp", .. })
        ));
    }

    #[test]
    fn test_binary_encoding() {
        let addr: Multiaddr = "/ip6/::1/udp/9000/p2p-circuit".parse().unwrap();
        let decoded = Multiaddr::from_bytes(&addr.to_bytes()).unwrap();
        assert_eq!(addr, decoded);
        assert!(Multiaddr::from_bytes(&[0xFF; 3]).is_err());
    }
}
