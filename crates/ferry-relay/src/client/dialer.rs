//! Circuit dialing through a relay's HOP service.

use super::ClientInner;
use crate::error::{ProtocolError, RelayError, Result};
use crate::limit::Limit;
use crate::protocol::{HOP_PROTOCOL, HopMessage, HopType, Peer, Status, read_message, write_message};
use ferry_core::upgrade::{UpgradeOptions, upgrade_outbound};
use ferry_core::{Connection, DialOptions, Host, Multiaddr, PeerId, Protocol, Stream, StreamOptions};

/// Relay and target named by a circuit address
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CircuitTarget {
    pub(crate) relay_addr: Multiaddr,
    pub(crate) relay: PeerId,
    pub(crate) target: PeerId,
}

/// Split `<relay-addr>/p2p/<relay>/p2p-circuit[/p2p/<target>]`
pub(crate) fn parse_circuit(addr: &Multiaddr, options: DialOptions) -> Result<CircuitTarget> {
    let (relay_addr, target_part) = addr
        .split_last_circuit()
        .ok_or(RelayError::InvalidAddress("missing /p2p-circuit".into()))?;

    if relay_addr.is_circuit() {
        return Err(RelayError::RelayedDial(addr.to_string()));
    }

    let relay = relay_addr
        .peer_id()
        .ok_or(RelayError::InvalidAddress("relay peer id required".into()))?;
    let target = target_part
        .peer_id()
        .or(options.peer)
        .ok_or(RelayError::InvalidAddress("target peer id required".into()))?;

    Ok(CircuitTarget {
        relay_addr,
        relay,
        target,
    })
}

/// Dial `addr` through its relay
///
/// The returned connection is transient and carries the limits the relay
/// announced. A relay connection opened only for this dial is closed again
/// if the relay refuses, unless we also hold a reservation on it. A relay
/// reachable only through another relay is refused without touching the
/// existing connection.
pub(crate) async fn dial(
    client: &ClientInner,
    host: &Host,
    addr: &Multiaddr,
    options: DialOptions,
) -> Result<Connection> {
    let circuit = parse_circuit(addr, options)?;
    if circuit.target == host.peer_id() {
        return Err(RelayError::InvalidAddress("cannot dial self".into()));
    }

    let (relay_connection, opened_here) = match host.connection(&circuit.relay) {
        Some(connection) if connection.is_transient() => {
            // Reaching the relay itself through another relay
            return Err(RelayError::RelayedDial(addr.to_string()));
        }
        Some(connection) => (connection, false),
        None => {
            let connection = if circuit.relay_addr.len() > 1 {
                host.dial(&circuit.relay_addr).await?
            } else {
                host.dial_peer(circuit.relay).await?
            };
            if connection.is_transient() {
                connection.close();
                return Err(RelayError::RelayedDial(addr.to_string()));
            }
            (connection, true)
        }
    };

    let target_addrs: Vec<Multiaddr> = host
        .peer_store()
        .addrs(&circuit.target)
        .into_iter()
        .filter(|a| !a.is_circuit())
        .collect();
    let exchange = tokio::time::timeout(
        client.config.stop_timeout(),
        hop_connect(&relay_connection, circuit.target, &target_addrs),
    )
    .await
    .map_err(|_| RelayError::Timeout("circuit connect"))
    .and_then(|result| result);

    let (stream, limit) = match exchange {
        Ok(accepted) => accepted,
        Err(e) => {
            if opened_here && !client.listener.has_relay(&circuit.relay) {
                tracing::debug!(
                    "Closing relay connection to {} after failed dial",
                    circuit.relay.short()
                );
                relay_connection.close();
            }
            return Err(e);
        }
    };

    let remote_addr = circuit
        .relay_addr
        .with_peer_id(circuit.relay)
        .with(Protocol::P2pCircuit)
        .with(Protocol::P2p(circuit.target));
    let upgrade = UpgradeOptions::transient(remote_addr, limit.map(|l| l.to_connection_limits()))
        .expect_peer(Some(circuit.target));

    let connection = upgrade_outbound(stream, host.keypair(), upgrade).await?;
    tracing::debug!(
        "Relayed connection to {} via {}",
        circuit.target.short(),
        circuit.relay.short()
    );
    Ok(connection)
}

async fn hop_connect(
    relay_connection: &Connection,
    target: PeerId,
    target_addrs: &[Multiaddr],
) -> Result<(Stream, Option<Limit>)> {
    let mut stream = relay_connection
        .new_stream(HOP_PROTOCOL, StreamOptions::default())
        .await?;

    let request = HopMessage::connect(Peer::new(target, target_addrs));
    write_message(&mut stream, &request).await?;
    let reply: HopMessage = read_message(&mut stream).await?;

    if reply.kind != HopType::Status {
        return Err(ProtocolError::UnexpectedMessage {
            expected: "STATUS",
            actual: format!("{:?}", reply.kind),
        }
        .into());
    }
    match reply.status {
        Some(Status::Ok) => Ok((stream, reply.limit.map(Limit::from_wire))),
        Some(status) => Err(RelayError::Status(status)),
        None => Err(ProtocolError::MissingField("status").into()),
    }
}
