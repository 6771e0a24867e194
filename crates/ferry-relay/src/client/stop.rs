//! STOP handling: accepting circuits a relay opens towards us.

use super::ClientInner;
use crate::error::ProtocolError;
use crate::limit::Limit;
use crate::protocol::{StopMessage, StopType, Status, read_message, write_message};
use ferry_core::upgrade::{UpgradeOptions, upgrade_inbound};
use ferry_core::{Connection, Host, Multiaddr, Protocol, Stream};
use std::sync::Arc;

/// Serve one inbound STOP stream from a relay
pub(crate) async fn handle_stop(client: Arc<ClientInner>, host: Host, mut stream: Stream, connection: Connection) {
    let relay = connection.remote_peer();

    let request = match tokio::time::timeout(
        client.config.stop_timeout(),
        read_message::<_, StopMessage>(&mut stream),
    )
    .await
    {
        Ok(Ok(request)) => request,
        Ok(Err(e)) if e.is_malformed() => {
            tracing::debug!("Malformed STOP message from {}: {}", relay.short(), e);
            respond(&mut stream, Status::MalformedMessage).await;
            return;
        }
        Ok(Err(e)) => {
            tracing::debug!("Failed to read STOP message from {}: {}", relay.short(), e);
            return;
        }
        Err(_) => {
            tracing::debug!("STOP request from {} timed out", relay.short());
            return;
        }
    };

    if request.kind != StopType::Connect {
        respond(&mut stream, Status::UnexpectedMessage).await;
        return;
    }

    if !client.has_reservation(&relay).await {
        tracing::debug!("Refused STOP from {}: no reservation held", relay.short());
        respond(&mut stream, Status::PermissionDenied).await;
        return;
    }

    let initiator = match request
        .peer
        .ok_or(ProtocolError::MissingField("peer"))
        .and_then(|peer| peer.peer_id())
    {
        Ok(initiator) => initiator,
        Err(e) => {
            tracing::debug!("Malformed STOP CONNECT from {}: {}", relay.short(), e);
            respond(&mut stream, Status::MalformedMessage).await;
            return;
        }
    };

    if let Err(e) = write_message(&mut stream, &StopMessage::status(Status::Ok)).await {
        tracing::debug!("Failed to accept circuit from {}: {}", initiator.short(), e);
        return;
    }

    let limits = request
        .limit
        .map(|wire| Limit::from_wire(wire).to_connection_limits());
    let remote_addr = Multiaddr::from(Protocol::P2p(relay))
        .with(Protocol::P2pCircuit)
        .with(Protocol::P2p(initiator));

    let circuit = match upgrade_inbound(stream, host.keypair(), UpgradeOptions::transient(remote_addr, limits)).await {
        Ok(circuit) => circuit,
        Err(e) => {
            tracing::debug!("Relayed upgrade from {} failed: {}", initiator.short(), e);
            return;
        }
    };

    if circuit.remote_peer() != initiator {
        tracing::warn!(
            "Relay {} announced {} but circuit authenticated as {}",
            relay.short(),
            initiator.short(),
            circuit.remote_peer().short()
        );
        circuit.close();
        return;
    }

    tracing::debug!(
        "Accepted relayed connection from {} via {}",
        initiator.short(),
        relay.short()
    );
    host.register_connection(circuit);
}

async fn respond(stream: &mut Stream, status: Status) {
    if let Err(e) = write_message(stream, &StopMessage::status(status)).await {
        tracing::trace!("Failed to send STOP response: {}", e);
    }
}
