//! HOP request handling on the relay.

use super::ServerInner;
use super::bridge::{BridgeOutcome, bridge};
use super::store::Reservation;
use crate::error::{ProtocolError, RelayError, Result};
use crate::limit::{Limit, LimitTracker};
use crate::protocol::{
    HopMessage, HopType, Peer, ReservationInfo, STOP_PROTOCOL, Status, StopMessage, StopType,
    read_message, write_message,
};
use crate::voucher::{SignedVoucher, Voucher};
use ferry_core::{Connection, Host, PeerId, Stream, StreamOptions};
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Serve one inbound HOP stream
pub(crate) async fn handle_hop(
    relay: Arc<ServerInner>,
    host: Host,
    mut stream: Stream,
    connection: Connection,
) {
    let peer = connection.remote_peer();
    let timeout = relay.config.hop_timeout();

    let request = match tokio::time::timeout(timeout, read_message::<_, HopMessage>(&mut stream)).await {
        Ok(Ok(request)) => request,
        Ok(Err(e)) if e.is_malformed() => {
            tracing::debug!("Malformed HOP message from {}: {}", peer.short(), e);
            respond(&mut stream, HopMessage::status(Status::MalformedMessage)).await;
            return;
        }
        Ok(Err(e)) => {
            tracing::debug!("Failed to read HOP message from {}: {}", peer.short(), e);
            return;
        }
        Err(_) => {
            tracing::debug!("HOP request from {} timed out", peer.short());
            return;
        }
    };

    match request.kind {
        HopType::Reserve => handle_reserve(&relay, &host, stream, &connection, request).await,
        HopType::Connect => handle_connect(&relay, &host, stream, &connection, request).await,
        HopType::Status => {
            tracing::debug!("Unexpected HOP STATUS from {}", peer.short());
            respond(&mut stream, HopMessage::status(Status::UnexpectedMessage)).await;
        }
    }
}

async fn handle_reserve(
    relay: &ServerInner,
    host: &Host,
    mut stream: Stream,
    connection: &Connection,
    request: HopMessage,
) {
    let peer = connection.remote_peer();

    if peer == host.peer_id() {
        relay.metrics.reservation_refused();
        respond(&mut stream, HopMessage::status(Status::ReservationRefused)).await;
        return;
    }

    let requested = request.limit.map(Limit::from_wire);
    let reservation = match relay
        .store
        .reserve(peer, connection.remote_addr().clone(), requested)
        .await
    {
        Ok(reservation) => reservation,
        Err(e) => {
            tracing::debug!("Refused reservation for {}: {}", peer.short(), e);
            relay.metrics.reservation_refused();
            respond(&mut stream, HopMessage::status(Status::ReservationRefused)).await;
            return;
        }
    };

    let response = HopMessage::status(Status::Ok)
        .with_reservation(reservation_info(host, &reservation))
        .with_limit(reservation.limit.to_wire());

    if let Err(e) = write_message(&mut stream, &response).await {
        // The peer never learned about the reservation
        tracing::debug!("Failed to confirm reservation for {}: {}", peer.short(), e);
        relay.store.evict(&peer).await;
        return;
    }

    relay.metrics.reservation_accepted();
    tracing::info!(
        "Reserved relay slot for {} until {}",
        peer.short(),
        reservation.expire_unix
    );
}

fn reservation_info(host: &Host, reservation: &Reservation) -> ReservationInfo {
    let voucher = SignedVoucher::sign(
        host.keypair(),
        Voucher {
            relay: host.peer_id(),
            peer: reservation.peer,
            expiration: reservation.expire_unix,
        },
    );

    ReservationInfo {
        expire: reservation.expire_unix,
        addrs: host
            .addresses()
            .iter()
            .filter(|addr| !addr.is_circuit())
            .map(|addr| addr.to_bytes())
            .collect(),
        voucher: Some(voucher.to_bytes()),
    }
}

async fn handle_connect(
    relay: &ServerInner,
    host: &Host,
    mut stream: Stream,
    connection: &Connection,
    request: HopMessage,
) {
    let initiator = connection.remote_peer();

    let target = match request
        .peer
        .ok_or(ProtocolError::MissingField("peer"))
        .and_then(|peer| peer.peer_id())
    {
        Ok(target) => target,
        Err(e) => {
            tracing::debug!("Malformed CONNECT from {}: {}", initiator.short(), e);
            relay.metrics.circuit_failed();
            respond(&mut stream, HopMessage::status(Status::MalformedMessage)).await;
            return;
        }
    };

    if let Err(status) = admit_connect(relay, host, initiator, target).await {
        tracing::debug!(
            "Denied CONNECT {} -> {}: {}",
            initiator.short(),
            target.short(),
            status
        );
        relay.metrics.circuit_failed();
        respond(&mut stream, HopMessage::status(status)).await;
        return;
    }

    let Some(_slot) = CircuitSlot::acquire(relay) else {
        relay.metrics.circuit_failed();
        respond(&mut stream, HopMessage::status(Status::ResourceLimitExceeded)).await;
        return;
    };

    let limit = match relay.store.get(&target).await {
        Some(reservation) => reservation.limit,
        None => relay.store.effective_limit(None),
    };

    let Some(target_connection) = host
        .connections(&target)
        .into_iter()
        .find(|c| !c.is_transient())
    else {
        relay.metrics.circuit_failed();
        respond(&mut stream, HopMessage::status(Status::ConnectionFailed)).await;
        return;
    };

    // An initiator that goes away mid-handshake abandons the STOP stream
    let stop = tokio::select! {
        result = tokio::time::timeout(
            relay.config.hop_timeout(),
            stop_connect(&target_connection, initiator, limit),
        ) => result,
        () = connection.closed() => {
            tracing::debug!("Initiator {} left before circuit was established", initiator.short());
            relay.metrics.circuit_failed();
            return;
        }
    };

    let target_stream = match stop {
        Ok(Ok(target_stream)) => target_stream,
        Ok(Err(e)) => {
            tracing::debug!("STOP to {} failed: {}", target.short(), e);
            relay.metrics.circuit_failed();
            respond(&mut stream, HopMessage::status(Status::ConnectionFailed)).await;
            return;
        }
        Err(_) => {
            tracing::debug!("STOP to {} timed out", target.short());
            relay.metrics.circuit_failed();
            respond(&mut stream, HopMessage::status(Status::ConnectionFailed)).await;
            return;
        }
    };

    let response = HopMessage::status(Status::Ok).with_limit(limit.to_wire());
    if let Err(e) = write_message(&mut stream, &response).await {
        tracing::debug!("Failed to confirm circuit to {}: {}", initiator.short(), e);
        relay.metrics.circuit_failed();
        return;
    }

    relay.metrics.circuit_opened();
    tracing::debug!(
        "Bridging circuit {} -> {} ({:?})",
        initiator.short(),
        target.short(),
        limit
    );

    let tracker = LimitTracker::new(limit);
    let outcome = bridge(stream, target_stream, &tracker, &relay.metrics).await;
    relay.metrics.circuit_closed();

    match outcome {
        BridgeOutcome::DataLimit => {
            relay.metrics.data_limit_hit();
            tracing::debug!(
                "Circuit {} -> {} closed at data limit after {} bytes",
                initiator.short(),
                target.short(),
                tracker.transferred()
            );
        }
        BridgeOutcome::DurationLimit => {
            relay.metrics.duration_limit_hit();
            tracing::debug!(
                "Circuit {} -> {} closed at duration limit after {:?}",
                initiator.short(),
                target.short(),
                tracker.elapsed()
            );
        }
        BridgeOutcome::Completed | BridgeOutcome::Error => {
            tracing::trace!("Circuit {} -> {} ended: {:?}", initiator.short(), target.short(), outcome);
        }
    }
}

/// Policy checks for a CONNECT request
async fn admit_connect(
    relay: &ServerInner,
    host: &Host,
    initiator: PeerId,
    target: PeerId,
) -> std::result::Result<(), Status> {
    if target == host.peer_id() || target == initiator {
        return Err(Status::PermissionDenied);
    }
    if !relay.config.allow_connect_without_reservation
        && !relay.store.has_reservation(&initiator).await
    {
        return Err(Status::PermissionDenied);
    }
    if !relay.store.has_reservation(&target).await {
        return Err(Status::NoReservation);
    }
    Ok(())
}

/// Open a STOP stream over the existing connection to the target
async fn stop_connect(connection: &Connection, initiator: PeerId, limit: Limit) -> Result<Stream> {
    let mut stream = connection
        .new_stream(STOP_PROTOCOL, StreamOptions::default())
        .await?;

    write_message(&mut stream, &StopMessage::connect(Peer::new(initiator, &[]), limit.to_wire()))
        .await?;
    let reply: StopMessage = read_message(&mut stream).await?;

    if reply.kind != StopType::Status {
        return Err(ProtocolError::UnexpectedMessage {
            expected: "STATUS",
            actual: format!("{:?}", reply.kind),
        }
        .into());
    }
    match reply.status {
        Some(Status::Ok) => Ok(stream),
        Some(status) => Err(RelayError::Status(status)),
        None => Err(ProtocolError::MissingField("status").into()),
    }
}

async fn respond(stream: &mut Stream, message: HopMessage) {
    if let Err(e) = write_message(stream, &message).await {
        tracing::trace!("Failed to send HOP response: {}", e);
    }
}

/// Counts a bridging circuit against `max_circuits` while held
struct CircuitSlot<'a> {
    relay: &'a ServerInner,
}

impl<'a> CircuitSlot<'a> {
    fn acquire(relay: &'a ServerInner) -> Option<Self> {
        relay
            .active_circuits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < relay.config.max_circuits).then_some(n + 1)
            })
            .ok()
            .map(|_| Self { relay })
    }
}

impl Drop for CircuitSlot<'_> {
    fn drop(&mut self) {
        self.relay.active_circuits.fetch_sub(1, Ordering::AcqRel);
    }
}
