//! Integration tests for cross-crate interactions.
//!
//! Exercises the host substrate and the relay crate together: relay policy
//! seen from the dialing side, reservation vouchers, and how identify over
//! relayed connections feeds (or does not feed) relay selection.

use ferry_core::{Connection, HandlerOptions, Stream, StreamOptions};
use ferry_integration_tests::fixtures::RelayNetwork;
use ferry_integration_tests::test_helpers::wait_until;
use ferry_relay::client::ReservationStatus;
use ferry_relay::{HOP_PROTOCOL, RelayServer, RelayServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn echo(host: &ferry_core::Host, protocol: &str) {
    host.handle(
        protocol,
        Arc::new(|stream: Stream, _connection: Connection| async move {
            let (mut reader, mut writer) = tokio::io::split(stream);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        }),
        HandlerOptions::transient(),
    );
}

// ============================================================================
// Relay Policy Seen From The Dialer
// ============================================================================

/// A relay that requires reservations refuses circuits from peers without one.
#[tokio::test]
async fn test_connect_without_reservation_denied() {
    let net = RelayNetwork::with_config(RelayServerConfig {
        allow_connect_without_reservation: false,
        ..RelayServerConfig::default()
    })
    .await
    .unwrap();
    let (listener, _transport) = net.reserved_peer().await.unwrap();
    let (dialer, _) = net.peer(0).await.unwrap();

    let addr = RelayNetwork::circuit_addr(&listener).unwrap();
    let err = dialer.dial(&addr).await.unwrap_err();
    assert_eq!(err.code(), "ERR_PERMISSION_DENIED");
    assert_eq!(net.server.metrics().circuits_opened, 0);

    net.shutdown().await;
}

/// Both ends holding reservations may circuit to each other when the relay
/// requires reservations.
#[tokio::test]
async fn test_reserved_dialer_allowed_when_reservation_required() {
    let net = RelayNetwork::with_config(RelayServerConfig {
        allow_connect_without_reservation: false,
        ..RelayServerConfig::default()
    })
    .await
    .unwrap();
    let (listener, _) = net.reserved_peer().await.unwrap();
    let (dialer, _) = net.reserved_peer().await.unwrap();
    echo(&listener, "/echo/1.0.0");

    let connection = dialer
        .dial(&RelayNetwork::circuit_addr(&listener).unwrap())
        .await
        .unwrap();
    assert!(connection.is_transient());

    let mut stream = connection
        .new_stream("/echo/1.0.0", StreamOptions::transient())
        .await
        .unwrap();
    stream.write_all(b"reserved").await.unwrap();
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"reserved");

    net.shutdown().await;
}

/// Circuits beyond the relay's capacity are refused while earlier ones live.
#[tokio::test]
async fn test_circuit_capacity_enforced() {
    let net = RelayNetwork::with_config(RelayServerConfig {
        max_circuits: 1,
        ..RelayServerConfig::default()
    })
    .await
    .unwrap();
    let (listener, _) = net.reserved_peer().await.unwrap();
    let addr = RelayNetwork::circuit_addr(&listener).unwrap();

    let (first, _) = net.peer(0).await.unwrap();
    let held = first.dial(&addr).await.unwrap();
    wait_until("circuit bridged", || async {
        net.server.metrics().circuits_active == 1
    })
    .await;

    let (second, _) = net.peer(0).await.unwrap();
    let err = second.dial(&addr).await.unwrap_err();
    assert_eq!(err.code(), "ERR_RESOURCE_LIMIT_EXCEEDED");

    assert!(!held.is_closed());

    net.shutdown().await;
}

/// Dialing a peer that holds no reservation fails at the relay.
#[tokio::test]
async fn test_target_without_reservation() {
    let net = RelayNetwork::new().await.unwrap();
    let (target, _) = net.peer(0).await.unwrap();
    let (dialer, _) = net.peer(0).await.unwrap();

    let addr = net
        .relay_addr()
        .with(ferry_core::Protocol::P2pCircuit)
        .with(ferry_core::Protocol::P2p(target.peer_id()));
    let err = dialer.dial(&addr).await.unwrap_err();
    assert_eq!(err.code(), "ERR_NO_RESERVATION");

    net.shutdown().await;
}

// ============================================================================
// Reservations
// ============================================================================

/// The voucher a relay hands out binds that relay to the reserving peer.
#[tokio::test]
async fn test_voucher_binds_relay_and_peer() {
    let net = RelayNetwork::new().await.unwrap();
    let (host, transport) = net.reserved_peer().await.unwrap();

    let reservations = transport.reservations().await;
    assert_eq!(reservations.len(), 1);
    let voucher = reservations[0].voucher.clone().unwrap();

    assert!(voucher.verify(net.relay.peer_id(), host.peer_id()).is_ok());
    assert!(voucher.verify(host.peer_id(), host.peer_id()).is_err());
    assert!(voucher.verify(net.relay.peer_id(), net.relay.peer_id()).is_err());
    assert_eq!(voucher.voucher.expiration, reservations[0].expire);

    net.shutdown().await;
}

/// Reservation addresses never include relayed addresses.
#[tokio::test]
async fn test_reservation_addrs_are_direct() {
    let net = RelayNetwork::new().await.unwrap();
    let (_host, transport) = net.reserved_peer().await.unwrap();

    let reservations = transport.reservations().await;
    assert!(!reservations[0].addrs.is_empty());
    assert!(reservations[0].addrs.iter().all(|a| !a.is_circuit()));

    net.shutdown().await;
}

// ============================================================================
// Identify Over Relayed Connections
// ============================================================================

/// Without opting in, nothing is identified over a circuit.
#[tokio::test]
async fn test_identify_skipped_on_transient_by_default() {
    let net = RelayNetwork::new().await.unwrap();
    let (listener, _) = net.reserved_peer().await.unwrap();
    let (dialer, _) = net.peer(0).await.unwrap();

    let connection = dialer
        .dial(&RelayNetwork::circuit_addr(&listener).unwrap())
        .await
        .unwrap();
    assert!(connection.is_transient());
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(dialer.peer_store().get(&listener.peer_id()).is_none());

    net.shutdown().await;
}

/// A relay seen only through another relay is never picked as a relay.
#[tokio::test]
async fn test_relayed_hop_peer_is_not_a_candidate() {
    let net = RelayNetwork::new().await.unwrap();

    // A second relay that is itself only reachable through the first
    let (hidden, _) = net.reserved_peer().await.unwrap();
    let hidden_server = RelayServer::new(RelayServerConfig::default()).unwrap();
    hidden_server.start(&hidden).await;

    let (dialer, transport) = net
        .peer_with(ferry_relay::RelayClientConfig::discover(1), true)
        .await
        .unwrap();
    let connection = dialer
        .dial(&RelayNetwork::circuit_addr(&hidden).unwrap())
        .await
        .unwrap();
    assert!(connection.is_transient());

    wait_until("identify over the circuit", || async {
        dialer.peer_store().supports(&hidden.peer_id(), HOP_PROTOCOL)
    })
    .await;
    // The direct relay behind the circuit is fair game
    wait_until("direct relay reserved", || async {
        transport.registry().status(&net.relay.peer_id()).await == Some(ReservationStatus::Active)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(transport.registry().status(&hidden.peer_id()).await, None);
    assert_eq!(transport.registry().len().await, 1);
    assert!(!hidden_server.store().has_reservation(&dialer.peer_id()).await);

    net.shutdown().await;
}

/// A directly connected relay is still picked up while circuits exist.
#[tokio::test]
async fn test_direct_relay_still_used_alongside_circuits() {
    let net = RelayNetwork::new().await.unwrap();
    let (listener, _) = net.reserved_peer().await.unwrap();

    let (dialer, transport) = net
        .peer_with(ferry_relay::RelayClientConfig::discover(1), true)
        .await
        .unwrap();
    dialer
        .dial(&RelayNetwork::circuit_addr(&listener).unwrap())
        .await
        .unwrap();

    wait_until("relay reserved", || async { transport.relay_count() == 1 }).await;
    assert_eq!(
        transport.registry().status(&net.relay.peer_id()).await,
        Some(ReservationStatus::Active)
    );
    assert!(net.server.store().has_reservation(&dialer.peer_id()).await);

    net.shutdown().await;
}
