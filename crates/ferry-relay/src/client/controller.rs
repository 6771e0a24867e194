//! Relay selection.
//!
//! Reacts to host events: identified HOP peers, and directly connected peers
//! whose stored protocols gain HOP, become candidates and fill free
//! reservation slots, lost relays are withdrawn from the advertised addresses
//! before a replacement is searched for, and held reservations are refreshed
//! ahead of expiry.

use super::reservation::{ActiveReservation, reserve};
use super::{ClientInner, ReservationStatus, direct_connection};
use crate::error::{RelayError, Result};
use crate::protocol::HOP_PROTOCOL;
use ferry_core::{ConnectionError, Host, HostEvent, Listener, Multiaddr, PeerId};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

/// Drive relay selection until the host goes away
pub(crate) async fn run(client: Arc<ClientInner>, mut events: broadcast::Receiver<HostEvent>) {
    loop {
        match events.recv().await {
            Ok(HostEvent::PeerIdentified {
                peer,
                protocols,
                transient,
                ..
            }) => {
                if !transient && protocols.iter().any(|p| p == HOP_PROTOCOL) {
                    tokio::spawn(on_candidate(client.clone(), peer));
                }
            }
            Ok(HostEvent::PeerProtocolsChanged { peer, protocols }) => {
                // Only peers we reach directly; stored peers wait for a
                // replacement search
                let direct = client
                    .host()
                    .is_some_and(|host| direct_connection(&host, &peer).is_some());
                if direct && protocols.iter().any(|p| p == HOP_PROTOCOL) {
                    tokio::spawn(on_candidate(client.clone(), peer));
                }
            }
            Ok(HostEvent::PeerDisconnected(peer)) => {
                on_peer_disconnected(&client, peer).await;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Relay client event loop lagged by {} events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
    tracing::debug!("Relay client event loop finished");
}

/// A peer advertising HOP was identified over a direct connection
async fn on_candidate(client: Arc<ClientInner>, relay: PeerId) {
    let Some(host) = client.host() else { return };

    if client.registry.add(relay).await {
        tracing::debug!("Discovered relay candidate {}", relay.short());
    }
    if !client
        .registry
        .begin_reservation(&relay, client.config.discover_relays)
        .await
    {
        return;
    }

    if let Err(e) = try_reserve(&client, &host, relay, false).await {
        tracing::debug!("Reservation on {} failed: {}", relay.short(), e);
        find_replacement(client, host, Some(relay)).await;
    }
}

async fn on_peer_disconnected(client: &Arc<ClientInner>, peer: PeerId) {
    let Some(host) = client.host() else { return };

    let Some(prior) = release(client, &host, peer).await else {
        return;
    };
    if prior.status != ReservationStatus::Active {
        return;
    }

    tracing::info!("Lost relay {}", peer.short());
    if !prior.configured {
        tokio::spawn(find_replacement(client.clone(), host, Some(peer)));
    }
}

/// Reserve on `relay` over its existing direct connection and activate it
///
/// The candidate must already be pending. On failure it is marked failed.
pub(crate) async fn try_reserve(
    client: &Arc<ClientInner>,
    host: &Host,
    relay: PeerId,
    configured: bool,
) -> Result<ActiveReservation> {
    let result = match direct_connection(host, &relay) {
        Some(connection) => reserve(&connection, host.peer_id(), client.config.stop_timeout()).await,
        None => Err(RelayError::Connection(ConnectionError::Closed)),
    };

    match result {
        Ok(reservation) => {
            activate(client, host, reservation.clone(), configured).await?;
            Ok(reservation)
        }
        Err(e) => {
            client
                .registry
                .set_status(&relay, ReservationStatus::Failed)
                .await;
            Err(e)
        }
    }
}

/// Record a granted reservation and start advertising it
async fn activate(
    client: &Arc<ClientInner>,
    host: &Host,
    reservation: ActiveReservation,
    configured: bool,
) -> Result<()> {
    let relay = reservation.relay;
    let addrs = if reservation.addrs.is_empty() {
        host.peer_store().addrs(&relay)
    } else {
        reservation.addrs.clone()
    };

    client
        .registry
        .set_status(&relay, ReservationStatus::Active)
        .await;
    client
        .reservations
        .write()
        .await
        .insert(relay, reservation.clone());
    client.listener.add_relay(relay, addrs, configured);

    // The relay may have dropped while RESERVE was in flight
    if direct_connection(host, &relay).is_none() {
        release(client, host, relay).await;
        return Err(RelayError::Connection(ConnectionError::Closed));
    }

    schedule_refresh(client, relay, reservation.remaining());
    host.notify_addresses_changed();

    tracing::info!(
        "Listening via relay {} ({} relays)",
        relay.short(),
        client.listener.relay_count()
    );
    Ok(())
}

/// Withdraw `relay`: stop advertising it, cancel its refresh and clear its
/// reservation state. Returns the candidate as it was before.
async fn release(
    client: &ClientInner,
    host: &Host,
    relay: PeerId,
) -> Option<super::RelayCandidate> {
    let advertised = client.listener.remove_relay(&relay);
    if let Some((_, task)) = client.refreshers.remove(&relay) {
        task.abort();
    }
    client.reservations.write().await.remove(&relay);
    let prior = client.registry.demote(&relay).await;

    if advertised {
        host.notify_addresses_changed();
    }
    prior
}

/// Fill free slots: connected candidates first, then stored HOP peers
///
/// `lost` is the relay whose slot is being refilled; it is not tried again.
async fn find_replacement(client: Arc<ClientInner>, host: Host, lost: Option<PeerId>) {
    let max = client.config.discover_relays;
    let mut tried: HashSet<PeerId> = lost.into_iter().collect();

    for peer in client.registry.idle_candidates().await {
        if client.registry.slots_in_use().await >= max {
            return;
        }
        if direct_connection(&host, &peer).is_none() || !tried.insert(peer) {
            continue;
        }
        if !client.registry.begin_reservation(&peer, max).await {
            continue;
        }
        if let Err(e) = try_reserve(&client, &host, peer, false).await {
            tracing::debug!("Replacement relay {} failed: {}", peer.short(), e);
        }
    }

    let mut stored: Vec<(u64, PeerId)> = Vec::new();
    for peer in host.peer_store().peers_with_protocol(HOP_PROTOCOL) {
        if peer == host.peer_id() || tried.contains(&peer) {
            continue;
        }
        let order = client.registry.sequence(&peer).await.unwrap_or(u64::MAX);
        stored.push((order, peer));
    }
    stored.sort_by_key(|(order, _)| *order);

    for (_, peer) in stored {
        if client.registry.slots_in_use().await >= max {
            return;
        }
        tried.insert(peer);
        client.registry.add(peer).await;
        if !client.registry.begin_reservation(&peer, max).await {
            continue;
        }

        match host.dial_peer(peer).await {
            Ok(connection) if !connection.is_transient() => {
                if let Err(e) = try_reserve(&client, &host, peer, false).await {
                    tracing::debug!("Stored relay {} failed: {}", peer.short(), e);
                }
            }
            Ok(_) => {
                client
                    .registry
                    .set_status(&peer, ReservationStatus::Failed)
                    .await;
            }
            Err(e) => {
                tracing::debug!("Could not reach stored relay {}: {}", peer.short(), e);
                client
                    .registry
                    .set_status(&peer, ReservationStatus::Failed)
                    .await;
            }
        }
    }
}

/// Shortest wait between two refreshes of one reservation
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Delay before refreshing a reservation with `remaining` lifetime
///
/// Normally `margin` ahead of expiry. A relay TTL at or below the margin
/// would make that zero, so the delay never drops below half the remaining
/// lifetime or [`MIN_REFRESH_INTERVAL`].
fn refresh_delay(remaining: Duration, margin: Duration) -> Duration {
    remaining
        .saturating_sub(margin)
        .max(remaining / 2)
        .max(MIN_REFRESH_INTERVAL)
}

fn schedule_refresh(client: &Arc<ClientInner>, relay: PeerId, remaining: Duration) {
    let wait = refresh_delay(remaining, client.config.refresh_margin());
    tracing::trace!("Refreshing reservation on {} in {:?}", relay.short(), wait);
    let task_client = client.clone();
    let task = tokio::spawn(async move {
        tokio::time::sleep(wait).await;
        refresh(task_client, relay).await;
    });
    if let Some(previous) = client.refreshers.insert(relay, task) {
        previous.abort();
    }
}

async fn refresh(client: Arc<ClientInner>, relay: PeerId) {
    // Detach our own handle so re-scheduling does not abort this task
    client.refreshers.remove(&relay);
    let Some(host) = client.host() else { return };

    let result = match direct_connection(&host, &relay) {
        Some(connection) => reserve(&connection, host.peer_id(), client.config.stop_timeout()).await,
        None => Err(RelayError::Connection(ConnectionError::Closed)),
    };

    if client.registry.status(&relay).await != Some(ReservationStatus::Active) {
        return;
    }

    match result {
        Ok(reservation) => {
            tracing::debug!("Refreshed reservation on {}", relay.short());
            let configured = client.listener.is_configured(&relay);
            if let Err(e) = activate(&client, &host, reservation, configured).await {
                tracing::debug!("Refreshed relay {} went away: {}", relay.short(), e);
            }
        }
        Err(e) => {
            tracing::warn!("Failed to refresh reservation on {}: {}", relay.short(), e);
            let configured = client.listener.is_configured(&relay);
            release(&client, &host, relay).await;
            if !configured {
                find_replacement(client, host, Some(relay)).await;
            }
        }
    }
}

/// Reserve on the relay named by a `/p2p-circuit` listen address
pub(crate) async fn listen_configured(
    client: &Arc<ClientInner>,
    host: &Host,
    addr: &Multiaddr,
) -> Result<Arc<dyn Listener>> {
    let (relay_part, rest) = addr
        .split_last_circuit()
        .ok_or(RelayError::InvalidAddress("missing /p2p-circuit".into()))?;
    if !rest.is_empty() {
        return Err(RelayError::InvalidAddress(
            "listen address must end in /p2p-circuit".into(),
        ));
    }
    if relay_part.is_circuit() {
        return Err(RelayError::RelayedDial(addr.to_string()));
    }
    let relay = relay_part
        .peer_id()
        .ok_or(RelayError::InvalidAddress("relay peer id required".into()))?;

    let connection = if relay_part.len() > 1 {
        host.dial(&relay_part).await?
    } else {
        host.dial_peer(relay).await?
    };
    if connection.is_transient() {
        return Err(RelayError::InvalidAddress(
            "relay is only reachable through another relay".into(),
        ));
    }

    client.registry.begin_configured(relay).await;
    try_reserve(client, host, relay, true).await?;

    Ok(Arc::new(ConfiguredRelay {
        client: client.clone(),
        relay,
    }))
}

/// Listener handle for one explicitly configured relay
struct ConfiguredRelay {
    client: Arc<ClientInner>,
    relay: PeerId,
}

#[async_trait::async_trait]
impl Listener for ConfiguredRelay {
    fn addrs(&self) -> Vec<Multiaddr> {
        self.client.listener.relay_addrs(&self.relay)
    }

    async fn close(&self) {
        if let Some(host) = self.client.host() {
            release(&self.client, &host, self.relay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_delay_ahead_of_expiry() {
        let margin = Duration::from_secs(300);
        assert_eq!(
            refresh_delay(Duration::from_secs(7200), margin),
            Duration::from_secs(6900)
        );
    }

    #[test]
    fn test_refresh_delay_short_ttl() {
        let margin = Duration::from_secs(300);
        assert_eq!(
            refresh_delay(Duration::from_secs(60), margin),
            Duration::from_secs(30)
        );
        assert_eq!(
            refresh_delay(Duration::from_secs(400), margin),
            Duration::from_secs(200)
        );
    }

    #[test]
    fn test_refresh_delay_never_zero() {
        let margin = Duration::from_secs(300);
        assert_eq!(refresh_delay(Duration::ZERO, margin), MIN_REFRESH_INTERVAL);
        assert_eq!(
            refresh_delay(Duration::from_millis(500), margin),
            MIN_REFRESH_INTERVAL
        );
    }
}
