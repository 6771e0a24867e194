//! Identify protocol.
//!
//! Every new connection is identified from both ends: each side opens an
//! identify stream and the other answers with its protocol list and listen
//! addresses. When a host registers or removes a handler later it pushes the
//! updated list to connected peers over the push protocol. Results land in
//! the peer store and are published as [`HostEvent::PeerIdentified`].

use crate::codec::{read_message, write_message};
use crate::connection::{Connection, StreamOptions};
use crate::error::ConnectionError;
use crate::event::HostEvent;
use crate::host::Host;
use crate::multiaddr::Multiaddr;
use crate::registrar::HandlerOptions;
use crate::stream::{Direction, Stream};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Identify protocol id
pub const IDENTIFY_PROTOCOL: &str = "/ferry/id/1.0.0";

/// Identify push protocol id
pub const IDENTIFY_PUSH_PROTOCOL: &str = "/ferry/id/push/1.0.0";

const MAX_IDENTIFY_MESSAGE: usize = 8 * 1024;
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// What a peer says about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyInfo {
    /// Protocols the peer handles
    pub protocols: Vec<String>,
    /// Addresses the peer listens on
    pub listen_addrs: Vec<Multiaddr>,
}

impl IdentifyInfo {
    fn local(host: &Host) -> Self {
        Self {
            protocols: host.registrar().protocols(),
            listen_addrs: host.addresses(),
        }
    }
}

pub(crate) fn register(host: &Host) {
    let weak = host.downgrade();
    host.registrar().handle(
        IDENTIFY_PROTOCOL,
        Arc::new(move |mut stream: Stream, _connection: Connection| {
            let weak = weak.clone();
            async move {
                let Some(host) = weak.upgrade() else { return };
                let info = IdentifyInfo::local(&host);
                if let Err(e) = write_message(&mut stream, &info, MAX_IDENTIFY_MESSAGE).await {
                    tracing::debug!("Failed to answer identify: {}", e);
                    return;
                }
                let _ = stream.shutdown().await;
            }
        }),
        HandlerOptions::transient(),
    );

    let weak = host.downgrade();
    host.registrar().handle(
        IDENTIFY_PUSH_PROTOCOL,
        Arc::new(move |mut stream: Stream, connection: Connection| {
            let weak = weak.clone();
            async move {
                let Some(host) = weak.upgrade() else { return };
                let read = read_message::<_, IdentifyInfo>(&mut stream, MAX_IDENTIFY_MESSAGE);
                match tokio::time::timeout(IDENTIFY_TIMEOUT, read).await {
                    Ok(Ok(info)) => record(&host, &connection, info),
                    Ok(Err(e)) => {
                        tracing::debug!(
                            "Bad identify push from {}: {}",
                            connection.remote_peer().short(),
                            e
                        );
                    }
                    Err(_) => {
                        tracing::debug!(
                            "Identify push from {} timed out",
                            connection.remote_peer().short()
                        );
                    }
                }
            }
        }),
        HandlerOptions::transient(),
    );
}

/// Identify the remote end of `connection`
pub(crate) async fn identify(host: Host, connection: Connection) {
    let peer = connection.remote_peer();
    let info = match tokio::time::timeout(IDENTIFY_TIMEOUT, request(&connection)).await {
        Ok(Ok(info)) => info,
        Ok(Err(e)) => {
            tracing::debug!("Identify with {} failed: {}", peer.short(), e);
            return;
        }
        Err(_) => {
            tracing::debug!("Identify with {} timed out", peer.short());
            return;
        }
    };

    if !connection.is_transient() && connection.direction() == Direction::Outbound {
        host.peer_store()
            .add_addrs(peer, [connection.remote_addr().clone()]);
    }
    record(&host, &connection, info);
}

/// Push our current identify information over each of `connections`
pub(crate) async fn push(host: Host, connections: Vec<Connection>) {
    let info = IdentifyInfo::local(&host);
    let mut pushes = tokio::task::JoinSet::new();
    for connection in connections {
        pushes.spawn(push_one(connection, info.clone()));
    }
    while pushes.join_next().await.is_some() {}
}

async fn push_one(connection: Connection, info: IdentifyInfo) {
    let peer = connection.remote_peer();
    let send = async {
        let mut stream = connection
            .new_stream(IDENTIFY_PUSH_PROTOCOL, StreamOptions::transient())
            .await?;
        write_message(&mut stream, &info, MAX_IDENTIFY_MESSAGE).await?;
        let _ = stream.shutdown().await;
        Ok::<_, ConnectionError>(())
    };
    match tokio::time::timeout(IDENTIFY_TIMEOUT, send).await {
        Ok(Ok(())) => tracing::trace!("Pushed identify to {}", peer.short()),
        Ok(Err(e)) => tracing::debug!("Identify push to {} failed: {}", peer.short(), e),
        Err(_) => tracing::debug!("Identify push to {} timed out", peer.short()),
    }
}

/// Store what `connection`'s remote told us and publish it
fn record(host: &Host, connection: &Connection, info: IdentifyInfo) {
    let peer = connection.remote_peer();
    let store = host.peer_store();
    store.add_addrs(peer, info.listen_addrs.iter().cloned());
    store.set_protocols(peer, info.protocols.clone());

    tracing::trace!(
        "Identified {}: {} protocols, {} addrs",
        peer.short(),
        info.protocols.len(),
        info.listen_addrs.len()
    );

    host.emit(HostEvent::PeerIdentified {
        peer,
        protocols: info.protocols,
        listen_addrs: info.listen_addrs,
        transient: connection.is_transient(),
    });
}

async fn request(connection: &Connection) -> Result<IdentifyInfo, ConnectionError> {
    let mut stream = connection
        .new_stream(IDENTIFY_PROTOCOL, StreamOptions::transient())
        .await?;
    Ok(read_message(&mut stream, MAX_IDENTIFY_MESSAGE).await?)
}
