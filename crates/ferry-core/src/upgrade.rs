//! Turning raw byte pipes into authenticated, multiplexed connections.
//!
//! Both ends send a 4-byte magic followed by their Ed25519 public key. The
//! remote peer id is derived from the key; a dialer that knows whom it is
//! calling refuses a mismatching identity. The muxer then takes over the pipe.

use crate::connection::{Connection, ConnectionKind, ConnectionLimits, ConnectionParams};
use crate::error::{ConnectionError, Result};
use crate::identity::{Keypair, PeerId};
use crate::multiaddr::Multiaddr;
use crate::mux::{Muxer, Side};
use crate::stream::Direction;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const HANDSHAKE_MAGIC: &[u8; 4] = b"FRY1";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How an upgraded connection should be classified
#[derive(Debug, Clone)]
pub struct UpgradeOptions {
    /// Address the pipe was established through
    pub remote_addr: Multiaddr,
    /// Identity the dialer expects (outbound only)
    pub expected_peer: Option<PeerId>,
    /// Direct or transient
    pub kind: ConnectionKind,
    /// Limits for transient connections
    pub limits: Option<ConnectionLimits>,
}

impl UpgradeOptions {
    /// Direct connection through `remote_addr`
    #[must_use]
    pub fn direct(remote_addr: Multiaddr) -> Self {
        Self {
            remote_addr,
            expected_peer: None,
            kind: ConnectionKind::Direct,
            limits: None,
        }
    }

    /// Transient connection through `remote_addr` with `limits`
    #[must_use]
    pub fn transient(remote_addr: Multiaddr, limits: Option<ConnectionLimits>) -> Self {
        Self {
            remote_addr,
            expected_peer: None,
            kind: ConnectionKind::Transient,
            limits,
        }
    }

    /// Require the remote to present `peer`
    #[must_use]
    pub fn expect_peer(mut self, peer: Option<PeerId>) -> Self {
        self.expected_peer = peer;
        self
    }
}

/// Upgrade a pipe we opened
///
/// # Errors
///
/// Returns [`ConnectionError::Handshake`] or [`ConnectionError::Timeout`] if
/// the exchange fails, and [`ConnectionError::PeerMismatch`] if the remote is
/// not the expected peer.
pub async fn upgrade_outbound<T>(io: T, keypair: &Keypair, options: UpgradeOptions) -> Result<Connection>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    upgrade(io, keypair, options, Direction::Outbound).await
}

/// Upgrade a pipe the remote opened
///
/// # Errors
///
/// Returns [`ConnectionError::Handshake`] or [`ConnectionError::Timeout`] if
/// the exchange fails.
pub async fn upgrade_inbound<T>(io: T, keypair: &Keypair, options: UpgradeOptions) -> Result<Connection>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    upgrade(io, keypair, options.expect_peer(None), Direction::Inbound).await
}

async fn upgrade<T>(
    mut io: T,
    keypair: &Keypair,
    options: UpgradeOptions,
    direction: Direction,
) -> Result<Connection>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let remote_peer = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut io, keypair))
        .await
        .map_err(|_| ConnectionError::Timeout("identity handshake".into()))??;

    if let Some(expected) = options.expected_peer {
        if expected != remote_peer {
            return Err(ConnectionError::PeerMismatch {
                expected: expected.to_string(),
                actual: remote_peer.to_string(),
            });
        }
    }

    let side = match direction {
        Direction::Outbound => Side::Dialer,
        Direction::Inbound => Side::Listener,
    };
    let (muxer, inbound) = Muxer::new(io, side);

    tracing::debug!(
        "Upgraded {:?} {:?} connection with {} via {}",
        direction,
        options.kind,
        remote_peer.short(),
        options.remote_addr
    );

    Ok(Connection::new(
        muxer,
        inbound,
        ConnectionParams {
            remote_peer,
            remote_addr: options.remote_addr,
            direction,
            kind: options.kind,
            limits: options.limits,
        },
    ))
}

async fn handshake<T>(io: &mut T, keypair: &Keypair) -> Result<PeerId>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut hello = Vec::with_capacity(HANDSHAKE_MAGIC.len() + 32);
    hello.extend_from_slice(HANDSHAKE_MAGIC);
    hello.extend_from_slice(&keypair.public_key());
    io.write_all(&hello).await?;
    io.flush().await?;

    let mut magic = [0u8; 4];
    io.read_exact(&mut magic)
        .await
        .map_err(|_| ConnectionError::Handshake("remote closed during handshake".into()))?;
    if &magic != HANDSHAKE_MAGIC {
        return Err(ConnectionError::Handshake("unexpected handshake magic".into()));
    }

    let mut public_key = [0u8; 32];
    io.read_exact(&mut public_key)
        .await
        .map_err(|_| ConnectionError::Handshake("remote closed during handshake".into()))?;

    Ok(PeerId::from_public_key(&public_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upgrade_authenticates_both_sides() {
        let (a, b) = tokio::io::duplex(4096);
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let bob_id = bob.peer_id();
        let alice_id = alice.peer_id();

        let inbound = tokio::spawn(async move {
            upgrade_inbound(b, &bob, UpgradeOptions::direct(Multiaddr::empty()))
                .await
                .unwrap()
        });
        let outbound = upgrade_outbound(
            a,
            &alice,
            UpgradeOptions::direct(Multiaddr::empty()).expect_peer(Some(bob_id)),
        )
        .await
        .unwrap();
        let inbound = inbound.await.unwrap();

        assert_eq!(outbound.remote_peer(), bob_id);
        assert_eq!(inbound.remote_peer(), alice_id);
        assert_eq!(outbound.direction(), Direction::Outbound);
        assert_eq!(inbound.direction(), Direction::Inbound);
    }

    #[tokio::test]
    async fn test_upgrade_rejects_wrong_peer() {
        let (a, b) = tokio::io::duplex(4096);
        let bob = Keypair::generate();
        tokio::spawn(async move {
            let _ = upgrade_inbound(b, &bob, UpgradeOptions::direct(Multiaddr::empty())).await;
        });

        let err = upgrade_outbound(
            a,
            &Keypair::generate(),
            UpgradeOptions::direct(Multiaddr::empty()).expect_peer(Some(PeerId::random())),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "ERR_INVALID_PEER");
    }

    #[tokio::test]
    async fn test_upgrade_rejects_bad_magic() {
        let (a, mut b) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            b.write_all(&[0u8; 36]).await.unwrap();
            std::future::pending::<()>().await;
        });

        let err = upgrade_outbound(a, &Keypair::generate(), UpgradeOptions::direct(Multiaddr::empty()))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Handshake(_)));
    }

    #[tokio::test]
    async fn test_transient_classification() {
        let (a, b) = tokio::io::duplex(4096);
        let bob = Keypair::generate();
        let limits = ConnectionLimits {
            data: Some(1024),
            duration: Some(Duration::from_secs(5)),
        };
        tokio::spawn(async move {
            let _conn = upgrade_inbound(b, &bob, UpgradeOptions::direct(Multiaddr::empty())).await;
            std::future::pending::<()>().await;
        });

        let conn = upgrade_outbound(
            a,
            &Keypair::generate(),
            UpgradeOptions::transient(Multiaddr::empty(), Some(limits)),
        )
        .await
        .unwrap();
        assert!(conn.is_transient());
        assert_eq!(conn.limits(), Some(limits));
    }
}
