//! Connections between two peers.
//!
//! A [`Connection`] is a multiplexed pipe to one remote peer. It is either
//! [`ConnectionKind::Direct`] or [`ConnectionKind::Transient`]; transient
//! connections (relayed circuits) carry resource limits, and only protocols
//! that explicitly opt in may open streams over them, in either direction.

use crate::error::{ConnectionError, Result};
use crate::identity::PeerId;
use crate::multiaddr::Multiaddr;
use crate::mux::{InboundStream, InboundStreams, Muxer};
use crate::stream::{Direction, Stream, StreamInfo, StreamRegistry};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection classification used by the transient gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Unrestricted connection
    Direct,
    /// Limited, relayed connection
    Transient,
}

/// Informational limits attached to a transient connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionLimits {
    /// Maximum bytes the relay forwards per direction
    pub data: Option<u64>,
    /// Maximum lifetime of the connection
    pub duration: Option<Duration>,
}

/// Options for opening an outbound stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamOptions {
    /// Permit the stream over a transient connection
    pub allow_transient: bool,
}

impl StreamOptions {
    /// Options that permit transient connections
    #[must_use]
    pub fn transient() -> Self {
        Self {
            allow_transient: true,
        }
    }
}

/// Parameters fixed when a connection is established
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    /// Authenticated remote peer
    pub remote_peer: PeerId,
    /// Address the connection was made through
    pub remote_addr: Multiaddr,
    /// Who initiated the connection
    pub direction: Direction,
    /// Direct or transient
    pub kind: ConnectionKind,
    /// Limits for transient connections
    pub limits: Option<ConnectionLimits>,
}

struct ConnectionInner {
    id: ConnectionId,
    params: ConnectionParams,
    opened_at: Instant,
    muxer: Muxer,
    inbound: Mutex<Option<InboundStreams>>,
    streams: Arc<StreamRegistry>,
    next_stream: AtomicU64,
}

/// A multiplexed connection to a remote peer
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(muxer: Muxer, inbound: InboundStreams, params: ConnectionParams) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId::next(),
                params,
                opened_at: Instant::now(),
                muxer,
                inbound: Mutex::new(Some(inbound)),
                streams: Arc::new(StreamRegistry::new()),
                next_stream: AtomicU64::new(0),
            }),
        }
    }

    /// Connection id
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Remote peer
    #[must_use]
    pub fn remote_peer(&self) -> PeerId {
        self.inner.params.remote_peer
    }

    /// Remote address
    #[must_use]
    pub fn remote_addr(&self) -> &Multiaddr {
        &self.inner.params.remote_addr
    }

    /// Who initiated the connection
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.inner.params.direction
    }

    /// Direct or transient
    #[must_use]
    pub fn kind(&self) -> ConnectionKind {
        self.inner.params.kind
    }

    /// Whether this is a transient (limited) connection
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.inner.params.kind == ConnectionKind::Transient
    }

    /// Limits attached to a transient connection
    #[must_use]
    pub fn limits(&self) -> Option<ConnectionLimits> {
        self.inner.params.limits
    }

    /// Time since the connection was established
    #[must_use]
    pub fn age(&self) -> Duration {
        self.inner.opened_at.elapsed()
    }

    /// Transient gate: refuse `protocol` on a transient connection unless allowed
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::TransientConnection`] when the connection is
    /// transient and `allow_transient` is false.
    pub fn check_transient(&self, protocol: &str, allow_transient: bool) -> Result<()> {
        if self.is_transient() && !allow_transient {
            return Err(ConnectionError::TransientConnection {
                protocol: protocol.to_string(),
            });
        }
        Ok(())
    }

    /// Open a stream for `protocol`
    ///
    /// Fails before any bytes are sent if the transient gate refuses the
    /// protocol.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::TransientConnection`] from the gate, or any
    /// error from the remote's answer.
    pub async fn new_stream(&self, protocol: &str, options: StreamOptions) -> Result<Stream> {
        self.check_transient(protocol, options.allow_transient)?;
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let io = self.inner.muxer.open_stream(protocol).await?;
        Ok(self.track(io, protocol.to_string(), Direction::Outbound))
    }

    /// Accept a remotely opened stream, applying the transient gate
    pub(crate) fn accept_inbound(
        &self,
        pending: InboundStream,
        allow_transient: bool,
    ) -> Result<Stream> {
        let protocol = pending.protocol().to_string();
        if let Err(e) = self.check_transient(&protocol, allow_transient) {
            pending.reject_transient();
            return Err(e);
        }
        let io = pending.accept();
        Ok(self.track(io, protocol, Direction::Inbound))
    }

    fn track(&self, io: tokio::io::DuplexStream, protocol: String, direction: Direction) -> Stream {
        let id = self.inner.next_stream.fetch_add(1, Ordering::Relaxed);
        self.inner.streams.insert(
            id,
            StreamInfo {
                protocol: protocol.clone(),
                direction,
            },
        );
        Stream::new(io, protocol, direction, id, Arc::downgrade(&self.inner.streams))
    }

    /// Take the receiver of remotely opened streams (once)
    pub(crate) fn take_inbound(&self) -> Option<InboundStreams> {
        self.inner.inbound.lock().ok()?.take()
    }

    /// Live streams on this connection
    #[must_use]
    pub fn streams(&self) -> Vec<StreamInfo> {
        self.inner
            .streams
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Close the connection, resetting all streams
    pub fn close(&self) {
        if !self.inner.muxer.is_closed() {
            tracing::debug!(
                "Closing {} to {}",
                self.inner.id,
                self.inner.params.remote_peer.short()
            );
        }
        self.inner.muxer.close();
    }

    /// Whether the connection is closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.muxer.is_closed()
    }

    /// Resolve once the connection has closed, for any reason
    pub async fn closed(&self) {
        self.inner.muxer.closed().await;
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote_peer", &self.inner.params.remote_peer)
            .field("remote_addr", &self.inner.params.remote_addr)
            .field("kind", &self.inner.params.kind)
            .field("direction", &self.inner.params.direction)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::Side;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc::error::TryRecvError;

    fn params(peer: PeerId, kind: ConnectionKind, direction: Direction) -> ConnectionParams {
        ConnectionParams {
            remote_peer: peer,
            remote_addr: Multiaddr::empty(),
            direction,
            kind,
            limits: None,
        }
    }

    fn pair(kind: ConnectionKind) -> (Connection, Connection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (mux_a, in_a) = Muxer::new(a, Side::Dialer);
        let (mux_b, in_b) = Muxer::new(b, Side::Listener);
        (
            Connection::new(mux_a, in_a, params(PeerId::random(), kind, Direction::Outbound)),
            Connection::new(mux_b, in_b, params(PeerId::random(), kind, Direction::Inbound)),
        )
    }

    #[tokio::test]
    async fn test_outbound_gate_sends_nothing() {
        let (local, remote) = pair(ConnectionKind::Transient);
        let mut inbound = remote.take_inbound().unwrap();

        let err = local
            .new_stream("/echo/1.0.0", StreamOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ERR_TRANSIENT_CONNECTION");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(inbound.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_inbound_gate_rejects_unless_allowed() {
        let (local, remote) = pair(ConnectionKind::Transient);
        let mut inbound = remote.take_inbound().unwrap();

        let remote_side = remote.clone();
        tokio::spawn(async move {
            let first = inbound.recv().await.unwrap();
            assert!(remote_side.accept_inbound(first, false).is_err());

            let second = inbound.recv().await.unwrap();
            let mut stream = remote_side.accept_inbound(second, true).unwrap();
            stream.write_all(b"ok").await.unwrap();
        });

        let err = local
            .new_stream("/gated/1.0.0", StreamOptions::transient())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ERR_TRANSIENT_CONNECTION");

        let mut stream = local
            .new_stream("/open/1.0.0", StreamOptions::transient())
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[tokio::test]
    async fn test_direct_connection_ignores_gate() {
        let (local, _remote) = pair(ConnectionKind::Direct);
        assert!(local.check_transient("/echo/1.0.0", false).is_ok());
    }

    #[tokio::test]
    async fn test_stream_registry_tracks_drops() {
        let (local, remote) = pair(ConnectionKind::Direct);
        let mut inbound = remote.take_inbound().unwrap();
        tokio::spawn(async move {
            while let Some(pending) = inbound.recv().await {
                let _ = remote.accept_inbound(pending, false);
            }
        });

        let stream = local
            .new_stream("/a/1.0.0", StreamOptions::default())
            .await
            .unwrap();
        assert_eq!(local.streams().len(), 1);
        assert_eq!(local.streams()[0].protocol, "/a/1.0.0");

        drop(stream);
        assert!(local.streams().is_empty());
    }

    #[tokio::test]
    async fn test_close_propagates() {
        let (local, remote) = pair(ConnectionKind::Direct);
        local.close();
        tokio::time::timeout(Duration::from_secs(2), remote.closed())
            .await
            .unwrap();
        assert!(remote.is_closed());
    }
}
