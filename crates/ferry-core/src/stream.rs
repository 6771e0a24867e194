//! Protocol streams.

use dashmap::DashMap;
use std::io;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

/// Direction a stream or connection was opened in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Opened by the remote
    Inbound,
    /// Opened locally
    Outbound,
}

/// Metadata about a live stream, kept in its connection's registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// Negotiated protocol
    pub protocol: String,
    /// Who opened the stream
    pub direction: Direction,
}

pub(crate) type StreamRegistry = DashMap<u64, StreamInfo>;

/// A bidirectional byte stream for a single protocol on a connection
///
/// Dropping the stream closes it in both directions and removes it from the
/// connection's stream list.
pub struct Stream {
    io: DuplexStream,
    protocol: String,
    direction: Direction,
    id: u64,
    registry: Weak<StreamRegistry>,
}

impl Stream {
    pub(crate) fn new(
        io: DuplexStream,
        protocol: String,
        direction: Direction,
        id: u64,
        registry: Weak<StreamRegistry>,
    ) -> Self {
        Self {
            io,
            protocol,
            direction,
            id,
            registry,
        }
    }

    /// Protocol this stream speaks
    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Who opened the stream
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("direction", &self.direction)
            .finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}
