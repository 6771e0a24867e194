//! In-process transport.
//!
//! Hosts sharing a [`MemoryNetwork`] reach each other at `/memory/<port>`
//! addresses over in-memory pipes. Listening on port 0 allocates a fresh port.

use crate::connection::Connection;
use crate::error::TransportError;
use crate::host::Host;
use crate::multiaddr::{Multiaddr, Protocol};
use crate::transport::{DialOptions, Listener, Transport, TransportResult};
use crate::upgrade::{UpgradeOptions, upgrade_inbound, upgrade_outbound};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Buffer size of each in-memory pipe
const PIPE_BUFFER_SIZE: usize = 256 * 1024;

#[derive(Default)]
struct NetworkInner {
    listeners: DashMap<u64, mpsc::UnboundedSender<DuplexStream>>,
    next_port: AtomicU64,
    dial_attempts: AtomicU64,
}

/// A shared in-memory network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    /// Create an empty network
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total dial attempts made on this network
    #[must_use]
    pub fn dial_attempts(&self) -> u64 {
        self.inner.dial_attempts.load(Ordering::Relaxed)
    }

    /// Whether a listener is bound on `port`
    #[must_use]
    pub fn is_bound(&self, port: u64) -> bool {
        self.inner.listeners.contains_key(&port)
    }

    fn bind(&self, port: u64) -> TransportResult<(u64, mpsc::UnboundedReceiver<DuplexStream>)> {
        let port = if port == 0 {
            loop {
                let candidate = self.inner.next_port.fetch_add(1, Ordering::Relaxed) + 1;
                if !self.inner.listeners.contains_key(&candidate) {
                    break candidate;
                }
            }
        } else {
            port
        };

        let (tx, rx) = mpsc::unbounded_channel();
        match self.inner.listeners.entry(port) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(TransportError::InvalidAddress {
                addr: Protocol::Memory(port).into(),
                reason: "port already in use".into(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx);
                Ok((port, rx))
            }
        }
    }

    fn connect(&self, port: u64) -> Option<DuplexStream> {
        self.inner.dial_attempts.fetch_add(1, Ordering::Relaxed);
        let listener = self.inner.listeners.get(&port)?;
        let (local, remote) = tokio::io::duplex(PIPE_BUFFER_SIZE);
        listener.send(remote).ok()?;
        Some(local)
    }

    fn unbind(&self, port: u64) {
        self.inner.listeners.remove(&port);
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("listeners", &self.inner.listeners.len())
            .finish()
    }
}

fn memory_port(addr: &Multiaddr) -> Option<u64> {
    match addr.iter().next() {
        Some(Protocol::Memory(port)) => Some(*port),
        _ => None,
    }
}

/// Transport over a [`MemoryNetwork`]
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
}

impl MemoryTransport {
    /// Create a transport attached to `network`
    #[must_use]
    pub fn new(network: MemoryNetwork) -> Self {
        Self { network }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn can_dial(&self, addr: &Multiaddr) -> bool {
        !addr.is_circuit() && memory_port(addr).is_some()
    }

    fn can_listen(&self, addr: &Multiaddr) -> bool {
        self.can_dial(addr)
    }

    async fn dial(
        &self,
        host: &Host,
        addr: &Multiaddr,
        options: DialOptions,
    ) -> TransportResult<Connection> {
        let port = memory_port(addr).ok_or_else(|| TransportError::InvalidAddress {
            addr: addr.clone(),
            reason: "not a memory address".into(),
        })?;
        let io = self
            .network
            .connect(port)
            .ok_or_else(|| TransportError::ConnectionRefused(addr.clone()))?;

        let expected = options.peer.or_else(|| addr.peer_id());
        let upgrade = UpgradeOptions::direct(addr.without_peer_id()).expect_peer(expected);
        Ok(upgrade_outbound(io, host.keypair(), upgrade).await?)
    }

    async fn listen(&self, host: &Host, addr: &Multiaddr) -> TransportResult<Arc<dyn Listener>> {
        let requested = memory_port(addr).ok_or_else(|| TransportError::InvalidAddress {
            addr: addr.clone(),
            reason: "not a memory address".into(),
        })?;
        let (port, mut incoming) = self.network.bind(requested)?;
        let listen_addr: Multiaddr = Protocol::Memory(port).into();

        let weak = host.downgrade();
        let task = tokio::spawn(async move {
            while let Some(io) = incoming.recv().await {
                let Some(host) = weak.upgrade() else { break };
                tokio::spawn(async move {
                    let upgrade = UpgradeOptions::direct(Protocol::Memory(0).into());
                    match upgrade_inbound(io, host.keypair(), upgrade).await {
                        Ok(connection) => host.register_connection(connection),
                        Err(e) => tracing::debug!("Inbound memory upgrade failed: {}", e),
                    }
                });
            }
        });

        tracing::debug!("Listening on {}", listen_addr);

        Ok(Arc::new(MemoryListener {
            port,
            addr: listen_addr,
            network: self.network.clone(),
            task,
        }))
    }
}

/// Listener bound on a memory port
pub struct MemoryListener {
    port: u64,
    addr: Multiaddr,
    network: MemoryNetwork,
    task: JoinHandle<()>,
}

#[async_trait]
impl Listener for MemoryListener {
    fn addrs(&self) -> Vec<Multiaddr> {
        vec![self.addr.clone()]
    }

    async fn close(&self) {
        self.network.unbind(self.port);
        self.task.abort();
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.network.unbind(self.port);
        self.task.abort();
    }
}
