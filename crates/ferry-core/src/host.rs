//! The local host.
//!
//! A [`Host`] owns the identity, the transports, the protocol registrar, the
//! peer store and the table of live connections. It is a cheap clonable
//! handle; background tasks hold a [`WeakHost`] so that dropping the last
//! handle tears everything down.

use crate::connection::{Connection, ConnectionKind, StreamOptions};
use crate::error::TransportError;
use crate::event::{EVENT_CHANNEL_CAPACITY, HostEvent};
use crate::identify;
use crate::identity::{Keypair, PeerId};
use crate::multiaddr::Multiaddr;
use crate::mux::InboundStream;
use crate::peer_store::PeerStore;
use crate::registrar::{HandlerOptions, Registrar, StreamHandler};
use crate::stream::Stream;
use crate::transport::{DialOptions, Listener, Transport, TransportResult};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;

/// Builder for [`Host`]
#[derive(Default)]
pub struct HostBuilder {
    keypair: Option<Keypair>,
    transports: Vec<Arc<dyn Transport>>,
    identify_transient: bool,
}

impl HostBuilder {
    /// Use a specific identity (random otherwise)
    #[must_use]
    pub fn keypair(mut self, keypair: Keypair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    /// Add a transport; earlier transports win when several accept an address
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    /// Also run identify over transient connections
    ///
    /// Off by default: identify traffic would count against the relay's
    /// data limit.
    #[must_use]
    pub fn identify_transient(mut self, enabled: bool) -> Self {
        self.identify_transient = enabled;
        self
    }

    /// Build the host (not yet started)
    #[must_use]
    pub fn build(self) -> Host {
        let keypair = self.keypair.unwrap_or_else(Keypair::generate);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Host {
            inner: Arc::new(HostInner {
                peer_id: keypair.peer_id(),
                keypair,
                registrar: Registrar::new(),
                peer_store: PeerStore::with_events(events.clone()),
                transports: self.transports,
                connections: DashMap::new(),
                listeners: DashMap::new(),
                next_listener: AtomicU64::new(0),
                advertised: Mutex::new(Vec::new()),
                events,
                running: AtomicBool::new(false),
                identify_transient: self.identify_transient,
            }),
        }
    }
}

struct HostInner {
    keypair: Keypair,
    peer_id: PeerId,
    registrar: Registrar,
    peer_store: PeerStore,
    transports: Vec<Arc<dyn Transport>>,
    connections: DashMap<PeerId, Vec<Connection>>,
    listeners: DashMap<u64, Arc<dyn Listener>>,
    next_listener: AtomicU64,
    advertised: Mutex<Vec<Multiaddr>>,
    events: broadcast::Sender<HostEvent>,
    running: AtomicBool,
    identify_transient: bool,
}

/// Handle to the local host
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

/// Non-owning handle to a [`Host`]
#[derive(Clone)]
pub struct WeakHost {
    inner: Weak<HostInner>,
}

impl WeakHost {
    /// Upgrade to a strong handle if the host still exists
    #[must_use]
    pub fn upgrade(&self) -> Option<Host> {
        self.inner.upgrade().map(|inner| Host { inner })
    }
}

impl Host {
    /// Start building a host
    #[must_use]
    pub fn builder() -> HostBuilder {
        HostBuilder::default()
    }

    /// Local peer id
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    /// Local identity
    #[must_use]
    pub fn keypair(&self) -> &Keypair {
        &self.inner.keypair
    }

    /// Protocol registrar
    #[must_use]
    pub fn registrar(&self) -> &Registrar {
        &self.inner.registrar
    }

    /// Peer store
    #[must_use]
    pub fn peer_store(&self) -> &PeerStore {
        &self.inner.peer_store
    }

    /// Non-owning handle for background tasks
    #[must_use]
    pub fn downgrade(&self) -> WeakHost {
        WeakHost {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Subscribe to host events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.inner.events.subscribe()
    }

    /// Publish an event to subscribers
    pub fn emit(&self, event: HostEvent) {
        // No subscribers is not an error
        let _ = self.inner.events.send(event);
    }

    /// Whether the host is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start the host and its transports
    ///
    /// # Errors
    ///
    /// Returns the first transport start failure.
    pub async fn start(&self) -> TransportResult<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        identify::register(self);
        for transport in &self.inner.transports {
            transport.start(self).await?;
        }

        tracing::info!("Host {} started", self.inner.peer_id.short());
        Ok(())
    }

    /// Stop listening, close every connection and stop transports
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        for transport in &self.inner.transports {
            transport.stop().await;
        }

        let listeners: Vec<Arc<dyn Listener>> = self
            .inner
            .listeners
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.inner.listeners.clear();
        for listener in listeners {
            listener.close().await;
        }

        for connection in self.all_connections() {
            connection.close();
        }

        self.notify_addresses_changed();
        tracing::info!("Host {} stopped", self.inner.peer_id.short());
    }

    /// Listen on each of `addrs`
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NoTransport`] if no transport accepts an
    /// address, or the transport's own listen error.
    pub async fn listen(&self, addrs: &[Multiaddr]) -> TransportResult<()> {
        if !self.is_running() {
            return Err(TransportError::NotRunning);
        }

        for addr in addrs {
            let transport = self
                .inner
                .transports
                .iter()
                .find(|t| t.can_listen(addr))
                .ok_or_else(|| TransportError::NoTransport(addr.clone()))?;
            let listener = transport.listen(self, addr).await?;
            self.add_listener(listener);
        }

        self.notify_addresses_changed();
        Ok(())
    }

    /// Track a listener created outside [`Host::listen`]
    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.insert(id, listener);
    }

    /// Addresses this host is reachable on, each ending in `/p2p/<self>`
    #[must_use]
    pub fn addresses(&self) -> Vec<Multiaddr> {
        let mut ids: Vec<u64> = self.inner.listeners.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();

        let mut addrs = Vec::new();
        for id in ids {
            let Some(listener) = self.inner.listeners.get(&id).map(|l| l.value().clone()) else {
                continue;
            };
            for addr in listener.addrs() {
                let addr = addr.with_peer_id(self.inner.peer_id);
                if !addrs.contains(&addr) {
                    addrs.push(addr);
                }
            }
        }
        addrs
    }

    /// Re-read listener addresses and publish a change event if they moved
    pub fn notify_addresses_changed(&self) {
        let current = self.addresses();
        let Ok(mut advertised) = self.inner.advertised.lock() else {
            return;
        };
        if *advertised == current {
            return;
        }
        *advertised = current.clone();
        drop(advertised);

        tracing::debug!("Self addresses changed: {} addrs", current.len());
        self.emit(HostEvent::SelfAddressesChanged(current));
    }

    /// Register a protocol handler
    ///
    /// Connected peers are told about the new protocol with an identify push.
    pub fn handle(&self, protocol: &str, handler: Arc<dyn StreamHandler>, options: HandlerOptions) {
        self.inner.registrar.handle(protocol, handler, options);
        self.push_identify();
    }

    /// Remove a protocol handler
    ///
    /// Connected peers are told with an identify push.
    pub fn unhandle(&self, protocol: &str) -> bool {
        let removed = self.inner.registrar.unhandle(protocol);
        if removed {
            self.push_identify();
        }
        removed
    }

    /// Send our current protocols and addresses to every connected peer
    fn push_identify(&self) {
        if !self.is_running() {
            return;
        }
        let connections: Vec<Connection> = self
            .all_connections()
            .into_iter()
            .filter(|c| !c.is_transient() || self.inner.identify_transient)
            .collect();
        if connections.is_empty() {
            return;
        }
        tokio::spawn(identify::push(self.clone(), connections));
    }

    /// Dial `addr`, reusing an open connection to the named peer
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotRunning`], [`TransportError::NoTransport`]
    /// or the transport's dial error.
    pub async fn dial(&self, addr: &Multiaddr) -> TransportResult<Connection> {
        self.dial_with(addr, DialOptions::default()).await
    }

    /// Dial `addr` with explicit options
    ///
    /// # Errors
    ///
    /// See [`Host::dial`].
    pub async fn dial_with(&self, addr: &Multiaddr, options: DialOptions) -> TransportResult<Connection> {
        if !self.is_running() {
            return Err(TransportError::NotRunning);
        }

        let options = DialOptions {
            peer: addr.peer_id().or(options.peer),
        };
        if let Some(existing) = options.peer.and_then(|peer| self.connection(&peer)) {
            return Ok(existing);
        }

        let transport = self
            .inner
            .transports
            .iter()
            .find(|t| t.can_dial(addr))
            .ok_or_else(|| TransportError::NoTransport(addr.clone()))?;

        tracing::debug!("Dialing {} via {}", addr, transport.name());
        let connection = transport.dial(self, addr, options).await?;
        self.register_connection(connection.clone());
        Ok(connection)
    }

    /// Connect to `peer` using an open connection or its stored addresses
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NoAddresses`] if nothing is known about the
    /// peer, or the last dial error.
    pub async fn dial_peer(&self, peer: PeerId) -> TransportResult<Connection> {
        if let Some(existing) = self.connection(&peer) {
            return Ok(existing);
        }

        let mut last_error = None;
        for addr in self.inner.peer_store.addrs(&peer) {
            match self.dial(&addr.with_peer_id(peer)).await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    tracing::debug!("Dial {} via {} failed: {}", peer.short(), addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| TransportError::NoAddresses(peer.to_string())))
    }

    /// Dial `addr` and open a stream for `protocol`
    ///
    /// # Errors
    ///
    /// Returns dial errors or stream errors, including the transient gate.
    pub async fn dial_protocol(
        &self,
        addr: &Multiaddr,
        protocol: &str,
        options: StreamOptions,
    ) -> TransportResult<Stream> {
        let connection = self.dial(addr).await?;
        Ok(connection.new_stream(protocol, options).await?)
    }

    /// Open a stream for `protocol` to a connected or known peer
    ///
    /// # Errors
    ///
    /// See [`Host::dial_peer`] and [`Connection::new_stream`].
    pub async fn new_stream(
        &self,
        peer: PeerId,
        protocol: &str,
        options: StreamOptions,
    ) -> TransportResult<Stream> {
        let connection = self.dial_peer(peer).await?;
        Ok(connection.new_stream(protocol, options).await?)
    }

    /// Open connections to `peer`
    #[must_use]
    pub fn connections(&self, peer: &PeerId) -> Vec<Connection> {
        self.inner
            .connections
            .get(peer)
            .map(|list| list.iter().filter(|c| !c.is_closed()).cloned().collect())
            .unwrap_or_default()
    }

    /// Best open connection to `peer`, preferring direct ones
    #[must_use]
    pub fn connection(&self, peer: &PeerId) -> Option<Connection> {
        let connections = self.connections(peer);
        connections
            .iter()
            .find(|c| c.kind() == ConnectionKind::Direct)
            .or_else(|| connections.first())
            .cloned()
    }

    /// All open connections
    #[must_use]
    pub fn all_connections(&self) -> Vec<Connection> {
        self.inner
            .connections
            .iter()
            .flat_map(|entry| entry.value().clone())
            .filter(|c| !c.is_closed())
            .collect()
    }

    /// Whether at least one open connection to `peer` exists
    #[must_use]
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        !self.connections(peer).is_empty()
    }

    /// Close every connection to `peer`
    pub async fn hang_up(&self, peer: &PeerId) {
        for connection in self.connections(peer) {
            connection.close();
            connection.closed().await;
        }
    }

    /// Adopt an established connection: dispatch its inbound streams, watch
    /// for closure and identify the remote
    pub fn register_connection(&self, connection: Connection) {
        if !self.is_running() {
            connection.close();
            return;
        }

        let peer = connection.remote_peer();
        let first = {
            let mut list = self.inner.connections.entry(peer).or_default();
            if list.contains(&connection) {
                return;
            }
            list.push(connection.clone());
            list.len() == 1
        };

        tracing::debug!(
            "Connection {} to {} opened ({:?})",
            connection.id(),
            peer.short(),
            connection.kind()
        );
        self.emit(HostEvent::ConnectionOpened {
            peer,
            connection: connection.id(),
            kind: connection.kind(),
        });
        if first {
            self.emit(HostEvent::PeerConnected(peer));
        }

        if let Some(mut inbound) = connection.take_inbound() {
            let weak = self.downgrade();
            let conn = connection.clone();
            tokio::spawn(async move {
                while let Some(pending) = inbound.recv().await {
                    let Some(host) = weak.upgrade() else { break };
                    host.dispatch(&conn, pending);
                }
            });
        }

        let weak = self.downgrade();
        let conn = connection.clone();
        tokio::spawn(async move {
            conn.closed().await;
            if let Some(host) = weak.upgrade() {
                host.on_connection_closed(&conn);
            }
        });

        if !connection.is_transient() || self.inner.identify_transient {
            tokio::spawn(identify::identify(self.clone(), connection));
        }
    }

    fn dispatch(&self, connection: &Connection, pending: InboundStream) {
        let protocol = pending.protocol().to_string();
        let Some((handler, options)) = self.inner.registrar.lookup(&protocol) else {
            tracing::trace!("No handler for {} from {}", protocol, connection.remote_peer().short());
            pending.reject_unsupported();
            return;
        };

        match connection.accept_inbound(pending, options.allow_transient) {
            Ok(stream) => {
                let connection = connection.clone();
                tokio::spawn(async move {
                    handler.handle(stream, connection).await;
                });
            }
            Err(e) => {
                tracing::debug!(
                    "Refused inbound {} from {}: {}",
                    protocol,
                    connection.remote_peer().short(),
                    e
                );
            }
        }
    }

    fn on_connection_closed(&self, connection: &Connection) {
        let peer = connection.remote_peer();
        // Other closed connections report their own closure
        let last = match self.inner.connections.get_mut(&peer) {
            Some(mut list) => {
                let Some(position) = list.iter().position(|c| c == connection) else {
                    return;
                };
                list.remove(position);
                list.is_empty()
            }
            None => return,
        };
        if last {
            self.inner
                .connections
                .remove_if(&peer, |_, list| list.is_empty());
        }

        tracing::debug!("Connection {} to {} closed", connection.id(), peer.short());
        self.emit(HostEvent::ConnectionClosed {
            peer,
            connection: connection.id(),
            kind: connection.kind(),
        });
        if last {
            self.emit(HostEvent::PeerDisconnected(peer));
        }
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("peer_id", &self.inner.peer_id)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryNetwork, MemoryTransport};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn host(network: &MemoryNetwork) -> Host {
        let host = Host::builder()
            .transport(Arc::new(MemoryTransport::new(network.clone())))
            .build();
        host.start().await.unwrap();
        host.listen(&["/memory/0".parse().unwrap()]).await.unwrap();
        host
    }

    async fn next_matching<F>(events: &mut broadcast::Receiver<HostEvent>, mut f: F) -> HostEvent
    where
        F: FnMut(&HostEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.unwrap();
                if f(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_dial_and_echo() {
        let network = MemoryNetwork::new();
        let a = host(&network).await;
        let b = host(&network).await;

        b.handle(
            "/echo/1.0.0",
            Arc::new(|mut stream: Stream, _conn: Connection| async move {
                let mut buf = vec![0u8; 4];
                if stream.read_exact(&mut buf).await.is_ok() {
                    let _ = stream.write_all(&buf).await;
                }
            }),
            HandlerOptions::default(),
        );

        let mut stream = a
            .dial_protocol(&b.addresses()[0], "/echo/1.0.0", StreamOptions::default())
            .await
            .unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert!(a.is_connected(&b.peer_id()));
    }

    #[tokio::test]
    async fn test_dial_reuses_connection() {
        let network = MemoryNetwork::new();
        let a = host(&network).await;
        let b = host(&network).await;

        let first = a.dial(&b.addresses()[0]).await.unwrap();
        let second = a.dial(&b.addresses()[0]).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(a.connections(&b.peer_id()).len(), 1);
    }

    #[tokio::test]
    async fn test_dial_unbound_port_refused() {
        let network = MemoryNetwork::new();
        let a = host(&network).await;
        let err = a.dial(&"/memory/999".parse().unwrap()).await.unwrap_err();
        assert_eq!(err.code(), "ERR_CONNECTION_REFUSED");
    }

    #[tokio::test]
    async fn test_identify_populates_peer_store() {
        let network = MemoryNetwork::new();
        let a = host(&network).await;
        let b = host(&network).await;
        b.handle(
            "/custom/1.0.0",
            Arc::new(|_stream: Stream, _conn: Connection| async {}),
            HandlerOptions::default(),
        );

        let mut events = a.subscribe();
        a.dial(&b.addresses()[0]).await.unwrap();

        let event = next_matching(&mut events, |e| matches!(e, HostEvent::PeerIdentified { .. })).await;
        let HostEvent::PeerIdentified { peer, protocols, .. } = event else {
            unreachable!()
        };
        assert_eq!(peer, b.peer_id());
        assert!(protocols.contains(&"/custom/1.0.0".to_string()));
        assert!(a.peer_store().supports(&b.peer_id(), "/custom/1.0.0"));
        assert!(!a.peer_store().addrs(&b.peer_id()).is_empty());
    }

    #[tokio::test]
    async fn test_hang_up_emits_disconnect() {
        let network = MemoryNetwork::new();
        let a = host(&network).await;
        let b = host(&network).await;
        let mut events = b.subscribe();

        a.dial(&b.addresses()[0]).await.unwrap();
        next_matching(&mut events, |e| *e == HostEvent::PeerConnected(a.peer_id())).await;

        a.hang_up(&b.peer_id()).await;
        next_matching(&mut events, |e| *e == HostEvent::PeerDisconnected(a.peer_id())).await;
        assert!(!b.is_connected(&a.peer_id()));
    }

    #[tokio::test]
    async fn test_stop_refuses_dials() {
        let network = MemoryNetwork::new();
        let a = host(&network).await;
        let addr = a.addresses()[0].clone();
        a.stop().await;

        assert!(a.addresses().is_empty());
        let b = host(&network).await;
        let err = b.dial(&addr).await.unwrap_err();
        assert_eq!(err.code(), "ERR_CONNECTION_REFUSED");
        assert!(matches!(a.dial(&addr).await, Err(TransportError::NotRunning)));
    }

    #[tokio::test]
    async fn test_handler_changes_reach_connected_peers() {
        let network = MemoryNetwork::new();
        let a = host(&network).await;
        let b = host(&network).await;
        let mut events = a.subscribe();

        a.dial(&b.addresses()[0]).await.unwrap();
        next_matching(&mut events, |e| matches!(e, HostEvent::PeerIdentified { .. })).await;
        assert!(!a.peer_store().supports(&b.peer_id(), "/late/1.0.0"));

        b.handle(
            "/late/1.0.0",
            Arc::new(|_stream: Stream, _conn: Connection| async {}),
            HandlerOptions::default(),
        );
        next_matching(&mut events, |e| {
            matches!(e, HostEvent::PeerProtocolsChanged { peer, protocols }
                if *peer == b.peer_id() && protocols.iter().any(|p| p == "/late/1.0.0"))
        })
        .await;
        assert!(a.peer_store().supports(&b.peer_id(), "/late/1.0.0"));

        assert!(b.unhandle("/late/1.0.0"));
        next_matching(&mut events, |e| {
            matches!(e, HostEvent::PeerProtocolsChanged { peer, protocols }
                if *peer == b.peer_id() && !protocols.iter().any(|p| p == "/late/1.0.0"))
        })
        .await;
        assert!(!a.peer_store().supports(&b.peer_id(), "/late/1.0.0"));
    }

    #[tokio::test]
    async fn test_every_closed_connection_is_reported() {
        let network = MemoryNetwork::new();
        let a = host(&network).await;
        let b = host(&network).await;
        let transport = MemoryTransport::new(network.clone());
        let mut events = a.subscribe();

        let first = transport
            .dial(&a, &b.addresses()[0], DialOptions::default())
            .await
            .unwrap();
        let second = transport
            .dial(&a, &b.addresses()[0], DialOptions::default())
            .await
            .unwrap();
        a.register_connection(first.clone());
        a.register_connection(second.clone());
        assert_eq!(a.connections(&b.peer_id()).len(), 2);

        first.close();
        second.close();

        let mut closed = Vec::new();
        while closed.len() < 2 {
            let event =
                next_matching(&mut events, |e| matches!(e, HostEvent::ConnectionClosed { .. }))
                    .await;
            if let HostEvent::ConnectionClosed { connection, .. } = event {
                closed.push(connection);
            }
        }
        closed.sort();
        let mut expected = vec![first.id(), second.id()];
        expected.sort();
        assert_eq!(closed, expected);

        next_matching(&mut events, |e| *e == HostEvent::PeerDisconnected(b.peer_id())).await;
        assert!(!a.is_connected(&b.peer_id()));
    }
}
