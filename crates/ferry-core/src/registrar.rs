//! Protocol handler registry.

use crate::connection::Connection;
use crate::stream::Stream;
use async_trait::async_trait;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;

/// Handles inbound streams for one protocol
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    /// Serve a stream the remote opened on `connection`
    async fn handle(&self, stream: Stream, connection: Connection);
}

#[async_trait]
impl<F, Fut> StreamHandler for F
where
    F: Fn(Stream, Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, stream: Stream, connection: Connection) {
        (self)(stream, connection).await;
    }
}

/// Registration options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerOptions {
    /// Accept streams arriving over transient connections
    pub allow_transient: bool,
}

impl HandlerOptions {
    /// Options accepting transient connections
    #[must_use]
    pub fn transient() -> Self {
        Self {
            allow_transient: true,
        }
    }
}

#[derive(Clone)]
struct Registration {
    handler: Arc<dyn StreamHandler>,
    options: HandlerOptions,
}

/// Maps protocol names to handlers
#[derive(Default)]
pub struct Registrar {
    handlers: DashMap<String, Registration>,
}

impl Registrar {
    /// Create an empty registrar
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `protocol`, replacing any previous one
    pub fn handle(&self, protocol: &str, handler: Arc<dyn StreamHandler>, options: HandlerOptions) {
        let previous = self
            .handlers
            .insert(protocol.to_string(), Registration { handler, options });
        if previous.is_some() {
            tracing::debug!("Replaced handler for {}", protocol);
        }
    }

    /// Remove the handler for `protocol`
    pub fn unhandle(&self, protocol: &str) -> bool {
        self.handlers.remove(protocol).is_some()
    }

    /// Handler and options for `protocol`
    #[must_use]
    pub fn lookup(&self, protocol: &str) -> Option<(Arc<dyn StreamHandler>, HandlerOptions)> {
        self.handlers
            .get(protocol)
            .map(|r| (r.handler.clone(), r.options))
    }

    /// Registered protocols, sorted
    #[must_use]
    pub fn protocols(&self) -> Vec<String> {
        let mut protocols: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        protocols.sort();
        protocols
    }
}

impl std::fmt::Debug for Registrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registrar")
            .field("protocols", &self.protocols())
            .finish()
    }
}
