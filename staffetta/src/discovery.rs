//! Defines the interface the [`EndpointRegistry`](crate::EndpointRegistry)
//! requires in order to learn which server instances currently back a given
//! service.

use crate::ServiceName;
use futures::Stream;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::pin::Pin;

/// A change to the registered endpoint set of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointEvent {
    /// A server instance registered itself (or was re-observed).
    Added(SocketAddr),
    /// A server instance deregistered or its registration expired.
    Removed(SocketAddr),
}

/// Stream of endpoint changes produced by a watch-capable backend.
///
/// An `Err` item means the watch broke and the registry should fall back to
/// a fresh snapshot; the stream is not consumed further after that.
pub type EndpointStream = Pin<Box<dyn Stream<Item = Result<EndpointEvent, anyhow::Error>> + Send>>;

/// Interface that provides the current set of endpoints registered under a
/// service name, and optionally a live stream of changes to it.
#[async_trait::async_trait]
pub trait ServiceDiscovery {
    /// Return the unique [`SocketAddr`]s currently registered for `service`.
    /// If no endpoints are registered, an empty `HashSet` is returned.
    async fn snapshot(&self, service: &ServiceName) -> Result<HashSet<SocketAddr>, anyhow::Error>;

    /// Open a stream of [`EndpointEvent`]s for `service`.
    ///
    /// Backends without watch semantics return `Ok(None)`; the registry then
    /// falls back to polling [`snapshot`](Self::snapshot) periodically.
    async fn watch(&self, service: &ServiceName) -> Result<Option<EndpointStream>, anyhow::Error> {
        let _ = service;
        Ok(None)
    }
}
