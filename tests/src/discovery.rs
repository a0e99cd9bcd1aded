//! An in-memory [`ServiceDiscovery`] backend with watch support, mimicking
//! a coordination store that can be updated (and broken) from tests.

use parking_lot::Mutex;
use staffetta::{EndpointEvent, EndpointStream, ServiceDiscovery, ServiceName};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

struct Inner {
    endpoints: Mutex<HashSet<SocketAddr>>,
    events: tokio::sync::broadcast::Sender<EndpointEvent>,
    available: AtomicBool,
    watchable: bool,
}

/// Shared-state discovery fake: cloning yields a handle onto the same
/// endpoint set, so tests mutate it while a registry watches it.
#[derive(Clone)]
pub struct InMemoryDiscovery {
    inner: Arc<Inner>,
}

impl InMemoryDiscovery {
    /// A watch-capable backend, like etcd.
    pub fn new() -> Self {
        Self::with_watch_support(true)
    }

    /// A snapshot-only backend, like DNS: the registry has to poll it.
    pub fn poll_only() -> Self {
        Self::with_watch_support(false)
    }

    fn with_watch_support(watchable: bool) -> Self {
        let (events, _) = tokio::sync::broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                endpoints: Mutex::new(HashSet::new()),
                events,
                available: AtomicBool::new(true),
                watchable,
            }),
        }
    }

    pub fn add(&self, addr: SocketAddr) {
        if self.inner.endpoints.lock().insert(addr) {
            let _ = self.inner.events.send(EndpointEvent::Added(addr));
        }
    }

    pub fn remove(&self, addr: SocketAddr) {
        if self.inner.endpoints.lock().remove(&addr) {
            let _ = self.inner.events.send(EndpointEvent::Removed(addr));
        }
    }

    /// Simulate a coordination store outage (or recovery).
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }
}

impl Default for InMemoryDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ServiceDiscovery for InMemoryDiscovery {
    async fn snapshot(&self, _service: &ServiceName) -> Result<HashSet<SocketAddr>, anyhow::Error> {
        if !self.inner.available.load(Ordering::SeqCst) {
            anyhow::bail!("coordination store down");
        }
        Ok(self.inner.endpoints.lock().clone())
    }

    async fn watch(&self, _service: &ServiceName) -> Result<Option<EndpointStream>, anyhow::Error> {
        if !self.inner.watchable {
            return Ok(None);
        }
        if !self.inner.available.load(Ordering::SeqCst) {
            anyhow::bail!("coordination store down");
        }

        let events = BroadcastStream::new(self.inner.events.subscribe())
            .map(|event| event.map_err(anyhow::Error::from));
        Ok(Some(Box::pin(events)))
    }
}
