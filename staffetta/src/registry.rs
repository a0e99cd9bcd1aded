//! Tracks the live endpoint set of a service by driving a
//! [`ServiceDiscovery`] backend from a dedicated background task.

use crate::{EndpointEvent, ServiceDiscovery, ServiceName};
use anyhow::Context as _;
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::{Duration, Instant};

// Determines the capacity of the channel used to fan endpoint changes out
// to subscribers (the health filter, tests). We set the number high to
// avoid dropping events during large snapshot diffs.
const ENDPOINT_EVENT_CHANNEL_SIZE: usize = 1024;

/// Tunables for the registry's background task.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How often the endpoint set is refreshed when the discovery backend
    /// has no watch support. Defaults to 10 seconds.
    pub probe_interval: Duration,
    /// Drop endpoints that have not been re-observed within this window.
    /// Off by default: watch-capable coordination stores already expire
    /// registrations through their own lease TTLs.
    pub endpoint_ttl: Option<Duration>,
    /// First delay after a failed snapshot or broken watch.
    pub retry_initial_backoff: Duration,
    /// Cap for the delay between reconnection attempts.
    pub retry_max_backoff: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(10),
            endpoint_ttl: None,
            retry_initial_backoff: Duration::from_millis(500),
            retry_max_backoff: Duration::from_secs(5),
        }
    }
}

pub(crate) struct RegistryShared {
    /// Endpoint -> the instant it was last confirmed by the backend.
    endpoints: RwLock<HashMap<SocketAddr, Instant>>,
    events: broadcast::Sender<EndpointEvent>,
}

impl RegistryShared {
    fn new() -> Self {
        let (events, _) = broadcast::channel(ENDPOINT_EVENT_CHANNEL_SIZE);
        Self {
            endpoints: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub(crate) fn snapshot(&self) -> HashSet<SocketAddr> {
        self.endpoints.read().keys().copied().collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.events.subscribe()
    }

    /// Replace the endpoint set with a full snapshot, emitting the diff.
    fn apply_snapshot(&self, next: HashSet<SocketAddr>) {
        let now = Instant::now();
        let mut added = Vec::new();
        let mut removed = Vec::new();

        {
            let mut endpoints = self.endpoints.write();
            endpoints.retain(|addr, _| {
                let keep = next.contains(addr);
                if !keep {
                    removed.push(*addr);
                }
                keep
            });
            for addr in next {
                if endpoints.insert(addr, now).is_none() {
                    added.push(addr);
                }
            }
        }

        for addr in added {
            tracing::info!(endpoint = %addr, "endpoint added");
            let _ = self.events.send(EndpointEvent::Added(addr));
        }
        for addr in removed {
            tracing::info!(endpoint = %addr, "endpoint removed");
            let _ = self.events.send(EndpointEvent::Removed(addr));
        }
    }

    fn observe(&self, addr: SocketAddr) {
        let newly_added = self.endpoints.write().insert(addr, Instant::now()).is_none();
        if newly_added {
            tracing::info!(endpoint = %addr, "endpoint added");
            let _ = self.events.send(EndpointEvent::Added(addr));
        }
    }

    fn forget(&self, addr: SocketAddr) {
        let was_present = self.endpoints.write().remove(&addr).is_some();
        if was_present {
            tracing::info!(endpoint = %addr, "endpoint removed");
            let _ = self.events.send(EndpointEvent::Removed(addr));
        }
    }

    /// Drop endpoints whose registration has not been confirmed within `ttl`.
    fn sweep_expired(&self, ttl: Duration) {
        let now = Instant::now();
        let mut expired = Vec::new();

        self.endpoints.write().retain(|addr, last_seen| {
            let keep = now.duration_since(*last_seen) <= ttl;
            if !keep {
                expired.push(*addr);
            }
            keep
        });

        for addr in expired {
            tracing::warn!(endpoint = %addr, "endpoint registration expired");
            let _ = self.events.send(EndpointEvent::Removed(addr));
        }
    }
}

/// Holds the current set of live endpoints for one service, kept up to date
/// by a background task that watches (or polls) a [`ServiceDiscovery`]
/// backend.
///
/// Discovery outages are tolerated by retaining the last known snapshot:
/// the task retries with capped exponential backoff and callers keep
/// reading the stale-but-useful set in the meantime.
pub struct EndpointRegistry {
    shared: Arc<RegistryShared>,
    discovery: Arc<dyn ServiceDiscovery + Send + Sync>,
    service: ServiceName,
    shutdown: watch::Sender<bool>,
    worker: tokio::task::JoinHandle<()>,
}

impl EndpointRegistry {
    /// Spawn the registry's background task and return a handle to the
    /// shared endpoint set.
    pub fn spawn<D>(discovery: D, service: ServiceName, config: RegistryConfig) -> Self
    where
        D: ServiceDiscovery + Send + Sync + 'static,
    {
        let shared = Arc::new(RegistryShared::new());
        let discovery: Arc<dyn ServiceDiscovery + Send + Sync> = Arc::new(discovery);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let worker = tokio::spawn(run(
            Arc::clone(&discovery),
            service.clone(),
            config,
            Arc::clone(&shared),
            shutdown_rx,
        ));

        Self {
            shared,
            discovery,
            service,
            shutdown,
            worker,
        }
    }

    /// The service this registry tracks.
    pub fn service(&self) -> &ServiceName {
        &self.service
    }

    /// The current endpoint set. Safe to call concurrently with background
    /// mutation; returns a copy.
    pub fn snapshot(&self) -> HashSet<SocketAddr> {
        self.shared.snapshot()
    }

    /// Subscribe to endpoint additions and removals.
    pub fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.shared.subscribe()
    }

    /// Force one synchronous snapshot refresh, bypassing the background
    /// task's schedule. Used for eager resolution at client construction.
    pub async fn refresh(&self) -> Result<(), anyhow::Error> {
        let endpoints = self
            .discovery
            .snapshot(&self.service)
            .await
            .context("coordination store unavailable")?;
        self.shared.apply_snapshot(endpoints);
        Ok(())
    }

    /// Stop the background task. The last known endpoint set stays
    /// readable but is no longer updated.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub(crate) fn shared(&self) -> Arc<RegistryShared> {
        Arc::clone(&self.shared)
    }
}

impl Drop for EndpointRegistry {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        self.worker.abort();
    }
}

/// Sleep for `delay`, returning `true` if shutdown was signalled meanwhile.
async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}

async fn run(
    discovery: Arc<dyn ServiceDiscovery + Send + Sync>,
    service: ServiceName,
    config: RegistryConfig,
    shared: Arc<RegistryShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failure_backoff = config.retry_initial_backoff;

    loop {
        if *shutdown.borrow() {
            return;
        }

        match discovery.snapshot(&service).await {
            Ok(endpoints) => {
                shared.apply_snapshot(endpoints);
                failure_backoff = config.retry_initial_backoff;
            }
            Err(error) => {
                tracing::warn!(
                    service = %service,
                    %error,
                    "discovery snapshot failed; retaining last known endpoints",
                );
                if sleep_or_shutdown(&mut shutdown, failure_backoff).await {
                    return;
                }
                if let Some(ttl) = config.endpoint_ttl {
                    shared.sweep_expired(ttl);
                }
                failure_backoff = (failure_backoff * 2).min(config.retry_max_backoff);
                continue;
            }
        }

        match discovery.watch(&service).await {
            Ok(Some(mut events)) => {
                tracing::debug!(service = %service, "consuming discovery watch stream");
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        event = events.next() => match event {
                            Some(Ok(EndpointEvent::Added(addr))) => shared.observe(addr),
                            Some(Ok(EndpointEvent::Removed(addr))) => shared.forget(addr),
                            Some(Err(error)) => {
                                tracing::warn!(service = %service, %error, "watch stream failed; re-resolving");
                                break;
                            }
                            None => {
                                tracing::warn!(service = %service, "watch stream ended; re-resolving");
                                break;
                            }
                        }
                    }
                }
                if sleep_or_shutdown(&mut shutdown, failure_backoff).await {
                    return;
                }
                failure_backoff = (failure_backoff * 2).min(config.retry_max_backoff);
            }
            Ok(None) => {
                // Poll-only backend: wait out the probe interval, then take
                // a fresh snapshot on the next loop iteration.
                if sleep_or_shutdown(&mut shutdown, config.probe_interval).await {
                    return;
                }
                if let Some(ttl) = config.endpoint_ttl {
                    shared.sweep_expired(ttl);
                }
            }
            Err(error) => {
                tracing::warn!(service = %service, %error, "failed to establish watch; retrying");
                if sleep_or_shutdown(&mut shutdown, failure_backoff).await {
                    return;
                }
                failure_backoff = (failure_backoff * 2).min(config.retry_max_backoff);
            }
        }
    }
}
