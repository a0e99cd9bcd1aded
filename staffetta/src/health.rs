//! Tracks per-endpoint liveness and gates load balancing on it.

use crate::registry::RegistryShared;
use crate::{EndpointEvent, EndpointRegistry};
use anyhow::Context;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::{Duration, MissedTickBehavior};
use tonic_health::proto::health_check_response::ServingStatus;
use tonic_health::proto::health_client::HealthClient;
use tonic_health::proto::HealthCheckRequest;

// Capacity of the health-transition fanout channel.
const HEALTH_TRANSITION_CHANNEL_SIZE: usize = 1024;

/// Interface for probing the liveness of a single endpoint.
///
/// An `Err` counts as one failed check; turning failed checks into an
/// unhealthy verdict is the [`HealthFilter`]'s job.
#[async_trait::async_trait]
pub trait HealthProbe {
    async fn check(&self, addr: SocketAddr) -> Result<(), anyhow::Error>;
}

/// Implements [`HealthProbe`] with a unary `grpc.health.v1.Health/Check`
/// call against the endpoint.
pub struct GrpcHealthProbe {
    /// The service name reported to the health endpoint. An empty string
    /// queries the server's overall status.
    service: String,
    connect_timeout: Duration,
    rpc_timeout: Duration,
}

impl GrpcHealthProbe {
    pub fn new(service: impl Into<String>, connect_timeout: Duration, rpc_timeout: Duration) -> Self {
        Self {
            service: service.into(),
            connect_timeout,
            rpc_timeout,
        }
    }
}

#[async_trait::async_trait]
impl HealthProbe for GrpcHealthProbe {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn check(&self, addr: SocketAddr) -> Result<(), anyhow::Error> {
        let channel = tonic::transport::Endpoint::from_shared(format!("http://{addr}"))
            .context("invalid endpoint address")?
            .connect_timeout(self.connect_timeout)
            .timeout(self.rpc_timeout)
            .connect()
            .await
            .context("failed to connect to endpoint")?;

        let response = HealthClient::new(channel)
            .check(HealthCheckRequest {
                service: self.service.clone(),
            })
            .await
            .context("health check rpc failed")?;

        match response.into_inner().status() {
            ServingStatus::Serving => Ok(()),
            status => Err(anyhow::anyhow!("endpoint reported status {status:?}")),
        }
    }
}

/// Hysteresis and cadence settings for health checking.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Delay between consecutive checks of one endpoint.
    pub check_interval: Duration,
    /// Hard deadline for a single check; a timeout counts as a failure.
    pub check_timeout: Duration,
    /// Consecutive failures before a healthy endpoint turns unhealthy.
    pub unhealthy_threshold: u32,
    /// Consecutive successes before an unhealthy endpoint turns healthy.
    pub healthy_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            check_timeout: Duration::from_secs(2),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

/// Emitted whenever an endpoint crosses a hysteresis threshold, so that
/// consumers holding cached selections can invalidate them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTransition {
    pub addr: SocketAddr,
    pub healthy: bool,
}

struct EndpointHealth {
    healthy: bool,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

impl EndpointHealth {
    /// Fresh endpoints start healthy: hysteresis only demotes them after
    /// `unhealthy_threshold` observed failures.
    fn new() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }
}

struct HealthShared {
    states: parking_lot::RwLock<HashMap<SocketAddr, EndpointHealth>>,
    transitions: broadcast::Sender<HealthTransition>,
    ready: watch::Sender<bool>,
}

impl HealthShared {
    fn recompute_ready(&self) {
        let ready = self.states.read().values().any(|state| state.healthy);
        self.ready.send_replace(ready);
    }

    /// Fold one check outcome into the endpoint's state, emitting a
    /// transition if a threshold was crossed.
    fn record(&self, config: &HealthConfig, addr: SocketAddr, passed: bool) {
        let transition = {
            let mut states = self.states.write();
            let Some(state) = states.get_mut(&addr) else {
                // Endpoint was removed while its check was in flight.
                return;
            };

            if passed {
                state.consecutive_failures = 0;
                state.consecutive_successes += 1;
                if !state.healthy && state.consecutive_successes >= config.healthy_threshold {
                    state.healthy = true;
                    Some(true)
                } else {
                    None
                }
            } else {
                state.consecutive_successes = 0;
                state.consecutive_failures += 1;
                if state.healthy && state.consecutive_failures >= config.unhealthy_threshold {
                    state.healthy = false;
                    Some(false)
                } else {
                    None
                }
            }
        };

        if let Some(healthy) = transition {
            tracing::info!(endpoint = %addr, healthy, "endpoint health transition");
            let _ = self.transitions.send(HealthTransition { addr, healthy });
            self.recompute_ready();
        }
    }
}

/// Maintains liveness state for every registered endpoint and exposes the
/// healthy subset to the load balancer.
///
/// One supervisor task follows registry events; each endpoint gets its own
/// periodic check task, so one slow endpoint cannot delay the checks of
/// the others.
pub struct HealthFilter {
    shared: Arc<HealthShared>,
    ready_rx: watch::Receiver<bool>,
    shutdown: watch::Sender<bool>,
    supervisor: tokio::task::JoinHandle<()>,
}

impl HealthFilter {
    /// Spawn the supervisor and per-endpoint check tasks for everything the
    /// registry currently knows and everything it learns later.
    pub fn spawn<P>(registry: &EndpointRegistry, probe: P, config: HealthConfig) -> Self
    where
        P: HealthProbe + Send + Sync + 'static,
    {
        let (transitions, _) = broadcast::channel(HEALTH_TRANSITION_CHANNEL_SIZE);
        let (ready, ready_rx) = watch::channel(false);
        let shared = Arc::new(HealthShared {
            states: parking_lot::RwLock::new(HashMap::new()),
            transitions,
            ready,
        });
        let (shutdown, shutdown_rx) = watch::channel(false);

        let supervisor = tokio::spawn(supervise(
            Arc::new(probe),
            registry.shared(),
            registry.subscribe(),
            Arc::clone(&shared),
            config,
            shutdown_rx,
        ));

        Self {
            shared,
            ready_rx,
            shutdown,
            supervisor,
        }
    }

    /// Whether the endpoint is currently considered healthy. Unknown
    /// endpoints are not.
    pub fn is_healthy(&self, addr: SocketAddr) -> bool {
        self.shared
            .states
            .read()
            .get(&addr)
            .map(|state| state.healthy)
            .unwrap_or(false)
    }

    /// The healthy endpoints, sorted for deterministic iteration order.
    pub fn healthy_snapshot(&self) -> Vec<SocketAddr> {
        let mut healthy: Vec<SocketAddr> = self
            .shared
            .states
            .read()
            .iter()
            .filter(|(_, state)| state.healthy)
            .map(|(addr, _)| *addr)
            .collect();
        healthy.sort();
        healthy
    }

    /// Subscribe to health transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthTransition> {
        self.shared.transitions.subscribe()
    }

    /// Wait until at least one endpoint is healthy. Returns immediately if
    /// one already is. Callers are expected to bound this with their own
    /// deadline.
    pub async fn ready(&self) {
        let mut ready = self.ready_rx.clone();
        let _ = ready.wait_for(|ready| *ready).await;
    }

    /// Stop the supervisor and all per-endpoint check tasks.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for HealthFilter {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        self.supervisor.abort();
    }
}

async fn supervise<P>(
    probe: Arc<P>,
    registry: Arc<RegistryShared>,
    mut events: broadcast::Receiver<EndpointEvent>,
    shared: Arc<HealthShared>,
    config: HealthConfig,
    shutdown: watch::Receiver<bool>,
) where
    P: HealthProbe + Send + Sync + 'static,
{
    let mut checkers: HashMap<SocketAddr, tokio::task::JoinHandle<()>> = HashMap::new();

    for addr in registry.snapshot() {
        add_endpoint(&probe, &shared, &config, &shutdown, &mut checkers, addr);
    }

    let mut shutdown_rx = shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            event = events.recv() => match event {
                Ok(EndpointEvent::Added(addr)) => {
                    add_endpoint(&probe, &shared, &config, &shutdown, &mut checkers, addr);
                }
                Ok(EndpointEvent::Removed(addr)) => {
                    remove_endpoint(&shared, &mut checkers, addr);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "endpoint event stream lagged; resynchronizing");
                    let current = registry.snapshot();
                    let known: Vec<SocketAddr> = checkers.keys().copied().collect();
                    for addr in known {
                        if !current.contains(&addr) {
                            remove_endpoint(&shared, &mut checkers, addr);
                        }
                    }
                    for addr in current {
                        add_endpoint(&probe, &shared, &config, &shutdown, &mut checkers, addr);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    for handle in checkers.into_values() {
        handle.abort();
    }
}

fn add_endpoint<P>(
    probe: &Arc<P>,
    shared: &Arc<HealthShared>,
    config: &HealthConfig,
    shutdown: &watch::Receiver<bool>,
    checkers: &mut HashMap<SocketAddr, tokio::task::JoinHandle<()>>,
    addr: SocketAddr,
) where
    P: HealthProbe + Send + Sync + 'static,
{
    if checkers.contains_key(&addr) {
        return;
    }

    shared.states.write().insert(addr, EndpointHealth::new());
    shared.recompute_ready();
    tracing::debug!(endpoint = %addr, "started health checking");

    let handle = tokio::spawn(check_loop(
        Arc::clone(probe),
        Arc::clone(shared),
        config.clone(),
        addr,
        shutdown.clone(),
    ));
    checkers.insert(addr, handle);
}

fn remove_endpoint(
    shared: &Arc<HealthShared>,
    checkers: &mut HashMap<SocketAddr, tokio::task::JoinHandle<()>>,
    addr: SocketAddr,
) {
    if let Some(handle) = checkers.remove(&addr) {
        handle.abort();
    }
    shared.states.write().remove(&addr);
    shared.recompute_ready();
    tracing::debug!(endpoint = %addr, "stopped health checking");
}

async fn check_loop<P>(
    probe: Arc<P>,
    shared: Arc<HealthShared>,
    config: HealthConfig,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) where
    P: HealthProbe + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(config.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {
                let passed = match tokio::time::timeout(config.check_timeout, probe.check(addr)).await {
                    Ok(Ok(())) => true,
                    Ok(Err(error)) => {
                        tracing::debug!(endpoint = %addr, %error, "health check failed");
                        false
                    }
                    Err(_) => {
                        tracing::debug!(endpoint = %addr, "health check timed out");
                        false
                    }
                };
                shared.record(&config, addr, passed);
            }
        }
    }
}
