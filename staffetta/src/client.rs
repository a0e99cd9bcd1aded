//! Provides the builder and implementation of [`BalancedClient`], the
//! entry point that ties discovery, health checking, balancing and
//! retries together.

use crate::retry::AttemptError;
use crate::{
    Balancer, CallError, ClientConfig, EndpointRegistry, GrpcHealthProbe, HealthConfig,
    HealthFilter, HealthProbe, RegistryConfig, RetryEngine, RetryPolicy, RetryThrottle,
    ServiceDiscovery, ServiceName,
};
use anyhow::Context as _;
use futures::future::{self, Either};
use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Duration;

/// Enumerates the different endpoint resolution strategies that
/// the [`BalancedClientBuilder`] supports.
pub enum ResolutionStrategy {
    /// Creates the client without attempting to resolve
    /// an initial set of endpoints.
    Lazy,
    /// Tries to resolve the service before creating the client
    /// in order to start with a non-empty set of endpoints.
    Eager { timeout: Duration },
}

/// Whether the endpoint choice is revisited on every attempt of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndpointSelection {
    /// Reselect per attempt, so retries land on a different endpoint when
    /// one is available.
    #[default]
    PerAttempt,
    /// Stick with the first endpoint for every attempt of the call, as
    /// long as it stays healthy.
    PerCall,
}

/// Per-call overrides for settings that normally come from the method
/// config.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub wait_for_ready: Option<bool>,
}

/// A client for one logical service: resolves the service to live
/// endpoints through a coordination store, health-checks them, balances
/// calls over the healthy subset and retries failed attempts within
/// policy.
///
/// ```rust
/// use staffetta::{BalancedClient, ClientConfig, ServiceName};
/// use std::collections::HashSet;
/// use std::net::SocketAddr;
///
/// // This does nothing
/// struct DummyDiscovery;
///
/// #[async_trait::async_trait]
/// impl staffetta::ServiceDiscovery for DummyDiscovery {
///     async fn snapshot(
///         &self,
///         _service: &staffetta::ServiceName,
///     ) -> Result<HashSet<SocketAddr>, anyhow::Error> {
///         Ok(HashSet::new())
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     let service = ServiceName::new("pkg.Tester").unwrap();
///
///     let client = BalancedClient::builder(service.clone())
///         .config(ClientConfig::recommended(&service))
///         .discovery(DummyDiscovery)
///         .build()
///         .await
///         .expect("failed to construct BalancedClient");
/// }
/// ```
#[derive(Clone)]
pub struct BalancedClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    service: ServiceName,
    registry: EndpointRegistry,
    health: HealthFilter,
    balancer: Balancer,
    engine: RetryEngine,
    timeout: Option<Duration>,
    wait_for_ready: bool,
    max_request_bytes: Option<usize>,
    max_response_bytes: Option<usize>,
    selection: EndpointSelection,
}

impl BalancedClient {
    /// Start configuring a `BalancedClient` for the given service - e.g.
    /// `pkg.Tester`.
    pub fn builder(service: ServiceName) -> BalancedClientBuilder {
        BalancedClientBuilder::new(service)
    }

    /// The service this client calls.
    pub fn service(&self) -> &ServiceName {
        &self.inner.service
    }

    /// Every endpoint the registry currently knows, healthy or not.
    pub fn endpoints(&self) -> HashSet<SocketAddr> {
        self.inner.registry.snapshot()
    }

    /// The endpoints calls can currently be dispatched to.
    pub fn healthy_endpoints(&self) -> Vec<SocketAddr> {
        self.inner.health.healthy_snapshot()
    }

    /// Stop the background discovery and health-checking tasks. In-flight
    /// calls finish against the frozen endpoint set.
    pub fn shutdown(&self) {
        self.inner.registry.shutdown();
        self.inner.health.shutdown();
    }

    /// Dispatch one logical call using the method-config defaults.
    ///
    /// `send` performs a single attempt against the endpoint it is given;
    /// the client decides which endpoint that is, how often `send` runs
    /// and how long to wait in between.
    pub async fn call<Req, Resp, F, Fut>(&self, request: Req, send: F) -> Result<Resp, CallError>
    where
        Req: prost::Message + Clone,
        Resp: prost::Message,
        F: FnMut(SocketAddr, Req) -> Fut,
        Fut: Future<Output = Result<Resp, tonic::Status>>,
    {
        self.call_with(request, CallOptions::default(), send).await
    }

    /// Dispatch one logical call, overriding the per-call deadline and/or
    /// wait-for-ready behaviour.
    pub async fn call_with<Req, Resp, F, Fut>(
        &self,
        request: Req,
        options: CallOptions,
        mut send: F,
    ) -> Result<Resp, CallError>
    where
        Req: prost::Message + Clone,
        Resp: prost::Message,
        F: FnMut(SocketAddr, Req) -> Fut,
        Fut: Future<Output = Result<Resp, tonic::Status>>,
    {
        let inner = &self.inner;

        if let Some(limit) = inner.max_request_bytes {
            let size = request.encoded_len();
            if size > limit {
                return Err(CallError::RequestTooLarge { size, limit });
            }
        }

        let wait_for_ready = options.wait_for_ready.unwrap_or(inner.wait_for_ready);
        let timeout = options.timeout.or(inner.timeout);
        let call = self.dispatch(request, wait_for_ready, &mut send);

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::debug!(service = %inner.service, timeout = ?limit, "call deadline exceeded");
                    Err(CallError::DeadlineExceeded)
                }
            },
            None => call.await,
        }
    }

    async fn dispatch<Req, Resp, F, Fut>(
        &self,
        request: Req,
        wait_for_ready: bool,
        send: &mut F,
    ) -> Result<Resp, CallError>
    where
        Req: prost::Message + Clone,
        Resp: prost::Message,
        F: FnMut(SocketAddr, Req) -> Fut,
        Fut: Future<Output = Result<Resp, tonic::Status>>,
    {
        let inner = &self.inner;

        if wait_for_ready {
            inner.health.ready().await;
        }

        let mut previous: Option<SocketAddr> = None;
        let response_limit = inner.max_response_bytes;

        inner
            .engine
            .execute(|attempt| {
                let healthy = inner.health.healthy_snapshot();
                let avoid = if attempt > 1 { previous } else { None };

                let pick = match inner.selection {
                    EndpointSelection::PerCall => previous
                        .filter(|addr| healthy.binary_search(addr).is_ok())
                        .map(|addr| inner.balancer.acquire(addr))
                        .or_else(|| inner.balancer.pick(&healthy, avoid)),
                    EndpointSelection::PerAttempt => inner.balancer.pick(&healthy, avoid),
                };

                let Some(pick) = pick else {
                    return Either::Left(future::ready(Err(AttemptError::Terminal(
                        CallError::NoHealthyEndpoint(inner.service.clone()),
                    ))));
                };

                previous = Some(pick.addr());
                tracing::trace!(
                    service = %inner.service,
                    attempt,
                    endpoint = %pick.addr(),
                    "dispatching attempt",
                );

                let outcome = send(pick.addr(), request.clone());
                Either::Right(async move {
                    // Hold the pick so in-flight accounting covers the
                    // whole attempt.
                    let _pick = pick;
                    match outcome.await {
                        Ok(response) => {
                            if let Some(limit) = response_limit {
                                let size = response.encoded_len();
                                if size > limit {
                                    return Err(AttemptError::Terminal(
                                        CallError::ResponseTooLarge { size, limit },
                                    ));
                                }
                            }
                            Ok(response)
                        }
                        Err(status) => Err(AttemptError::Status(status)),
                    }
                })
            })
            .await
    }
}

/// Builder to configure and create a [`BalancedClient`].
///
/// The discovery backend must be supplied with
/// [`discovery`](BalancedClientBuilder::discovery) before
/// [`build`](BalancedClientBuilder::build) becomes available; the health
/// probe defaults to [`GrpcHealthProbe`] unless overridden with
/// [`health_probe`](BalancedClientBuilder::health_probe).
pub struct BalancedClientBuilder<D = (), P = GrpcHealthProbe> {
    service: ServiceName,
    config: ClientConfig,
    discovery: D,
    probe: Option<P>,
    registry_config: RegistryConfig,
    health_config: HealthConfig,
    resolution_strategy: ResolutionStrategy,
    endpoint_selection: EndpointSelection,
}

impl BalancedClientBuilder<(), GrpcHealthProbe> {
    /// Start a builder with default configuration: no retries, no
    /// deadline, fail fast on an empty endpoint set.
    pub fn new(service: ServiceName) -> Self {
        Self {
            service,
            config: ClientConfig::default(),
            discovery: (),
            probe: None,
            registry_config: RegistryConfig::default(),
            health_config: HealthConfig::default(),
            resolution_strategy: ResolutionStrategy::Lazy,
            endpoint_selection: EndpointSelection::default(),
        }
    }
}

impl<D, P> BalancedClientBuilder<D, P> {
    /// Set the discovery backend the endpoint registry watches.
    pub fn discovery<D2>(self, discovery: D2) -> BalancedClientBuilder<D2, P>
    where
        D2: ServiceDiscovery + Send + Sync + 'static,
    {
        BalancedClientBuilder {
            service: self.service,
            config: self.config,
            discovery,
            probe: self.probe,
            registry_config: self.registry_config,
            health_config: self.health_config,
            resolution_strategy: self.resolution_strategy,
            endpoint_selection: self.endpoint_selection,
        }
    }

    /// Swap the health probe implementation.
    pub fn health_probe<P2>(self, probe: P2) -> BalancedClientBuilder<D, P2>
    where
        P2: HealthProbe + Send + Sync + 'static,
    {
        BalancedClientBuilder {
            service: self.service,
            config: self.config,
            discovery: self.discovery,
            probe: Some(probe),
            registry_config: self.registry_config,
            health_config: self.health_config,
            resolution_strategy: self.resolution_strategy,
            endpoint_selection: self.endpoint_selection,
        }
    }

    /// Set the client configuration (balancing policy, retry policy,
    /// deadlines, throttling, health-check target). Validated in
    /// [`build`](Self::build).
    pub fn config(self, config: ClientConfig) -> Self {
        Self { config, ..self }
    }

    /// Set how often the registry polls snapshot-only discovery backends.
    /// Default interval in seconds is 10.
    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.registry_config.probe_interval = interval;
        self
    }

    /// Expire endpoints that have not been re-observed within `ttl`.
    pub fn endpoint_ttl(mut self, ttl: Duration) -> Self {
        self.registry_config.endpoint_ttl = Some(ttl);
        self
    }

    /// Replace the registry tunables wholesale.
    pub fn registry_config(self, registry_config: RegistryConfig) -> Self {
        Self {
            registry_config,
            ..self
        }
    }

    /// Set the health-check cadence and hysteresis thresholds.
    pub fn health_config(self, health_config: HealthConfig) -> Self {
        Self {
            health_config,
            ..self
        }
    }

    /// Set the [`ResolutionStrategy`].
    ///
    /// Default set to [`ResolutionStrategy::Lazy`].
    ///
    /// If [`ResolutionStrategy::Lazy`] the service will be resolved
    /// after-the-fact.
    ///
    /// Instead, if [`ResolutionStrategy::Eager`] is set the service will be
    /// resolved once before the [`BalancedClient`] is created, which
    /// ensures that the client starts with a non-empty endpoint set. If it
    /// fails the client creation will also fail.
    pub fn resolution_strategy(self, resolution_strategy: ResolutionStrategy) -> Self {
        Self {
            resolution_strategy,
            ..self
        }
    }

    /// Choose between per-attempt endpoint reselection (the default) and
    /// pinning each call to its first endpoint.
    pub fn endpoint_selection(self, endpoint_selection: EndpointSelection) -> Self {
        Self {
            endpoint_selection,
            ..self
        }
    }
}

impl<D, P> BalancedClientBuilder<D, P>
where
    D: ServiceDiscovery + Send + Sync + 'static,
    P: HealthProbe + Send + Sync + 'static,
{
    /// Construct a [`BalancedClient`] from the
    /// [`BalancedClientBuilder`] instance.
    pub async fn build(mut self) -> Result<BalancedClient, anyhow::Error> {
        match self.probe.take() {
            Some(probe) => self.build_inner(probe).await,
            None => {
                let health_service = self
                    .config
                    .health_check_config
                    .as_ref()
                    .map(|config| config.service_name.clone())
                    .unwrap_or_default();
                let probe = GrpcHealthProbe::new(
                    health_service,
                    self.health_config.check_timeout,
                    self.health_config.check_timeout,
                );
                self.build_inner(probe).await
            }
        }
    }

    async fn build_inner<P2>(self, probe: P2) -> Result<BalancedClient, anyhow::Error>
    where
        P2: HealthProbe + Send + Sync + 'static,
    {
        self.config
            .validate()
            .context("invalid client configuration")?;

        let service = self.service;
        let method = self.config.method_config_for(&service).cloned();

        let (retry_policy, wait_for_ready, timeout, max_request_bytes, max_response_bytes) =
            match &method {
                Some(method) => (
                    method
                        .retry_policy
                        .as_ref()
                        .map(RetryPolicy::try_from)
                        .transpose()?
                        .unwrap_or_else(RetryPolicy::no_retry),
                    method.wait_for_ready,
                    method.timeout,
                    method.max_request_message_bytes,
                    method.max_response_message_bytes,
                ),
                None => (RetryPolicy::no_retry(), false, None, None, None),
            };

        let throttle = self
            .config
            .retry_throttling
            .as_ref()
            .map(|throttling| {
                RetryThrottle::new(throttling.max_tokens, throttling.token_ratio).map(Arc::new)
            })
            .transpose()?;

        let registry =
            EndpointRegistry::spawn(self.discovery, service.clone(), self.registry_config);

        if let ResolutionStrategy::Eager { timeout } = self.resolution_strategy {
            // Make sure we resolve the service once before we create the client.
            tokio::time::timeout(timeout, registry.refresh())
                .await
                .context("timed out while attempting to resolve endpoints")?
                .context("failed to resolve endpoints")?;
        }

        let health = HealthFilter::spawn(&registry, probe, self.health_config);

        Ok(BalancedClient {
            inner: Arc::new(ClientInner {
                balancer: Balancer::new(self.config.load_balancing_policy),
                engine: RetryEngine::new(retry_policy, throttle),
                service,
                registry,
                health,
                timeout,
                wait_for_ready,
                max_request_bytes,
                max_response_bytes,
                selection: self.endpoint_selection,
            }),
        })
    }
}

const _: () = {
    const fn assert_is_send<T: Send>() {}
    assert_is_send::<BalancedClient>();
};
