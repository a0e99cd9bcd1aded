//! `staffetta` resolves a logical gRPC service name to the live set of
//! server endpoints through a pluggable [`ServiceDiscovery`] backend,
//! health-checks every endpoint, and dispatches calls over the healthy
//! subset with configurable load balancing, deadlines and retries.
//!
//! # Simple example
//!
//! ```rust,no_run
//! #[tokio::main]
//! async fn main() {
//!     use staffetta::{BalancedClient, ClientConfig, EtcdDiscovery, ServiceName};
//!
//!     let service = ServiceName::new("pkg.Tester").expect("invalid service name");
//!
//!     let discovery = EtcdDiscovery::connect(["http://127.0.0.1:2379"], "/services")
//!         .await
//!         .expect("failed to connect to etcd");
//!
//!     // Create a client with the recommended retry and balancing defaults.
//!     let client = BalancedClient::builder(service.clone())
//!         .config(ClientConfig::recommended(&service))
//!         .discovery(discovery)
//!         .build()
//!         .await
//!         .expect("failed to construct BalancedClient");
//! }
//! ```
//!
//! [`BalancedClient`] also allows plugging in a different implementation of
//! [`ServiceDiscovery`].
//!
//! ```rust
//! use staffetta::{ServiceDiscovery, ServiceName};
//! use std::collections::HashSet;
//! use std::net::SocketAddr;
//!
//! // This does nothing
//! struct DummyDiscovery;
//!
//! #[async_trait::async_trait]
//! impl ServiceDiscovery for DummyDiscovery {
//!     async fn snapshot(
//!         &self,
//!         _service: &ServiceName,
//!     ) -> Result<HashSet<SocketAddr>, anyhow::Error> {
//!         Ok(HashSet::new())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     use staffetta::BalancedClient;
//!
//!     let service = ServiceName::new("pkg.Tester").expect("invalid service name");
//!
//!     let client = BalancedClient::builder(service)
//!         .discovery(DummyDiscovery)
//!         .build()
//!         .await
//!         .expect("failed to construct BalancedClient");
//! }
//! ```
//!
//! For systems with lower churn, the probe interval of snapshot-only
//! backends can be lowered.
//!
//! ```rust,no_run
//! #[tokio::main]
//! async fn main() {
//!     use staffetta::{BalancedClient, DnsDiscovery, ServiceName};
//!
//!     let service = ServiceName::new("my.service.internal").expect("invalid service name");
//!
//!     let discovery = DnsDiscovery::from_system_config(5000)
//!         .await
//!         .expect("failed to read resolver configuration");
//!
//!     let client = BalancedClient::builder(service)
//!         .discovery(discovery)
//!         .probe_interval(std::time::Duration::from_secs(3))
//!         .build()
//!         .await
//!         .expect("failed to construct BalancedClient");
//! }
//! ```
//!
//! It's also possible to eagerly resolve the service endpoints once before
//! the [`BalancedClient`] is constructed.
//!
//! ```rust,no_run
//! #[tokio::main]
//! async fn main() {
//!     use staffetta::{BalancedClient, EtcdDiscovery, ResolutionStrategy, ServiceName};
//!     use std::time::Duration;
//!
//!     let service = ServiceName::new("pkg.Tester").expect("invalid service name");
//!
//!     let discovery = EtcdDiscovery::connect(["http://127.0.0.1:2379"], "/services")
//!         .await
//!         .expect("failed to connect to etcd");
//!
//!     let client = BalancedClient::builder(service)
//!         .discovery(discovery)
//!         .resolution_strategy(ResolutionStrategy::Eager {
//!             timeout: Duration::from_secs(20),
//!         })
//!         .build()
//!         .await
//!         .expect("failed to construct BalancedClient");
//! }
//! ```
//!
//! # Internals
//!
//! The [`EndpointRegistry`] runs a background task per client which watches
//! (or, for backends without watch semantics, polls) the discovery backend
//! and maintains the endpoint set. The [`HealthFilter`] runs one periodic
//! health-check task per endpoint and demotes or promotes endpoints with
//! hysteresis. Every call picks a healthy endpoint through the
//! [`Balancer`] and runs its attempts under the [`RetryEngine`], which
//! enforces the retry policy, the deterministic backoff schedule and the
//! shared retry token bucket.

mod balance;
mod client;
mod config;
mod discovery;
mod dns;
mod error;
mod etcd;
mod health;
mod registry;
mod retry;
mod service_name;

pub use balance::*;
pub use client::*;
pub use config::*;
pub use discovery::*;
pub use dns::*;
pub use error::*;
pub use etcd::*;
pub use health::*;
pub use registry::*;
pub use retry::*;
pub use service_name::*;
