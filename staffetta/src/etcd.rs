//! Implements [`ServiceDiscovery`] against an etcd cluster.

use crate::{EndpointEvent, EndpointStream, ServiceDiscovery, ServiceName};
use anyhow::Context;
use etcd_client::{Client, EventType, GetOptions, WatchOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use tokio_stream::wrappers::ReceiverStream;

// Bounds the number of watch events buffered between the etcd stream and
// the registry before backpressure kicks in.
const WATCH_EVENT_CHANNEL_SIZE: usize = 64;

/// The record a server-side registrar writes under its registration key,
/// kept under a TTL lease so that crashed servers disappear on their own.
///
/// This is the only place the registration crosses the wire; internally
/// endpoints are plain [`SocketAddr`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    /// The address the server accepts gRPC traffic on.
    pub addr: SocketAddr,
}

/// Implements [`ServiceDiscovery`] over an etcd key namespace.
///
/// Each live server instance of `pkg.Tester` is expected to hold a key
/// `{prefix}/pkg.Tester/{addr}` whose value is a JSON [`Registration`].
/// Snapshots are prefix range reads; watches are etcd prefix watches.
pub struct EtcdDiscovery {
    client: Client,
    prefix: String,
}

impl EtcdDiscovery {
    /// Connect to an etcd cluster and watch registrations under `prefix`.
    pub async fn connect<E: AsRef<str>, S: AsRef<[E]>>(
        endpoints: S,
        prefix: impl Into<String>,
    ) -> Result<Self, anyhow::Error> {
        let client = Client::connect(endpoints, None)
            .await
            .context("failed to connect to etcd")?;

        Ok(Self::new(client, prefix))
    }

    /// Build an [`EtcdDiscovery`] from an already connected client.
    pub fn new(client: Client, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_end_matches('/').to_string();

        Self { client, prefix }
    }

    fn service_prefix(&self, service: &ServiceName) -> String {
        format!("{}/{}/", self.prefix, service)
    }

    /// Recover the endpoint address from a registration key/value pair.
    ///
    /// The value is authoritative, but delete events carry no value, so the
    /// key suffix is used whenever the value is absent or malformed.
    fn parse_registration(key: &str, value: &[u8]) -> Option<SocketAddr> {
        if !value.is_empty() {
            match serde_json::from_slice::<Registration>(value) {
                Ok(registration) => return Some(registration.addr),
                Err(error) => {
                    tracing::warn!(key, %error, "malformed registration value; falling back to key suffix");
                }
            }
        }

        match key.rsplit('/').next().and_then(|s| s.parse().ok()) {
            Some(addr) => Some(addr),
            None => {
                tracing::warn!(key, "registration key does not end in a socket address; skipping");
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl ServiceDiscovery for EtcdDiscovery {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn snapshot(&self, service: &ServiceName) -> Result<HashSet<SocketAddr>, anyhow::Error> {
        let prefix = self.service_prefix(service);

        let mut kv = self.client.kv_client();
        let response = kv
            .get(prefix.as_str(), Some(GetOptions::new().with_prefix()))
            .await
            .context("failed to range-read service registrations")?;

        let mut endpoints = HashSet::new();
        for kv in response.kvs() {
            let key = kv.key_str().context("registration key is not utf-8")?;
            if let Some(addr) = Self::parse_registration(key, kv.value()) {
                endpoints.insert(addr);
            }
        }

        Ok(endpoints)
    }

    async fn watch(&self, service: &ServiceName) -> Result<Option<EndpointStream>, anyhow::Error> {
        let prefix = self.service_prefix(service);

        let mut watch_client = self.client.watch_client();
        let (watcher, mut stream) = watch_client
            .watch(prefix.as_str(), Some(WatchOptions::new().with_prefix()))
            .await
            .context("failed to establish watch on service registrations")?;

        let (tx, rx) = tokio::sync::mpsc::channel(WATCH_EVENT_CHANNEL_SIZE);

        tokio::spawn(async move {
            // The watcher handle must outlive the stream, otherwise etcd
            // cancels the watch server-side.
            let _watcher = watcher;

            loop {
                match stream.message().await {
                    Ok(Some(response)) => {
                        if response.canceled() {
                            let _ = tx
                                .send(Err(anyhow::anyhow!("watch canceled by the etcd server")))
                                .await;
                            return;
                        }

                        for event in response.events() {
                            let Some(kv) = event.kv() else { continue };
                            let Ok(key) = kv.key_str() else {
                                tracing::warn!("registration key is not utf-8; skipping event");
                                continue;
                            };
                            let Some(addr) = EtcdDiscovery::parse_registration(key, kv.value())
                            else {
                                continue;
                            };

                            let event = match event.event_type() {
                                EventType::Put => EndpointEvent::Added(addr),
                                EventType::Delete => EndpointEvent::Removed(addr),
                            };

                            if tx.send(Ok(event)).await.is_err() {
                                // Registry hung up; stop watching.
                                return;
                            }
                        }
                    }
                    Ok(None) => return,
                    Err(error) => {
                        let _ = tx.send(Err(error.into())).await;
                        return;
                    }
                }
            }
        });

        Ok(Some(Box::pin(ReceiverStream::new(rx))))
    }
}
