use std::time::Duration;

use anyhow::Context;

use staffetta::{BalancedClient, ClientConfig, EtcdDiscovery, ResolutionStrategy, ServiceName};
use tonic_health::proto::health_client::HealthClient;
use tonic_health::proto::HealthCheckRequest;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let service = ServiceName::new("grpc.health.v1.Health")?;

    // Servers are expected to register themselves under
    // `/services/grpc.health.v1.Health/{addr}` in etcd.
    let discovery = EtcdDiscovery::connect(["http://127.0.0.1:2379"], "/services").await?;

    // By setting the resolution strategy to `Eager` the service is resolved
    // before the client is created, which ensures that it starts with a
    // non-empty set of endpoints.
    let client = BalancedClient::builder(service.clone())
        .config(ClientConfig::recommended(&service))
        .discovery(discovery)
        .resolution_strategy(ResolutionStrategy::Eager {
            timeout: Duration::from_secs(20),
        })
        .build()
        .await
        .context("failed to build BalancedClient")?;

    // Use the client created above to drive a unary call; here the health
    // endpoint doubles as the example service.
    let request = HealthCheckRequest {
        service: String::new(),
    };

    let response = client
        .call(request, |addr, request| async move {
            let channel = tonic::transport::Endpoint::from_shared(format!("http://{addr}"))
                .map_err(|err| tonic::Status::internal(err.to_string()))?
                .connect()
                .await
                .map_err(|err| tonic::Status::unavailable(err.to_string()))?;

            HealthClient::new(channel)
                .check(request)
                .await
                .map(|response| response.into_inner())
        })
        .await?;

    println!("RESPONSE={response:?}");

    Ok(())
}
