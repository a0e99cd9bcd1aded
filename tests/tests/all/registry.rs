use staffetta::{EndpointEvent, EndpointRegistry, RegistryConfig, ServiceName};
use std::collections::HashSet;
use std::net::SocketAddr;
use tests::discovery::InMemoryDiscovery;
use tokio::time::Duration;

fn service() -> ServiceName {
    ServiceName::new("pkg.Tester").unwrap()
}

fn endpoint(last_octet: u8) -> SocketAddr {
    format!("10.0.0.{last_octet}:5000").parse().unwrap()
}

fn config() -> RegistryConfig {
    RegistryConfig {
        probe_interval: Duration::from_millis(10),
        ..RegistryConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn watch_events_update_the_endpoint_set() {
    let discovery = InMemoryDiscovery::new();
    discovery.add(endpoint(1));

    let registry = EndpointRegistry::spawn(discovery.clone(), service(), config());
    let mut events = registry.subscribe();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(registry.snapshot(), HashSet::from([endpoint(1)]));
    assert_eq!(events.recv().await.unwrap(), EndpointEvent::Added(endpoint(1)));

    discovery.add(endpoint(2));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(registry.snapshot(), HashSet::from([endpoint(1), endpoint(2)]));
    assert_eq!(events.recv().await.unwrap(), EndpointEvent::Added(endpoint(2)));

    discovery.remove(endpoint(1));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(registry.snapshot(), HashSet::from([endpoint(2)]));
    assert_eq!(
        events.recv().await.unwrap(),
        EndpointEvent::Removed(endpoint(1))
    );
}

#[tokio::test(start_paused = true)]
async fn snapshot_only_backends_are_polled() {
    let discovery = InMemoryDiscovery::poll_only();
    discovery.add(endpoint(1));

    let registry = EndpointRegistry::spawn(discovery.clone(), service(), config());

    tokio::time::sleep(Duration::from_millis(25)).await;
    assert_eq!(registry.snapshot(), HashSet::from([endpoint(1)]));

    discovery.add(endpoint(2));
    discovery.remove(endpoint(1));
    tokio::time::sleep(Duration::from_millis(25)).await;
    assert_eq!(registry.snapshot(), HashSet::from([endpoint(2)]));
}

#[tokio::test(start_paused = true)]
async fn discovery_outage_keeps_the_last_known_set() {
    let discovery = InMemoryDiscovery::poll_only();
    discovery.add(endpoint(1));

    let registry = EndpointRegistry::spawn(discovery.clone(), service(), config());

    tokio::time::sleep(Duration::from_millis(25)).await;
    assert_eq!(registry.snapshot(), HashSet::from([endpoint(1)]));

    discovery.set_available(false);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(
        registry.snapshot(),
        HashSet::from([endpoint(1)]),
        "callers tolerate outages on the last known snapshot"
    );
}

#[tokio::test(start_paused = true)]
async fn eager_refresh_resolves_before_first_use() {
    let discovery = InMemoryDiscovery::new();
    discovery.add(endpoint(1));

    let registry = EndpointRegistry::spawn(
        discovery,
        service(),
        RegistryConfig {
            // A probe interval long enough that only an explicit refresh
            // can explain a populated snapshot.
            probe_interval: Duration::from_secs(3600),
            ..RegistryConfig::default()
        },
    );

    registry.refresh().await.unwrap();
    assert_eq!(registry.snapshot(), HashSet::from([endpoint(1)]));
}
