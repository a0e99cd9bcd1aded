use staffetta::{EndpointRegistry, HealthConfig, HealthFilter, RegistryConfig, ServiceName};
use std::net::SocketAddr;
use tests::discovery::InMemoryDiscovery;
use tests::probe::ScriptedProbe;
use tokio::time::Duration;

fn service() -> ServiceName {
    ServiceName::new("pkg.Tester").unwrap()
}

fn endpoint(last_octet: u8) -> SocketAddr {
    format!("10.0.0.{last_octet}:5000").parse().unwrap()
}

fn fast_health() -> HealthConfig {
    HealthConfig {
        check_interval: Duration::from_millis(10),
        check_timeout: Duration::from_millis(50),
        unhealthy_threshold: 3,
        healthy_threshold: 2,
    }
}

fn registry(discovery: InMemoryDiscovery) -> EndpointRegistry {
    EndpointRegistry::spawn(
        discovery,
        service(),
        RegistryConfig {
            probe_interval: Duration::from_millis(10),
            ..RegistryConfig::default()
        },
    )
}

#[tokio::test(start_paused = true)]
async fn endpoints_start_healthy() {
    let discovery = InMemoryDiscovery::new();
    discovery.add(endpoint(1));

    let registry = registry(discovery);
    let filter = HealthFilter::spawn(&registry, ScriptedProbe::passing(), fast_health());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(filter.is_healthy(endpoint(1)));
    assert_eq!(filter.healthy_snapshot(), vec![endpoint(1)]);
}

#[tokio::test(start_paused = true)]
async fn consecutive_failures_demote_an_endpoint() {
    let discovery = InMemoryDiscovery::new();
    discovery.add(endpoint(1));

    let probe = ScriptedProbe::passing();
    let registry = registry(discovery);
    let filter = HealthFilter::spawn(&registry, probe.clone(), fast_health());
    let mut transitions = filter.subscribe();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(filter.is_healthy(endpoint(1)));

    probe.set(endpoint(1), false);

    // One or two failures are not enough...
    tokio::time::sleep(Duration::from_millis(15)).await;
    assert!(filter.is_healthy(endpoint(1)), "hysteresis must absorb early failures");

    // ...but the third crossing of the threshold demotes the endpoint.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!filter.is_healthy(endpoint(1)));
    assert!(filter.healthy_snapshot().is_empty());

    let transition = transitions.recv().await.unwrap();
    assert_eq!(transition.addr, endpoint(1));
    assert!(!transition.healthy);
}

#[tokio::test(start_paused = true)]
async fn consecutive_successes_promote_an_endpoint_back() {
    let discovery = InMemoryDiscovery::new();
    discovery.add(endpoint(1));

    let probe = ScriptedProbe::failing();
    let registry = registry(discovery);
    let filter = HealthFilter::spawn(&registry, probe.clone(), fast_health());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!filter.is_healthy(endpoint(1)));

    probe.set(endpoint(1), true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(filter.is_healthy(endpoint(1)));
}

#[tokio::test(start_paused = true)]
async fn a_single_blip_does_not_flap() {
    let discovery = InMemoryDiscovery::new();
    discovery.add(endpoint(1));

    let probe = ScriptedProbe::passing();
    let registry = registry(discovery);
    let filter = HealthFilter::spawn(&registry, probe.clone(), fast_health());

    tokio::time::sleep(Duration::from_millis(50)).await;

    // Fail exactly one check, then recover.
    probe.set(endpoint(1), false);
    tokio::time::sleep(Duration::from_millis(10)).await;
    probe.set(endpoint(1), true);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(filter.is_healthy(endpoint(1)));
}

#[tokio::test(start_paused = true)]
async fn removed_endpoints_stop_being_checked() {
    let discovery = InMemoryDiscovery::new();
    discovery.add(endpoint(1));
    discovery.add(endpoint(2));

    let registry = registry(discovery.clone());
    let filter = HealthFilter::spawn(&registry, ScriptedProbe::passing(), fast_health());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(filter.healthy_snapshot(), vec![endpoint(1), endpoint(2)]);

    discovery.remove(endpoint(1));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(filter.healthy_snapshot(), vec![endpoint(2)]);
    assert!(!filter.is_healthy(endpoint(1)));
}

#[tokio::test(start_paused = true)]
async fn ready_resolves_once_any_endpoint_is_healthy() {
    let discovery = InMemoryDiscovery::new();

    let registry = registry(discovery.clone());
    let filter = HealthFilter::spawn(&registry, ScriptedProbe::passing(), fast_health());

    let ready = filter.ready();
    tokio::pin!(ready);

    // Nothing registered yet: ready must still be pending.
    assert!(futures::poll!(ready.as_mut()).is_pending());

    discovery.add(endpoint(1));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(futures::poll!(ready.as_mut()).is_ready());
}
