use staffetta::{GrpcHealthProbe, HealthProbe};
use tests::health_server::TestHealthServer;
use tokio::time::Duration;

fn probe(service: &str) -> GrpcHealthProbe {
    GrpcHealthProbe::new(service, Duration::from_secs(1), Duration::from_secs(1))
}

#[tokio::test]
async fn serving_endpoint_passes_the_check() {
    let mut server = TestHealthServer::start().await;
    server.set_serving("").await;

    probe("").check(server.addr()).await.expect("check failed");

    server.shutdown_sync().await;
}

#[tokio::test]
async fn not_serving_endpoint_fails_the_check() {
    let mut server = TestHealthServer::start().await;
    server.set_not_serving("").await;

    assert!(probe("").check(server.addr()).await.is_err());

    server.shutdown_sync().await;
}

#[tokio::test]
async fn per_service_status_is_respected() {
    let mut server = TestHealthServer::start().await;
    server.set_serving("pkg.Tester").await;

    probe("pkg.Tester")
        .check(server.addr())
        .await
        .expect("check failed");

    server.set_not_serving("pkg.Tester").await;
    assert!(probe("pkg.Tester").check(server.addr()).await.is_err());

    server.shutdown_sync().await;
}

#[tokio::test]
async fn unreachable_endpoint_fails_the_check() {
    let server = TestHealthServer::start().await;
    let addr = server.addr();
    server.shutdown_sync().await;

    assert!(probe("").check(addr).await.is_err());
}
