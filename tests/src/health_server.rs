//! Manages construction and destruction of a tonic gRPC server exposing
//! `grpc.health.v1.Health` for testing.

use futures::future::FutureExt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic_health::ServingStatus;
use tonic_health::server::HealthReporter;

/// A real health endpoint on a loopback port, with a reporter to flip its
/// status from tests.
///
/// The server runs asynchronously and is torn down when `Self` is dropped.
pub struct TestHealthServer {
    reporter: HealthReporter,
    addr: SocketAddr,
    shutdown_handle: Option<tokio::sync::oneshot::Sender<()>>,
    server_future: Option<tokio::task::JoinHandle<Result<(), tonic::transport::Error>>>,
}

impl Drop for TestHealthServer {
    fn drop(&mut self) {
        // Gracefully shutdown the gRPC Server.
        if let Some(sender) = self.shutdown_handle.take() {
            let _res = sender.send(());
        }
    }
}

impl TestHealthServer {
    /// Bootstrap a health server on an ephemeral loopback port.
    pub async fn start() -> Self {
        let (reporter, service) = tonic_health::server::health_reporter();

        let (shutdown_handle, shutdown) = tokio::sync::oneshot::channel::<()>();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind tcplistener");
        let addr = listener
            .local_addr()
            .expect("failed to retrieve socketaddr from tokio listener");

        tracing::info!("health server address: {}", addr);

        let server_future = tokio::spawn(
            Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(
                    TcpListenerStream::new(listener),
                    shutdown.map(|_| ()),
                ),
        );

        // await connectivity
        let wait_start = Instant::now();
        while let Err(e) = TcpStream::connect(addr).await {
            if wait_start.elapsed() > Duration::from_secs(10) {
                panic!("Cannot connect to {addr}: {e}");
            }
            tokio::task::yield_now().await;
        }

        TestHealthServer {
            reporter,
            addr,
            shutdown_handle: Some(shutdown_handle),
            server_future: Some(server_future),
        }
    }

    /// The address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Mark `service` as SERVING.
    pub async fn set_serving(&mut self, service: &str) {
        self.reporter
            .set_service_status(service, ServingStatus::Serving)
            .await;
    }

    /// Mark `service` as NOT_SERVING.
    pub async fn set_not_serving(&mut self, service: &str) {
        self.reporter
            .set_service_status(service, ServingStatus::NotServing)
            .await;
    }

    /// Shut the server down and wait for it to exit.
    pub async fn shutdown_sync(mut self) {
        // Gracefully shutdown the gRPC Server.
        if let Some(sender) = self.shutdown_handle.take() {
            let _res = sender.send(());
        }

        if let Some(server_future) = self.server_future.take() {
            server_future
                .await
                .expect("server did not exit gracefully")
                .expect("");
        }
    }
}
