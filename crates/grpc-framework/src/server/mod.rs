//! Server assembly.
//!
//! [`Server::start`] runs inside one configuration transaction of the
//! [`LifecycleGuard`]: no call is admitted until the server is fully built,
//! and a failure at any step leaves nothing running and no new generation
//! published.

pub mod registry;
pub mod tls;
pub mod transport;

pub use registry::ServiceRegistry;
pub use transport::{Listener, ListenerTransport, ServeFactory, Transport, TransportHandle};

use crate::admission::AdmissionGate;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::guard::{LifecycleGuard, PhaseState};
use crate::pipeline::{ChainBuilder, PipelineLayer};
use crate::telemetry;
use futures::FutureExt;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_stream::wrappers::TcpListenerStream;
use tonic_health::ServingStatus;
use tonic_health::server::HealthReporter;
use tower::ServiceBuilder;

struct Running {
    handle: TransportHandle,
    health: Option<HealthReporter>,
    services: Vec<&'static str>,
}

/// A gRPC server built from a validated [`ServerConfig`].
pub struct Server<T = ListenerTransport> {
    config: Arc<ServerConfig>,
    guard: LifecycleGuard,
    transport: T,
    running: Mutex<Option<Running>>,
}

impl Server<ListenerTransport> {
    /// Server listening on the configured transport and address.
    pub fn new(config: ServerConfig) -> Self {
        let transport = ListenerTransport::from_config(&config);
        Self::with_transport(config, transport)
    }
}

impl<T: Transport> Server<T> {
    pub fn with_transport(config: ServerConfig, transport: T) -> Self {
        Self {
            config: Arc::new(config),
            guard: LifecycleGuard::new(),
            transport,
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        self.config.name()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn guard(&self) -> &LifecycleGuard {
        &self.guard
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Bound TCP address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .as_ref()
            .and_then(|running| running.handle.local_addr())
    }

    /// Builds the pipeline and starts serving.
    ///
    /// Fails with [`Error::AlreadyRunning`] if the server is running, and with
    /// [`Error::CredentialLoad`], [`Error::InvalidCredentials`] or
    /// [`Error::Bind`] if TLS material or the listener cannot be set up.
    pub async fn start(&self) -> Result<()> {
        let txn = self.guard.begin().await;
        let already_running = self.running.lock().is_some();
        if already_running {
            return Err(Error::AlreadyRunning {
                name: self.name().to_owned(),
            });
        }

        let tls = tls::load(&self.config).await?;

        let mut registry = ServiceRegistry::new();
        for register in self.config.registrations() {
            register(&mut registry);
        }
        let health = self.config.health_enabled().then(|| {
            let (reporter, service) = tonic_health::server::health_reporter();
            registry.add_service(service);
            reporter
        });
        telemetry::initialize_service_metrics(registry.services().iter().copied());
        let (routes, services, kinds) = registry.into_parts();

        let pipeline = Arc::new(ChainBuilder::from_config(&self.config, self.guard.clone()).build(kinds));
        let layers = ServiceBuilder::new()
            .option_layer(AdmissionGate::layer(self.config.rate_limiters()))
            .layer(PipelineLayer::new(pipeline));

        let mut builder = self
            .config
            .apply_server_options(tonic::transport::Server::builder());
        if let Some(tls) = tls {
            builder = builder.tls_config(tls).map_err(Error::InvalidCredentials)?;
        }
        let router = builder.layer(layers).add_routes(routes);

        let factory = ServeFactory::new(move |listener, shutdown| match listener {
            Listener::Tcp(listener) => router
                .serve_with_incoming_shutdown(
                    TcpListenerStream::new(listener),
                    shutdown.cancelled_owned(),
                )
                .boxed(),
            #[cfg(unix)]
            Listener::Unix(listener) => router
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    shutdown.cancelled_owned(),
                )
                .boxed(),
        });
        let handle = self.transport.start(factory).await?;

        if let Some(reporter) = &health {
            for service in &services {
                reporter
                    .set_service_status(*service, ServingStatus::Serving)
                    .await;
            }
        }

        *self.running.lock() = Some(Running {
            handle,
            health,
            services,
        });
        let phase = txn.commit(PhaseState::Running);
        tracing::info!(
            server = %self.name(),
            transport = %self.config.transport(),
            address = %self.config.address(),
            generation = phase.generation,
            "server started"
        );
        Ok(())
    }

    /// Stops accepting calls and waits for in-flight calls to drain.
    ///
    /// The transaction only covers the state change; draining happens after
    /// it commits so calls queued on the guard can finish.
    pub async fn stop(&self) -> Result<()> {
        let handle = {
            let txn = self.guard.begin().await;
            let running = self.running.lock().take();
            let Some(running) = running else {
                return Err(Error::NotRunning {
                    name: self.name().to_owned(),
                });
            };

            if let Some(reporter) = &running.health {
                reporter
                    .set_service_status("", ServingStatus::NotServing)
                    .await;
                for service in &running.services {
                    reporter
                        .set_service_status(*service, ServingStatus::NotServing)
                        .await;
                }
            }
            running.handle.cancel();

            let phase = txn.commit(PhaseState::Stopped);
            tracing::info!(server = %self.name(), generation = phase.generation, "server stopping");
            running.handle
        };

        handle.wait().await?;
        tracing::info!(server = %self.name(), "server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsConfig;
    use crate::pipeline::stages::CORRELATION_HEADER;
    use crate::rate_limit::CallerTokenBuckets;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tonic::Code;
    use tonic::transport::Endpoint;
    use tonic_health::pb::HealthCheckRequest;
    use tonic_health::pb::health_check_response::ServingStatus as CheckStatus;
    use tonic_health::pb::health_client::HealthClient;

    /// Transport that counts starts and never binds.
    #[derive(Default)]
    struct CountingTransport {
        starts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn start(&self, _factory: ServeFactory) -> Result<TransportHandle> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let shutdown = CancellationToken::new();
            let token = shutdown.clone();
            let task = tokio::spawn(async move {
                token.cancelled().await;
                Ok(())
            });
            Ok(TransportHandle::new(None, shutdown, task))
        }
    }

    fn config() -> ServerConfig {
        ServerConfig::builder()
            .address("127.0.0.1:0")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let transport = CountingTransport::default();
        let starts = transport.starts.clone();
        let server = Server::with_transport(config(), transport);

        server.start().await.unwrap();
        let err = server.start().await.unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning { .. }));
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(server.guard().try_phase().unwrap().generation, 1);
    }

    #[tokio::test]
    async fn stop_then_start_is_a_new_cycle() {
        let server = Server::with_transport(config(), CountingTransport::default());

        assert!(matches!(server.stop().await, Err(Error::NotRunning { .. })));
        server.start().await.unwrap();
        server.stop().await.unwrap();
        assert!(!server.is_running());
        server.start().await.unwrap();

        let phase = server.guard().try_phase().unwrap();
        assert_eq!(phase.generation, 3);
        assert_eq!(phase.state, PhaseState::Running);
    }

    #[tokio::test]
    async fn tls_failure_happens_before_transport_start() {
        let transport = CountingTransport::default();
        let starts = transport.starts.clone();
        let config = ServerConfig::builder()
            .address("127.0.0.1:0")
            .tls(TlsConfig::new("/nonexistent/cert.pem", "/nonexistent/key.pem"))
            .build()
            .unwrap();
        let server = Server::with_transport(config, transport);

        let err = server.start().await.unwrap_err();
        assert!(matches!(err, Error::CredentialLoad { .. }));
        assert_eq!(starts.load(Ordering::SeqCst), 0);
        assert!(!server.is_running());
        assert_eq!(server.guard().try_phase().unwrap().generation, 0);
    }

    #[tokio::test]
    async fn server_options_apply_on_every_start() {
        let applied = Arc::new(AtomicUsize::new(0));
        let counter = applied.clone();
        let config = ServerConfig::builder()
            .address("127.0.0.1:0")
            .server_option(move |server| {
                counter.fetch_add(1, Ordering::SeqCst);
                server.concurrency_limit_per_connection(32)
            })
            .server_option(|server| server.timeout(Duration::from_secs(5)))
            .build()
            .unwrap();
        let server = Server::with_transport(config, CountingTransport::default());

        server.start().await.unwrap();
        assert_eq!(applied.load(Ordering::SeqCst), 1);
        server.stop().await.unwrap();
        server.start().await.unwrap();
        assert_eq!(applied.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn health_checks_run_through_admission_and_pipeline() {
        let config = ServerConfig::builder()
            .address("127.0.0.1:0")
            .caller_rate_limiter(CallerTokenBuckets::new(0.0, 1))
            .build()
            .unwrap();
        let server = Server::new(config);
        server.start().await.unwrap();

        let addr = server.local_addr().unwrap();
        let channel = Endpoint::from_shared(format!("http://{addr}"))
            .unwrap()
            .connect()
            .await
            .unwrap();
        let mut client = HealthClient::new(channel);

        let response = client
            .check(HealthCheckRequest {
                service: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(response.get_ref().status(), CheckStatus::Serving);
        let correlation_id = response
            .metadata()
            .get(CORRELATION_HEADER)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(uuid::Uuid::parse_str(correlation_id).is_ok());

        // Same peer address, bucket of one: the second call is rejected.
        let err = client
            .check(HealthCheckRequest {
                service: String::new(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);

        server.stop().await.unwrap();
        assert!(server.local_addr().is_none());
    }
}
