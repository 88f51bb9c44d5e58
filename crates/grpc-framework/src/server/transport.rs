//! Listener lifecycle behind the [`Transport`] trait.
//!
//! The server never touches sockets itself. It hands a [`ServeFactory`] to a
//! transport, which binds whatever it listens on, spawns the serve future and
//! returns a [`TransportHandle`] used later for graceful shutdown.

use crate::config::{ServerConfig, TransportKind};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type ServeResult = std::result::Result<(), tonic::transport::Error>;
type ServeFn = Box<dyn FnOnce(Listener, CancellationToken) -> BoxFuture<'static, ServeResult> + Send>;

/// A bound listener ready to be served.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

/// Builds the serve future for a bound listener. The future resolves once the
/// token is cancelled and in-flight connections have drained.
pub struct ServeFactory {
    serve: ServeFn,
}

impl ServeFactory {
    pub fn new<F>(serve: F) -> Self
    where
        F: FnOnce(Listener, CancellationToken) -> BoxFuture<'static, ServeResult> + Send + 'static,
    {
        Self {
            serve: Box::new(serve),
        }
    }

    pub fn serve(self, listener: Listener, shutdown: CancellationToken) -> BoxFuture<'static, ServeResult> {
        (self.serve)(listener, shutdown)
    }
}

impl fmt::Debug for ServeFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServeFactory").finish_non_exhaustive()
    }
}

/// Binds a listener and starts serving on it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn start(&self, factory: ServeFactory) -> Result<TransportHandle>;
}

/// A running serve task.
#[derive(Debug)]
pub struct TransportHandle {
    local_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
    task: JoinHandle<ServeResult>,
    socket_path: Option<PathBuf>,
}

impl TransportHandle {
    pub fn new(
        local_addr: Option<SocketAddr>,
        shutdown: CancellationToken,
        task: JoinHandle<ServeResult>,
    ) -> Self {
        Self {
            local_addr,
            shutdown,
            task,
            socket_path: None,
        }
    }

    /// Socket file removed once the serve task has finished.
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = Some(path.into());
        self
    }

    /// Bound TCP address, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stops accepting new connections. In-flight calls keep running.
    pub fn cancel(&self) {
        self.shutdown.cancel();
    }

    /// Waits for the serve task to finish draining.
    pub async fn wait(self) -> Result<()> {
        let result = self.task.await;

        if let Some(path) = &self.socket_path {
            if let Err(e) = tokio::fs::remove_file(path).await {
                tracing::debug!(path = %path.display(), error = %e, "failed to remove socket file");
            }
        }

        match result {
            Ok(served) => served.map_err(Error::Transport),
            Err(e) => {
                tracing::error!(error = %e, "serve task did not complete");
                Err(Error::ServeTask(e))
            }
        }
    }

    pub async fn shutdown(self) -> Result<()> {
        self.cancel();
        self.wait().await
    }
}

/// Binds TCP or Unix domain socket listeners with Tokio.
#[derive(Clone, Debug)]
pub struct ListenerTransport {
    kind: TransportKind,
    address: String,
}

impl ListenerTransport {
    pub fn new(kind: TransportKind, address: impl Into<String>) -> Self {
        Self {
            kind,
            address: address.into(),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.transport(), config.address())
    }

    fn bind_error(&self, source: std::io::Error) -> Error {
        Error::Bind {
            address: self.address.clone(),
            source,
        }
    }
}

#[async_trait]
impl Transport for ListenerTransport {
    async fn start(&self, factory: ServeFactory) -> Result<TransportHandle> {
        let shutdown = CancellationToken::new();

        match self.kind {
            TransportKind::Tcp => {
                let listener = TcpListener::bind(&self.address)
                    .await
                    .map_err(|e| self.bind_error(e))?;
                let local_addr = listener.local_addr().map_err(|e| self.bind_error(e))?;
                tracing::info!(%local_addr, "listening on tcp");

                let task = tokio::spawn(factory.serve(Listener::Tcp(listener), shutdown.clone()));
                Ok(TransportHandle::new(Some(local_addr), shutdown, task))
            }
            #[cfg(unix)]
            TransportKind::Unix => {
                let listener =
                    tokio::net::UnixListener::bind(&self.address).map_err(|e| self.bind_error(e))?;
                tracing::info!(path = %self.address, "listening on unix socket");

                let task = tokio::spawn(factory.serve(Listener::Unix(listener), shutdown.clone()));
                Ok(TransportHandle::new(None, shutdown, task).with_socket_path(&self.address))
            }
            #[cfg(not(unix))]
            TransportKind::Unix => Err(Error::configuration(
                "Unix domain sockets are not supported on this platform",
            )),
        }
    }
}
