//! Server configuration.
//!
//! A [`ServerConfig`] is assembled with [`ServerConfigBuilder`], validated once
//! by [`ServerConfigBuilder::build`] and immutable afterwards. Every option is
//! independent except one: registering an authenticator requires a role
//! manager.

use crate::auth::{Authenticator, AuthenticatorRegistry, RoleManager};
use crate::error::{Error, Result};
use crate::pipeline::Interceptor;
use crate::rate_limit::{
    CallerRateLimiter, CallerTokenBuckets, DEFAULT_CALLER_RATE_LIMIT, DEFAULT_RATE_LIMIT,
    RateLimiter, TokenBucket,
};
use crate::server::ServiceRegistry;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Callback registering services into the server's router.
pub type Registration = Arc<dyn Fn(&mut ServiceRegistry) + Send + Sync>;

/// Adjusts the underlying tonic server builder: timeouts, concurrency and
/// HTTP/2 keepalive settings, message limits.
pub type ServerOption =
    Arc<dyn Fn(tonic::transport::Server) -> tonic::transport::Server + Send + Sync>;

/// Kind of listener the server binds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportKind {
    #[default]
    Tcp,
    /// Unix domain socket; the address is a filesystem path.
    Unix,
}

impl TransportKind {
    /// Local transports never load TLS material.
    pub fn is_local(self) -> bool {
        matches!(self, TransportKind::Unix)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Unix => "unix",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportKind::Tcp),
            "unix" | "uds" => Ok(TransportKind::Unix),
            other => Err(Error::configuration(format!(
                "unknown transport kind {other:?}"
            ))),
        }
    }
}

/// PEM certificate chain and private key paths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl TlsConfig {
    pub fn new(cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        Self {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
        }
    }
}

/// The global and per-caller limiters. Either may be absent.
#[derive(Clone, Default)]
pub struct RateLimiterConfig {
    pub global: Option<Arc<dyn RateLimiter>>,
    pub per_caller: Option<Arc<dyn CallerRateLimiter>>,
}

impl RateLimiterConfig {
    pub fn is_configured(&self) -> bool {
        self.global.is_some() || self.per_caller.is_some()
    }
}

impl fmt::Debug for RateLimiterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiterConfig")
            .field("global", &self.global.is_some())
            .field("per_caller", &self.per_caller.is_some())
            .finish()
    }
}

/// Frozen server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    name: String,
    transport: TransportKind,
    address: String,
    tls: Option<TlsConfig>,
    authenticators: Arc<AuthenticatorRegistry>,
    role_manager: Option<Arc<dyn RoleManager>>,
    rate_limiters: RateLimiterConfig,
    unary_interceptors: Vec<Arc<dyn Interceptor>>,
    stream_interceptors: Vec<Arc<dyn Interceptor>>,
    registrations: Vec<Registration>,
    server_options: Vec<ServerOption>,
    health: bool,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn tls(&self) -> Option<&TlsConfig> {
        self.tls.as_ref()
    }

    pub fn authenticators(&self) -> &Arc<AuthenticatorRegistry> {
        &self.authenticators
    }

    pub fn role_manager(&self) -> Option<&Arc<dyn RoleManager>> {
        self.role_manager.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        !self.authenticators.is_empty()
    }

    pub fn rate_limiters(&self) -> &RateLimiterConfig {
        &self.rate_limiters
    }

    pub fn unary_interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.unary_interceptors
    }

    pub fn stream_interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.stream_interceptors
    }

    pub(crate) fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    /// Applies the server options in registration order.
    pub(crate) fn apply_server_options(
        &self,
        builder: tonic::transport::Server,
    ) -> tonic::transport::Server {
        self.server_options
            .iter()
            .fold(builder, |builder, option| option(builder))
    }

    pub fn health_enabled(&self) -> bool {
        self.health
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |stages: &[Arc<dyn Interceptor>]| -> Vec<&'static str> {
            stages.iter().map(|stage| stage.name()).collect()
        };
        f.debug_struct("ServerConfig")
            .field("name", &self.name)
            .field("transport", &self.transport)
            .field("address", &self.address)
            .field("tls", &self.tls)
            .field("issuers", &self.authenticators.keys().collect::<Vec<_>>())
            .field("role_manager", &self.role_manager.is_some())
            .field("rate_limiters", &self.rate_limiters)
            .field("unary_interceptors", &names(&self.unary_interceptors))
            .field("stream_interceptors", &names(&self.stream_interceptors))
            .field("registrations", &self.registrations.len())
            .field("server_options", &self.server_options.len())
            .field("health", &self.health)
            .finish()
    }
}

pub struct ServerConfigBuilder {
    name: Option<String>,
    transport: TransportKind,
    address: String,
    tls: Option<TlsConfig>,
    authenticators: AuthenticatorRegistry,
    role_manager: Option<Arc<dyn RoleManager>>,
    rate_limiters: RateLimiterConfig,
    unary_interceptors: Vec<Arc<dyn Interceptor>>,
    stream_interceptors: Vec<Arc<dyn Interceptor>>,
    registrations: Vec<Registration>,
    server_options: Vec<ServerOption>,
    health: bool,
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        Self {
            name: None,
            transport: TransportKind::default(),
            address: String::new(),
            tls: None,
            authenticators: AuthenticatorRegistry::new(),
            role_manager: None,
            rate_limiters: RateLimiterConfig::default(),
            unary_interceptors: Vec::new(),
            stream_interceptors: Vec::new(),
            registrations: Vec::new(),
            server_options: Vec::new(),
            health: true,
        }
    }
}

impl ServerConfigBuilder {
    /// Name used in logs and lifecycle errors. Defaults to
    /// `grpc-framework-<transport>`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// `host:port` for TCP, a socket path for Unix.
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Registers the authenticator for tokens whose `iss` equals `issuer`.
    /// A later registration for the same issuer replaces the earlier one.
    pub fn authenticator(
        mut self,
        issuer: impl Into<String>,
        authenticator: impl Authenticator + 'static,
    ) -> Self {
        self.authenticators
            .insert(issuer.into(), Arc::new(authenticator));
        self
    }

    pub fn role_manager(mut self, role_manager: impl RoleManager + 'static) -> Self {
        self.role_manager = Some(Arc::new(role_manager));
        self
    }

    pub fn rate_limiter(mut self, limiter: impl RateLimiter + 'static) -> Self {
        self.rate_limiters.global = Some(Arc::new(limiter));
        self
    }

    pub fn caller_rate_limiter(mut self, limiter: impl CallerRateLimiter + 'static) -> Self {
        self.rate_limiters.per_caller = Some(Arc::new(limiter));
        self
    }

    /// Installs token buckets using [`DEFAULT_RATE_LIMIT`] and
    /// [`DEFAULT_CALLER_RATE_LIMIT`].
    pub fn with_default_rate_limiters(self) -> Self {
        let (rate, burst) = DEFAULT_RATE_LIMIT;
        let (caller_rate, caller_burst) = DEFAULT_CALLER_RATE_LIMIT;
        self.rate_limiter(TokenBucket::new(rate, burst))
            .caller_rate_limiter(CallerTokenBuckets::new(caller_rate, caller_burst))
    }

    /// Appends an interceptor to the unary chain, after the built-in stages.
    pub fn unary_interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.unary_interceptors.push(Arc::new(interceptor));
        self
    }

    /// Appends an interceptor to the streaming chain, after the built-in
    /// stages.
    pub fn stream_interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.stream_interceptors.push(Arc::new(interceptor));
        self
    }

    /// Adds a callback run on every start to register services.
    pub fn register_services<F>(mut self, register: F) -> Self
    where
        F: Fn(&mut ServiceRegistry) + Send + Sync + 'static,
    {
        self.registrations.push(Arc::new(register));
        self
    }

    /// Adds an option applied to the tonic server builder on every start,
    /// before TLS and the request layers. Options run in the order added.
    ///
    /// ```
    /// # use grpc_framework::ServerConfig;
    /// # use std::time::Duration;
    /// let config = ServerConfig::builder()
    ///     .address("127.0.0.1:50051")
    ///     .server_option(|server| server.timeout(Duration::from_secs(30)))
    ///     .server_option(|server| server.http2_keepalive_interval(Some(Duration::from_secs(60))))
    ///     .build();
    /// assert!(config.is_ok());
    /// ```
    pub fn server_option<F>(mut self, option: F) -> Self
    where
        F: Fn(tonic::transport::Server) -> tonic::transport::Server + Send + Sync + 'static,
    {
        self.server_options.push(Arc::new(option));
        self
    }

    /// Enables or disables the `grpc.health.v1.Health` service. On by default.
    pub fn health(mut self, enabled: bool) -> Self {
        self.health = enabled;
        self
    }

    pub fn build(self) -> Result<ServerConfig> {
        if !self.authenticators.is_empty() && self.role_manager.is_none() {
            return Err(Error::configuration(
                "authenticators are registered but no role manager is configured",
            ));
        }
        if self.address.trim().is_empty() {
            return Err(Error::configuration("server address must not be empty"));
        }
        if self.authenticators.keys().any(|issuer| issuer.is_empty()) {
            return Err(Error::configuration("issuer must not be empty"));
        }

        let name = self
            .name
            .unwrap_or_else(|| format!("grpc-framework-{}", self.transport));

        Ok(ServerConfig {
            name,
            transport: self.transport,
            address: self.address,
            tls: self.tls,
            authenticators: Arc::new(self.authenticators),
            role_manager: self.role_manager,
            rate_limiters: self.rate_limiters,
            unary_interceptors: self.unary_interceptors,
            stream_interceptors: self.stream_interceptors,
            registrations: self.registrations,
            server_options: self.server_options,
            health: self.health,
        })
    }
}
