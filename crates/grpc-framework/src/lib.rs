#![doc = include_str!("../README.md")]

pub mod admission;
pub mod auth;
pub mod config;
pub mod error;
pub mod guard;
pub mod pipeline;
pub mod rate_limit;
pub mod server;
pub mod telemetry;

pub use admission::{AdmissionGate, AdmissionLayer};
pub use auth::{Authenticator, Identity, InMemoryRoleManager, RoleManager};
pub use config::{
    RateLimiterConfig, ServerConfig, ServerConfigBuilder, ServerOption, TlsConfig, TransportKind,
};
pub use error::{AuthError, Error, Result};
pub use guard::{LifecycleGuard, Phase, PhaseState};
pub use pipeline::{CallContext, CallContextExt, CallKind, Interceptor, Next, from_fn};
pub use rate_limit::{CallerKey, CallerRateLimiter, CallerTokenBuckets, RateLimiter, TokenBucket};
pub use server::{Server, ServiceRegistry, Transport};
