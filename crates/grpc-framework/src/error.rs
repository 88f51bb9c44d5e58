//! Error types for server bootstrap and request handling.
//!
//! This module defines the central [`Error`] enum, which covers both start-time
//! failures (invalid configuration, unreadable TLS material, bind errors) and
//! the per-call rejections raised by the admission gate and the auth stages.
//! It implements `From<Error>` for [`tonic::Status`] so per-call errors
//! propagate to clients with the matching gRPC status code.
//!
//! ## Error Cases
//! - `Configuration`: the server configuration is invalid or incomplete.
//! - `CredentialLoad` / `InvalidCredentials`: TLS material is unreadable or
//!   unusable.
//! - `Bind` / `Transport` / `ServeTask`: the transport could not listen or
//!   serve, or its task died.
//! - `AlreadyRunning` / `NotRunning`: lifecycle misuse by the caller.
//! - `ResourceExhausted`: the admission gate rejected the call.
//! - `Unauthenticated` / `PermissionDenied`: the auth stages rejected the call.

use std::path::PathBuf;
use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the server framework.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configuration violates an invariant. Always fatal to start.
    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },

    /// A TLS certificate or key file could not be read.
    #[error("Failed to read TLS material from {}: {source}", path.display())]
    CredentialLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TLS material was read but rejected when building the acceptor.
    #[error("Failed to create credentials from cert files: {0}")]
    InvalidCredentials(#[source] tonic::transport::Error),

    /// The transport could not bind its listener.
    #[error("Unable to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The transport failed while serving.
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// The serve task panicked or was aborted before it finished draining.
    #[error("Serve task failed: {0}")]
    ServeTask(#[from] tokio::task::JoinError),

    /// `start()` was called on a server that is already running.
    #[error("Server {name} is already running")]
    AlreadyRunning { name: String },

    /// `stop()` was called on a server that is not running.
    #[error("Server {name} is not running")]
    NotRunning { name: String },

    /// The admission gate denied the call.
    #[error("resources for clients exhausted")]
    ResourceExhausted,

    /// The caller's credentials are missing, malformed or not accepted.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(#[source] AuthError),

    /// The caller is authenticated but may not invoke the method.
    #[error("Permission denied: {0}")]
    PermissionDenied(#[source] AuthError),
}

impl Error {
    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::ResourceExhausted => Status::resource_exhausted("resources for clients exhausted"),
            Error::Unauthenticated(e) => Status::unauthenticated(e.to_string()),
            Error::PermissionDenied(e) => Status::permission_denied(e.to_string()),
            Error::Configuration { reason } => Status::failed_precondition(reason),
            Error::AlreadyRunning { name } | Error::NotRunning { name } => {
                Status::failed_precondition(format!("Server {name} lifecycle violation"))
            }
            other => Status::internal(other.to_string()),
        }
    }
}

/// Errors reported by [`Authenticator`]s and [`RoleManager`]s, and by the
/// credential extraction that precedes them.
///
/// [`Authenticator`]: crate::auth::Authenticator
/// [`RoleManager`]: crate::auth::RoleManager
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    /// No bearer token was presented.
    #[error("missing bearer token")]
    MissingCredentials,

    /// The token could not be parsed far enough to read its issuer.
    #[error("malformed token: {reason}")]
    MalformedToken { reason: String },

    /// No authenticator is registered for the token's issuer.
    #[error("no authenticator registered for issuer {issuer}")]
    UnknownIssuer { issuer: String },

    /// The authenticator rejected the token.
    #[error("invalid token: {reason}")]
    InvalidToken { reason: String },

    /// Authorization was requested without a resolved identity.
    #[error("no authenticated identity")]
    MissingIdentity,

    /// The role manager denied access.
    #[error("{reason}")]
    Denied { reason: String },

    /// An authenticator or role manager failed internally.
    #[error("auth backend failure: {reason}")]
    Backend { reason: String },
}
