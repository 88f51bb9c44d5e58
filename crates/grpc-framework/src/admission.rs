//! Admission gate consulted before any interceptor runs.
//!
//! The gate sits outside the pipeline as a tower layer: a rejected call gets a
//! `RESOURCE_EXHAUSTED` response straight away and never reaches the lifecycle
//! guard, the auth stages or the handler. It is applied once per HTTP/2
//! request, which is once per unary call and once per stream.
//!
//! The global limiter is checked first. The per-caller limiter runs second,
//! keyed by the network origin of the call (see [`CallerKey`]), since no
//! identity has been resolved at this point.

use crate::config::RateLimiterConfig;
use crate::error::Error;
use crate::pipeline::layer::status_response;
use crate::rate_limit::CallerKey;
use crate::telemetry::{self, RejectionScope};
use futures::future::{self, Either, Ready};
use std::net::SocketAddr;
use std::task::{Context, Poll};
use tonic::body::Body;
use tonic::codegen::http::{Request, Response};
use tonic::transport::server::TcpConnectInfo;
use tower::{Layer, Service};

/// The limiter pair plus the decision logic.
#[derive(Clone, Debug, Default)]
pub struct AdmissionGate {
    limiters: RateLimiterConfig,
}

impl AdmissionGate {
    pub fn new(limiters: RateLimiterConfig) -> Self {
        Self { limiters }
    }

    /// `None` when no limiter is configured and the gate would admit
    /// everything.
    pub fn layer(limiters: &RateLimiterConfig) -> Option<AdmissionLayer> {
        limiters.is_configured().then(|| AdmissionLayer {
            gate: Self::new(limiters.clone()),
        })
    }

    /// Decides whether a call from `caller` may proceed.
    pub fn admit(&self, caller: &CallerKey) -> Result<(), Error> {
        if let Some(global) = &self.limiters.global {
            if !global.allow() {
                tracing::debug!(%caller, "global rate limit exceeded");
                telemetry::record_admission_rejected(RejectionScope::Global);
                return Err(Error::ResourceExhausted);
            }
        }

        if let Some(per_caller) = &self.limiters.per_caller {
            if !per_caller.allow(caller) {
                tracing::debug!(%caller, "per-caller rate limit exceeded");
                telemetry::record_admission_rejected(RejectionScope::Caller);
                return Err(Error::ResourceExhausted);
            }
        }

        Ok(())
    }
}

/// Peer address of a call: tonic's TCP connection info, or a plain
/// `SocketAddr` extension set by a custom transport.
pub fn remote_addr<B>(request: &Request<B>) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<TcpConnectInfo>()
        .and_then(TcpConnectInfo::remote_addr)
        .or_else(|| request.extensions().get::<SocketAddr>().copied())
}

/// Per-caller key of a call. Peers without an address share
/// [`CallerKey::Local`].
pub fn caller_key<B>(request: &Request<B>) -> CallerKey {
    remote_addr(request).map_or(CallerKey::Local, |addr| CallerKey::Addr(addr.ip()))
}

#[derive(Clone, Debug)]
pub struct AdmissionLayer {
    gate: AdmissionGate,
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = Admission<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Admission {
            inner,
            gate: self.gate.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Admission<S> {
    inner: S,
    gate: AdmissionGate,
}

impl<S> Service<Request<Body>> for Admission<S>
where
    S: Service<Request<Body>, Response = Response<Body>>,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = Either<Ready<Result<Response<Body>, S::Error>>, S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        match self.gate.admit(&caller_key(&request)) {
            Ok(()) => Either::Right(self.inner.call(request)),
            Err(e) => Either::Left(future::ok(status_response(e.into()))),
        }
    }
}
