//! Built-in pipeline stages.

use super::{CallContextExt, CallKind, CallResult, Interceptor, Next};
use crate::guard::LifecycleGuard;
use crate::telemetry;
use futures::future::BoxFuture;
use std::time::Instant;
use tonic::body::Body;
use tonic::codegen::http::{HeaderValue, Request};
use tonic::{Code, Status};
use tracing::Instrument;

/// Metadata key carrying the correlation id.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Component name attached to correlation spans.
pub const CORRELATION_ORIGIN: &str = "grpc-framework";

/// Holds a [`RequestPermit`](crate::guard::RequestPermit) for the downstream
/// passage of the call, so configuration transactions never overlap it.
pub struct GuardInterceptor {
    guard: LifecycleGuard,
}

impl GuardInterceptor {
    pub fn new(guard: LifecycleGuard) -> Self {
        Self { guard }
    }
}

impl Interceptor for GuardInterceptor {
    fn name(&self) -> &'static str {
        "guard"
    }

    fn intercept<'a>(&'a self, mut call: Request<Body>, next: Next<'a>) -> BoxFuture<'a, CallResult> {
        Box::pin(async move {
            let permit = self.guard.admit().await;
            if let Some(context) = call.call_context_mut() {
                context.set_generation(permit.generation());
            }
            let result = next.run(call).await;
            drop(permit);
            result
        })
    }
}

/// Tags unary calls with a correlation id.
///
/// An id supplied by the caller in [`CORRELATION_HEADER`] is kept, otherwise
/// a v4 UUID is generated. The id is stored in the call context, echoed in the
/// response headers and attached to a span wrapping the rest of the chain.
#[derive(Debug, Default)]
pub struct CorrelationInterceptor;

impl Interceptor for CorrelationInterceptor {
    fn name(&self) -> &'static str {
        "correlation"
    }

    fn intercept<'a>(&'a self, mut call: Request<Body>, next: Next<'a>) -> BoxFuture<'a, CallResult> {
        let id = call
            .headers()
            .get(CORRELATION_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if let Some(context) = call.call_context_mut() {
            context.set_correlation_id(id.clone());
        }
        let span = tracing::info_span!(
            "correlation",
            correlation_id = %id,
            origin = CORRELATION_ORIGIN,
            method = %call.uri().path(),
        );

        Box::pin(
            async move {
                let echo = HeaderValue::from_str(&id).ok();
                let mut result = next.run(call).await;
                if let (Ok(response), Some(echo)) = (&mut result, echo) {
                    response.headers_mut().insert(CORRELATION_HEADER, echo);
                }
                result
            }
            .instrument(span),
        )
    }
}

/// Emits one record per call: on `grpc_framework::audit` when the caller was
/// authenticated, on `grpc_framework::access` otherwise.
#[derive(Debug, Default)]
pub struct LoggingInterceptor;

impl Interceptor for LoggingInterceptor {
    fn name(&self) -> &'static str {
        "log"
    }

    fn intercept<'a>(&'a self, call: Request<Body>, next: Next<'a>) -> BoxFuture<'a, CallResult> {
        Box::pin(async move {
            let method = call.uri().path().to_owned();
            let (kind, remote, user) = match call.call_context() {
                Some(context) => (
                    context.kind(),
                    context.remote_addr().map(|addr| addr.to_string()),
                    context.identity().map(|identity| identity.username().to_owned()),
                ),
                None => (CallKind::Unary, None, None),
            };
            let remote = remote.as_deref().unwrap_or("local");

            let started = Instant::now();
            let result = next.run(call).await;
            let code = status_code(&result);
            let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;

            match &user {
                Some(user) => tracing::info!(
                    target: "grpc_framework::audit",
                    %method,
                    %kind,
                    %user,
                    %remote,
                    code = ?code,
                    elapsed_ms,
                    "call"
                ),
                None => tracing::info!(
                    target: "grpc_framework::access",
                    %method,
                    %kind,
                    %remote,
                    code = ?code,
                    elapsed_ms,
                    "call"
                ),
            }
            result
        })
    }
}

/// Records call counts and latency.
#[derive(Debug, Default)]
pub struct MetricsInterceptor;

impl Interceptor for MetricsInterceptor {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn intercept<'a>(&'a self, call: Request<Body>, next: Next<'a>) -> BoxFuture<'a, CallResult> {
        Box::pin(async move {
            let method = call.uri().path().to_owned();
            let kind = call
                .call_context()
                .map(|context| context.kind())
                .unwrap_or_default();
            if kind == CallKind::Streaming {
                telemetry::record_stream_started(&method);
            }

            let started = Instant::now();
            let result = next.run(call).await;
            let kind = match kind {
                CallKind::Unary => "unary",
                CallKind::Streaming => "streaming",
            };
            telemetry::record_call(&method, kind, status_code(&result), started.elapsed());
            result
        })
    }
}

/// gRPC status of a call result. Trailers-only error responses carry the
/// status in the headers; anything else is reported as `Ok`.
pub fn status_code(result: &CallResult) -> Code {
    match result {
        Ok(response) => Status::from_header_map(response.headers())
            .map(|status| status.code())
            .unwrap_or(Code::Ok),
        Err(status) => status.code(),
    }
}
