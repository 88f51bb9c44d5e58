use async_trait::async_trait;
use futures::future::{self, Ready};
use grpc_framework::admission::AdmissionGate;
use grpc_framework::auth::{Authenticator, Identity, RoleManager};
use grpc_framework::pipeline::{CallContext, CallKind, CallTrace, ChainBuilder, PipelineLayer};
use grpc_framework::{
    AuthError, CallContextExt, CallerTokenBuckets, LifecycleGuard, PhaseState, ServerConfig,
    ServerConfigBuilder, TokenBucket, from_fn,
};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tonic::body::Body;
use tonic::codegen::http::{Request, Response};
use tonic::{Code, Status};
use tower::util::BoxCloneService;
use tower::{Service, ServiceBuilder, ServiceExt};

const UNARY: &str = "/test.Echo/Get";
const STREAMING: &str = "/test.Echo/Watch";

/// Handler that counts invocations and returns the call context it saw.
#[derive(Clone, Default)]
struct Echo {
    hits: Arc<AtomicUsize>,
}

impl Service<Request<Body>> for Echo {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = Ready<Result<Response<Body>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        self.hits.fetch_add(1, Ordering::SeqCst);
        let mut response = Response::new(Body::empty());
        if let Some(context) = request.call_context() {
            response.extensions_mut().insert(context.clone());
        }
        future::ok(response)
    }
}

struct CountingAuthenticator {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Authenticator for CountingAuthenticator {
    async fn validate(&self, _token: &str) -> Result<Identity, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Identity::new("iss-a", "alice").with_roles(["user"]))
    }
}

struct CountingRoles {
    allow: bool,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl RoleManager for CountingRoles {
    async fn authorize(&self, _identity: &Identity, method: &str) -> Result<(), AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.allow {
            Ok(())
        } else {
            Err(AuthError::Denied {
                reason: format!("{method} denied"),
            })
        }
    }
}

#[derive(Default)]
struct Counters {
    handler: Arc<AtomicUsize>,
    authenticate: Arc<AtomicUsize>,
    authorize: Arc<AtomicUsize>,
}

impl Counters {
    fn all_zero(&self) -> bool {
        self.handler.load(Ordering::SeqCst) == 0
            && self.authenticate.load(Ordering::SeqCst) == 0
            && self.authorize.load(Ordering::SeqCst) == 0
    }

    fn authenticated(&self, builder: ServerConfigBuilder, allow: bool) -> ServerConfigBuilder {
        builder
            .authenticator(
                "iss-a",
                CountingAuthenticator {
                    calls: self.authenticate.clone(),
                },
            )
            .role_manager(CountingRoles {
                allow,
                calls: self.authorize.clone(),
            })
    }
}

struct Harness {
    guard: LifecycleGuard,
    service: BoxCloneService<Request<Body>, Response<Body>, Infallible>,
}

impl Harness {
    fn new(config: &ServerConfig, handler: Echo) -> Self {
        let guard = LifecycleGuard::new();
        let kinds = HashMap::from([(STREAMING.to_string(), CallKind::Streaming)]);
        let pipeline = Arc::new(ChainBuilder::from_config(config, guard.clone()).build(kinds));

        let service = ServiceBuilder::new()
            .option_layer(AdmissionGate::layer(config.rate_limiters()))
            .layer(PipelineLayer::new(pipeline))
            .service(handler);

        Self {
            guard,
            service: BoxCloneService::new(service),
        }
    }

    async fn call(&self, request: Request<Body>) -> Response<Body> {
        self.service.clone().oneshot(request).await.unwrap()
    }
}

#[derive(serde::Serialize)]
struct Claims<'a> {
    iss: &'a str,
    sub: &'a str,
}

fn token_for(issuer: &str) -> String {
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &Claims {
            iss: issuer,
            sub: "alice",
        },
        &jsonwebtoken::EncodingKey::from_secret(b"test-secret"),
    )
    .unwrap()
}

fn call(method: &str, kind: CallKind, issuer: Option<&str>) -> (Request<Body>, CallTrace) {
    let trace = CallTrace::default();
    let mut builder = Request::builder().uri(method);
    if let Some(issuer) = issuer {
        builder = builder.header("authorization", format!("Bearer {}", token_for(issuer)));
    }
    let mut request = builder.body(Body::empty()).unwrap();
    request
        .extensions_mut()
        .insert(CallContext::new(method, kind).with_trace(trace.clone()));
    (request, trace)
}

fn code(response: &Response<Body>) -> Code {
    Status::from_header_map(response.headers())
        .map(|status| status.code())
        .unwrap_or(Code::Ok)
}

fn base() -> ServerConfigBuilder {
    ServerConfig::builder().address("127.0.0.1:0")
}

#[tokio::test]
async fn unauthenticated_server_runs_extensions_last() {
    let handler = Echo::default();
    let config = base()
        .unary_interceptor(from_fn("X", |_| Ok(())))
        .build()
        .unwrap();
    let harness = Harness::new(&config, handler.clone());

    let (request, trace) = call(UNARY, CallKind::Unary, None);
    let response = harness.call(request).await;

    assert_eq!(code(&response), Code::Ok);
    assert_eq!(trace.stages(), vec!["guard", "correlation", "log", "metrics", "X"]);
    assert_eq!(handler.hits.load(Ordering::SeqCst), 1);
    assert!(response.headers().contains_key("x-correlation-id"));
}

#[tokio::test]
async fn authenticated_unary_order() {
    let counters = Counters::default();
    let config = counters
        .authenticated(base(), true)
        .unary_interceptor(from_fn("X", |_| Ok(())))
        .build()
        .unwrap();
    let harness = Harness::new(
        &config,
        Echo {
            hits: counters.handler.clone(),
        },
    );

    let (request, trace) = call(UNARY, CallKind::Unary, Some("iss-a"));
    let response = harness.call(request).await;

    assert_eq!(code(&response), Code::Ok);
    assert_eq!(
        trace.stages(),
        vec!["guard", "correlation", "authenticate", "authorize", "log", "metrics", "X"]
    );
    let context = response.extensions().get::<CallContext>().unwrap();
    assert_eq!(context.identity().unwrap().subject, "alice");
    assert!(context.correlation_id().is_some());
}

#[tokio::test]
async fn authenticated_streaming_order_skips_correlation() {
    let counters = Counters::default();
    let config = counters
        .authenticated(base(), true)
        .unary_interceptor(from_fn("X", |_| Ok(())))
        .stream_interceptor(from_fn("S", |_| Ok(())))
        .build()
        .unwrap();
    let harness = Harness::new(
        &config,
        Echo {
            hits: counters.handler.clone(),
        },
    );

    let (request, trace) = call(STREAMING, CallKind::Streaming, Some("iss-a"));
    let response = harness.call(request).await;

    assert_eq!(code(&response), Code::Ok);
    assert_eq!(
        trace.stages(),
        vec!["guard", "authenticate", "authorize", "log", "metrics", "S"]
    );
}

#[tokio::test]
async fn unknown_issuer_stops_after_authenticate() {
    let counters = Counters::default();
    let config = counters.authenticated(base(), true).build().unwrap();
    let harness = Harness::new(
        &config,
        Echo {
            hits: counters.handler.clone(),
        },
    );

    let (request, trace) = call(UNARY, CallKind::Unary, Some("iss-b"));
    let response = harness.call(request).await;

    assert_eq!(code(&response), Code::Unauthenticated);
    assert_eq!(trace.stages(), vec!["guard", "correlation", "authenticate"]);
    assert!(counters.all_zero());
}

#[tokio::test]
async fn role_denial_never_reaches_handler() {
    let counters = Counters::default();
    let config = counters.authenticated(base(), false).build().unwrap();
    let harness = Harness::new(
        &config,
        Echo {
            hits: counters.handler.clone(),
        },
    );

    let (request, trace) = call(UNARY, CallKind::Unary, Some("iss-a"));
    let response = harness.call(request).await;

    assert_eq!(code(&response), Code::PermissionDenied);
    assert_eq!(
        trace.stages(),
        vec!["guard", "correlation", "authenticate", "authorize"]
    );
    assert_eq!(counters.authorize.load(Ordering::SeqCst), 1);
    assert_eq!(counters.handler.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn exhausted_global_limiter_rejects_before_pipeline() {
    let counters = Counters::default();
    let config = counters
        .authenticated(base(), true)
        .rate_limiter(TokenBucket::new(0.0, 0))
        .build()
        .unwrap();
    let harness = Harness::new(
        &config,
        Echo {
            hits: counters.handler.clone(),
        },
    );

    for kind in [CallKind::Unary, CallKind::Streaming] {
        let (request, trace) = call(UNARY, kind, Some("iss-a"));
        let response = harness.call(request).await;

        assert_eq!(code(&response), Code::ResourceExhausted);
        assert!(trace.stages().is_empty());
    }
    assert!(counters.all_zero());
}

#[tokio::test]
async fn per_caller_limiter_is_keyed_by_address() {
    let handler = Echo::default();
    let config = base()
        .caller_rate_limiter(CallerTokenBuckets::new(0.0, 1))
        .build()
        .unwrap();
    let harness = Harness::new(&config, handler.clone());

    let from = |addr: SocketAddr| {
        let (mut request, _) = call(UNARY, CallKind::Unary, None);
        request.extensions_mut().insert(addr);
        request
    };
    let first: SocketAddr = "192.0.2.1:5000".parse().unwrap();
    let second: SocketAddr = "192.0.2.2:5000".parse().unwrap();

    assert_eq!(code(&harness.call(from(first)).await), Code::Ok);
    assert_eq!(
        code(&harness.call(from(first)).await),
        Code::ResourceExhausted
    );
    assert_eq!(code(&harness.call(from(second)).await), Code::Ok);
    assert_eq!(handler.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn calls_wait_for_open_configuration_transaction() {
    let handler = Echo::default();
    let config = base().build().unwrap();
    let harness = Harness::new(&config, handler.clone());

    let txn = harness.guard.begin().await;
    let pending = {
        let service = harness.service.clone();
        tokio::spawn(async move {
            let (request, _) = call(UNARY, CallKind::Unary, None);
            service.oneshot(request).await.unwrap()
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());
    assert_eq!(handler.hits.load(Ordering::SeqCst), 0);

    txn.commit(PhaseState::Running);
    let response = pending.await.unwrap();
    let context = response.extensions().get::<CallContext>().unwrap();
    assert_eq!(context.generation(), Some(1));
    assert_eq!(handler.hits.load(Ordering::SeqCst), 1);
}

#[test]
fn authenticators_without_role_manager_fail_to_build() {
    let result = base()
        .authenticator(
            "iss-a",
            CountingAuthenticator {
                calls: Arc::default(),
            },
        )
        .build();
    assert!(matches!(
        result,
        Err(grpc_framework::Error::Configuration { .. })
    ));
}
