//! Ordered interceptor chains wrapped around every admitted call.
//!
//! An [`Interceptor`] receives the call and a [`Next`] handle for the rest of
//! the chain. It may inspect or modify the request, short-circuit with a
//! [`Status`], or await `next.run(call)` and inspect the response. Stages run
//! strictly in chain order and the handler is only reached when every stage
//! forwards the call.
//!
//! Per-call state lives in a [`CallContext`] stored in the request extensions.
//! Tonic copies HTTP extensions into [`tonic::Request`] extensions, so service
//! handlers can read the resolved identity and correlation id through
//! [`CallContextExt`].
//!
//! ## Structure
//!
//! - [`builder`] - builds the unary and streaming chains from a
//!   [`ServerConfig`](crate::config::ServerConfig).
//! - [`stages`] - built-in correlation, logging and metrics stages.
//! - [`layer`] - tower glue placing a [`Pipeline`] in front of tonic's router.

pub mod builder;
pub mod layer;
pub mod stages;

use crate::auth::Identity;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tonic::Status;
use tonic::body::Body;
use tonic::codegen::http::{Request, Response};

pub use builder::ChainBuilder;
pub use layer::{PipelineLayer, PipelineService};

/// Outcome of a call as seen by an interceptor.
pub type CallResult = Result<Response<Body>, Status>;

/// Terminal step of a chain: the handler the call is routed to.
pub type Endpoint = Box<dyn FnOnce(Request<Body>) -> BoxFuture<'static, CallResult> + Send>;

/// Whether a method carries a single request/response pair or a stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CallKind {
    #[default]
    Unary,
    Streaming,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallKind::Unary => f.write_str("unary"),
            CallKind::Streaming => f.write_str("streaming"),
        }
    }
}

/// A stage in an interceptor chain.
///
/// Implementations must call `next.run(call)` at most once. Returning without
/// calling it short-circuits the rest of the chain and the handler.
pub trait Interceptor: Send + Sync + 'static {
    /// Stage name recorded in the [`CallTrace`].
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn intercept<'a>(&'a self, call: Request<Body>, next: Next<'a>) -> BoxFuture<'a, CallResult>;
}

/// The remainder of a chain, handed to each [`Interceptor`].
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Interceptor>],
    endpoint: Endpoint,
}

impl<'a> Next<'a> {
    /// Runs the next stage, or the endpoint once the chain is exhausted.
    pub fn run(self, call: Request<Body>) -> BoxFuture<'a, CallResult> {
        match self.remaining.split_first() {
            Some((stage, rest)) => {
                if let Some(context) = call.call_context() {
                    context.trace().record(stage.name());
                }
                stage.intercept(
                    call,
                    Next {
                        remaining: rest,
                        endpoint: self.endpoint,
                    },
                )
            }
            None => (self.endpoint)(call),
        }
    }
}

/// An ordered, immutable sequence of interceptors.
#[derive(Clone, Default)]
pub struct Chain {
    stages: Vec<Arc<dyn Interceptor>>,
}

impl Chain {
    pub fn new(stages: Vec<Arc<dyn Interceptor>>) -> Self {
        Self { stages }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage names in execution order.
    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Runs `call` through every stage and then `endpoint`.
    pub async fn dispatch(&self, call: Request<Body>, endpoint: Endpoint) -> CallResult {
        Next {
            remaining: &self.stages,
            endpoint,
        }
        .run(call)
        .await
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// The unary and streaming chains of one start cycle, plus the method kinds
/// declared at service registration.
#[derive(Debug, Default)]
pub struct Pipeline {
    unary: Chain,
    streaming: Chain,
    kinds: HashMap<String, CallKind>,
}

impl Pipeline {
    pub fn new(unary: Chain, streaming: Chain, kinds: HashMap<String, CallKind>) -> Self {
        Self {
            unary,
            streaming,
            kinds,
        }
    }

    pub fn unary(&self) -> &Chain {
        &self.unary
    }

    pub fn streaming(&self) -> &Chain {
        &self.streaming
    }

    /// Kind declared for `method`; undeclared methods are unary.
    pub fn kind_of(&self, method: &str) -> CallKind {
        match self.kinds.get(method) {
            Some(kind) => *kind,
            None => {
                tracing::debug!(%method, "method not declared streaming, using unary chain");
                CallKind::Unary
            }
        }
    }

    /// Dispatches one call through the chain matching its kind.
    ///
    /// A [`CallContext`] already present in the request extensions is kept;
    /// otherwise one is derived from the request.
    pub async fn dispatch(&self, mut call: Request<Body>, endpoint: Endpoint) -> CallResult {
        if call.call_context().is_none() {
            let context = CallContext::from_request(&call, |method| self.kind_of(method));
            call.extensions_mut().insert(context);
        }

        let kind = call.call_context().map(CallContext::kind).unwrap_or_default();
        match kind {
            CallKind::Unary => self.unary.dispatch(call, endpoint).await,
            CallKind::Streaming => self.streaming.dispatch(call, endpoint).await,
        }
    }
}

/// Ordered record of the stages a call passed through.
#[derive(Clone, Debug, Default)]
pub struct CallTrace(Arc<Mutex<Vec<&'static str>>>);

impl CallTrace {
    pub fn record(&self, stage: &'static str) {
        self.0.lock().push(stage);
    }

    pub fn stages(&self) -> Vec<&'static str> {
        self.0.lock().clone()
    }
}

/// Per-call state carried in the request extensions.
#[derive(Clone, Debug)]
pub struct CallContext {
    method: String,
    kind: CallKind,
    remote_addr: Option<SocketAddr>,
    correlation_id: Option<String>,
    identity: Option<Identity>,
    generation: Option<u64>,
    trace: CallTrace,
}

impl CallContext {
    pub fn new(method: impl Into<String>, kind: CallKind) -> Self {
        Self {
            method: method.into(),
            kind,
            remote_addr: None,
            correlation_id: None,
            identity: None,
            generation: None,
            trace: CallTrace::default(),
        }
    }

    /// Builds a context from the request path and peer address.
    pub fn from_request<B>(request: &Request<B>, kind_of: impl Fn(&str) -> CallKind) -> Self {
        let method = request.uri().path();
        Self::new(method, kind_of(method)).with_remote_addr(crate::admission::remote_addr(request))
    }

    pub fn with_remote_addr(mut self, remote_addr: Option<SocketAddr>) -> Self {
        self.remote_addr = remote_addr;
        self
    }

    pub fn with_trace(mut self, trace: CallTrace) -> Self {
        self.trace = trace;
        self
    }

    /// Full gRPC method path, e.g. `/pkg.Service/Method`.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Service part of the method path, e.g. `pkg.Service`.
    pub fn service(&self) -> &str {
        split_method(&self.method).0
    }

    /// Method part of the method path, e.g. `Method`.
    pub fn operation(&self) -> &str {
        split_method(&self.method).1
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn set_correlation_id(&mut self, id: impl Into<String>) {
        self.correlation_id = Some(id.into());
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn set_identity(&mut self, identity: Identity) {
        self.identity = Some(identity);
    }

    /// Guard generation observed when the call was admitted.
    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    pub fn set_generation(&mut self, generation: u64) {
        self.generation = Some(generation);
    }

    pub fn trace(&self) -> &CallTrace {
        &self.trace
    }
}

fn split_method(path: &str) -> (&str, &str) {
    let trimmed = path.trim_start_matches('/');
    trimmed.rsplit_once('/').unwrap_or((trimmed, ""))
}

/// Access to the [`CallContext`] of an HTTP or tonic request.
pub trait CallContextExt {
    fn call_context(&self) -> Option<&CallContext>;
    fn call_context_mut(&mut self) -> Option<&mut CallContext>;
}

impl<B> CallContextExt for Request<B> {
    fn call_context(&self) -> Option<&CallContext> {
        self.extensions().get::<CallContext>()
    }

    fn call_context_mut(&mut self) -> Option<&mut CallContext> {
        self.extensions_mut().get_mut::<CallContext>()
    }
}

impl<T> CallContextExt for tonic::Request<T> {
    fn call_context(&self) -> Option<&CallContext> {
        self.extensions().get::<CallContext>()
    }

    fn call_context_mut(&mut self) -> Option<&mut CallContext> {
        self.extensions_mut().get_mut::<CallContext>()
    }
}

/// Synchronous interceptor built by [`from_fn`].
pub struct FnInterceptor<F> {
    name: &'static str,
    check: F,
}

/// Wraps a synchronous check in an [`Interceptor`].
///
/// The closure may modify the request; returning `Err` rejects the call.
pub fn from_fn<F>(name: &'static str, check: F) -> FnInterceptor<F>
where
    F: Fn(&mut Request<Body>) -> Result<(), Status> + Send + Sync + 'static,
{
    FnInterceptor { name, check }
}

impl<F> Interceptor for FnInterceptor<F>
where
    F: Fn(&mut Request<Body>) -> Result<(), Status> + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn intercept<'a>(&'a self, mut call: Request<Body>, next: Next<'a>) -> BoxFuture<'a, CallResult> {
        Box::pin(async move {
            (self.check)(&mut call)?;
            next.run(call).await
        })
    }
}
