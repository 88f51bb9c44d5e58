use crate::pipeline::CallKind;
use std::collections::HashMap;
use std::convert::Infallible;
use tonic::body::Body;
use tonic::codegen::http::{Request, Response};
use tonic::server::NamedService;
use tonic::service::{Routes, RoutesBuilder};
use tower::Service;

/// Collects the services registered for one start cycle.
///
/// Methods are unary unless declared with [`streaming_method`](Self::streaming_method),
/// which selects the streaming interceptor chain for them.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    routes: RoutesBuilder,
    services: Vec<&'static str>,
    kinds: HashMap<String, CallKind>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tonic service, e.g. a generated `FooServer`.
    ///
    /// Every method of the service runs the unary chain, correlation stage and
    /// unary interceptors included, unless its path is also passed to
    /// [`streaming_method`](Self::streaming_method). Calls to undeclared
    /// methods are logged at debug level.
    pub fn add_service<S>(&mut self, service: S) -> &mut Self
    where
        S: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        tracing::debug!(service = S::NAME, "registering service");
        self.services.push(S::NAME);
        self.routes.add_service(service);
        self
    }

    /// Declares `path` (`/pkg.Service/Method`) as a streaming method.
    pub fn streaming_method(&mut self, path: impl Into<String>) -> &mut Self {
        self.kinds.insert(path.into(), CallKind::Streaming);
        self
    }

    /// Fully qualified names of the registered services.
    pub fn services(&self) -> &[&'static str] {
        &self.services
    }

    pub fn kinds(&self) -> &HashMap<String, CallKind> {
        &self.kinds
    }

    pub(crate) fn into_parts(self) -> (Routes, Vec<&'static str>, HashMap<String, CallKind>) {
        (self.routes.routes(), self.services, self.kinds)
    }
}
