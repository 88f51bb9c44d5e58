//! Builds the unary and streaming chains of one start cycle.
//!
//! With at least one authenticator registered:
//!
//! ```text
//! unary:     guard, correlation, authenticate, authorize, log, metrics, ..unary extensions
//! streaming: guard,              authenticate, authorize, log, metrics, ..stream extensions
//! ```
//!
//! Without authenticators, `authenticate` and `authorize` are left out.
//! Extensions always come last, in registration order. Correlation tagging
//! only applies to unary calls.

use super::stages::{CorrelationInterceptor, GuardInterceptor, LoggingInterceptor, MetricsInterceptor};
use super::{CallKind, Chain, Interceptor, Pipeline};
use crate::auth::{AuthenticationInterceptor, AuthenticatorRegistry, AuthorizationInterceptor, RoleManager};
use crate::config::ServerConfig;
use crate::guard::LifecycleGuard;
use std::collections::HashMap;
use std::sync::Arc;

struct Authentication {
    authenticators: Arc<AuthenticatorRegistry>,
    roles: Arc<dyn RoleManager>,
}

pub struct ChainBuilder {
    guard: LifecycleGuard,
    authentication: Option<Authentication>,
    unary_extensions: Vec<Arc<dyn Interceptor>>,
    stream_extensions: Vec<Arc<dyn Interceptor>>,
}

impl ChainBuilder {
    pub fn new(guard: LifecycleGuard) -> Self {
        Self {
            guard,
            authentication: None,
            unary_extensions: Vec::new(),
            stream_extensions: Vec::new(),
        }
    }

    /// Builder seeded from a validated configuration.
    pub fn from_config(config: &ServerConfig, guard: LifecycleGuard) -> Self {
        let builder = Self::new(guard)
            .unary_extensions(config.unary_interceptors().iter().cloned())
            .stream_extensions(config.stream_interceptors().iter().cloned());

        match config.role_manager() {
            Some(roles) => builder.authentication(config.authenticators().clone(), roles.clone()),
            None => builder,
        }
    }

    /// Enables the auth stages. An empty registry leaves them disabled.
    pub fn authentication(
        mut self,
        authenticators: Arc<AuthenticatorRegistry>,
        roles: Arc<dyn RoleManager>,
    ) -> Self {
        self.authentication = (!authenticators.is_empty()).then_some(Authentication {
            authenticators,
            roles,
        });
        self
    }

    pub fn unary_extensions(mut self, extensions: impl IntoIterator<Item = Arc<dyn Interceptor>>) -> Self {
        self.unary_extensions.extend(extensions);
        self
    }

    pub fn stream_extensions(mut self, extensions: impl IntoIterator<Item = Arc<dyn Interceptor>>) -> Self {
        self.stream_extensions.extend(extensions);
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.authentication.is_some()
    }

    pub fn build_unary(&self) -> Chain {
        self.build_chain(CallKind::Unary)
    }

    pub fn build_streaming(&self) -> Chain {
        self.build_chain(CallKind::Streaming)
    }

    /// Both chains plus the declared method kinds.
    pub fn build(&self, kinds: HashMap<String, CallKind>) -> Pipeline {
        let pipeline = Pipeline::new(self.build_unary(), self.build_streaming(), kinds);
        tracing::debug!(
            unary = ?pipeline.unary(),
            streaming = ?pipeline.streaming(),
            "interceptor chains built"
        );
        pipeline
    }

    fn build_chain(&self, kind: CallKind) -> Chain {
        let mut stages: Vec<Arc<dyn Interceptor>> =
            vec![Arc::new(GuardInterceptor::new(self.guard.clone()))];

        if kind == CallKind::Unary {
            stages.push(Arc::new(CorrelationInterceptor));
        }

        if let Some(auth) = &self.authentication {
            stages.push(Arc::new(AuthenticationInterceptor::new(
                auth.authenticators.clone(),
            )));
            stages.push(Arc::new(AuthorizationInterceptor::new(auth.roles.clone())));
        }

        stages.push(Arc::new(LoggingInterceptor));
        stages.push(Arc::new(MetricsInterceptor));

        let extensions = match kind {
            CallKind::Unary => &self.unary_extensions,
            CallKind::Streaming => &self.stream_extensions,
        };
        stages.extend(extensions.iter().cloned());

        Chain::new(stages)
    }
}
