//! Authentication and authorization stages.
//!
//! Callers present a JWT in the `authorization: Bearer <token>` metadata. The
//! authentication stage reads the token's `iss` claim (without verifying it),
//! looks up the [`Authenticator`] registered for exactly that issuer and lets
//! it validate the token. The resolved [`Identity`] is stored in the
//! [`CallContext`](crate::pipeline::CallContext).
//!
//! The authorization stage then asks the [`RoleManager`] whether that identity
//! may invoke the full method path.
//!
//! Both stages fail closed: any missing piece or backend error rejects the call
//! with `UNAUTHENTICATED` or `PERMISSION_DENIED`.

pub mod role;

use crate::error::{AuthError, Error};
use crate::pipeline::{CallContextExt, CallResult, Interceptor, Next};
use async_trait::async_trait;
use futures::future::BoxFuture;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tonic::body::Body;
use tonic::codegen::http::{HeaderMap, Request, header::AUTHORIZATION};

pub use role::{InMemoryRoleManager, Rule};

/// Authenticators keyed by the exact issuer string they accept.
pub type AuthenticatorRegistry = BTreeMap<String, Arc<dyn Authenticator>>;

/// Caller identity resolved from a validated token.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub issuer: String,
    pub subject: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Identity {
    pub fn new(issuer: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            subject: subject.into(),
            ..Self::default()
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Name used in audit records: email, then name, then subject.
    pub fn username(&self) -> &str {
        self.email
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or(&self.subject)
    }
}

/// Validates tokens issued by one issuer.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Decides whether an identity may invoke a method.
#[async_trait]
pub trait RoleManager: Send + Sync {
    /// `method` is the full gRPC path, e.g. `/pkg.Service/Method`.
    async fn authorize(&self, identity: &Identity, method: &str) -> Result<(), AuthError>;
}

/// Extracts the bearer token from request metadata.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingCredentials)?
        .to_str()
        .map_err(|_| AuthError::MalformedToken {
            reason: "authorization metadata is not ASCII".to_string(),
        })?;

    let (scheme, token) = value.split_once(' ').ok_or(AuthError::MissingCredentials)?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
        return Err(AuthError::MissingCredentials);
    }
    Ok(token.trim())
}

#[derive(Deserialize)]
struct IssuerClaim {
    iss: Option<String>,
}

/// Reads the unverified `iss` claim from a JWT.
///
/// Signature, expiry and audience are left to the [`Authenticator`] selected
/// by the issuer.
pub fn token_issuer(token: &str) -> Result<String, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.required_spec_claims.clear();
    validation.validate_exp = false;
    validation.validate_aud = false;

    let key = DecodingKey::from_secret(&[]);
    let data = jsonwebtoken::decode::<IssuerClaim>(token, &key, &validation).map_err(|e| {
        AuthError::MalformedToken {
            reason: format!("unreadable JWT: {e}"),
        }
    })?;

    data.claims
        .iss
        .filter(|iss| !iss.is_empty())
        .ok_or_else(|| AuthError::MalformedToken {
            reason: "missing iss claim".to_string(),
        })
}

/// Resolves the caller identity against the per-issuer registry.
pub struct AuthenticationInterceptor {
    authenticators: Arc<AuthenticatorRegistry>,
}

impl AuthenticationInterceptor {
    pub fn new(authenticators: Arc<AuthenticatorRegistry>) -> Self {
        Self { authenticators }
    }

    pub async fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        let issuer = token_issuer(token)?;
        let authenticator = self
            .authenticators
            .get(&issuer)
            .ok_or_else(|| AuthError::UnknownIssuer {
                issuer: issuer.clone(),
            })?;

        let mut identity = authenticator.validate(token).await?;
        if identity.issuer.is_empty() {
            identity.issuer = issuer;
        }
        Ok(identity)
    }
}

impl Interceptor for AuthenticationInterceptor {
    fn name(&self) -> &'static str {
        "authenticate"
    }

    fn intercept<'a>(&'a self, mut call: Request<Body>, next: Next<'a>) -> BoxFuture<'a, CallResult> {
        Box::pin(async move {
            let token = bearer_token(call.headers())
                .map_err(Error::Unauthenticated)?
                .to_owned();

            let identity = match self.authenticate(&token).await {
                Ok(identity) => identity,
                Err(e) => {
                    tracing::warn!(
                        method = %call.uri().path(),
                        error = %e,
                        "authentication failed"
                    );
                    return Err(Error::Unauthenticated(e).into());
                }
            };

            tracing::trace!(issuer = %identity.issuer, user = %identity.username(), "authenticated");
            if let Some(context) = call.call_context_mut() {
                context.set_identity(identity);
            } else {
                call.extensions_mut().insert(identity);
            }
            next.run(call).await
        })
    }
}

/// Checks the resolved identity against the role manager.
pub struct AuthorizationInterceptor {
    roles: Arc<dyn RoleManager>,
}

impl AuthorizationInterceptor {
    pub fn new(roles: Arc<dyn RoleManager>) -> Self {
        Self { roles }
    }
}

impl Interceptor for AuthorizationInterceptor {
    fn name(&self) -> &'static str {
        "authorize"
    }

    fn intercept<'a>(&'a self, call: Request<Body>, next: Next<'a>) -> BoxFuture<'a, CallResult> {
        Box::pin(async move {
            let method = call.uri().path().to_owned();
            let identity = call
                .call_context()
                .and_then(|context| context.identity())
                .or_else(|| call.extensions().get::<Identity>())
                .cloned()
                .ok_or(Error::PermissionDenied(AuthError::MissingIdentity))?;

            if let Err(e) = self.roles.authorize(&identity, &method).await {
                tracing::warn!(
                    %method,
                    user = %identity.username(),
                    error = %e,
                    "authorization denied"
                );
                return Err(Error::PermissionDenied(e).into());
            }
            next.run(call).await
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pipeline::{CallContext, CallKind, CallTrace, Chain, Endpoint};
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tonic::Code;
    use tonic::codegen::http::Response;

    #[derive(Serialize)]
    struct TestClaims<'a> {
        #[serde(skip_serializing_if = "Option::is_none")]
        iss: Option<&'a str>,
        sub: &'a str,
    }

    fn sign(claims: &TestClaims<'_>) -> String {
        jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            claims,
            &jsonwebtoken::EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap()
    }

    /// HS256 token signed with a throwaway key, carrying only the issuer.
    pub(crate) fn token_for(issuer: &str) -> String {
        sign(&TestClaims {
            iss: Some(issuer),
            sub: "alice",
        })
    }

    pub(crate) struct StaticAuthenticator {
        pub(crate) calls: Arc<AtomicUsize>,
        pub(crate) roles: Vec<String>,
    }

    #[async_trait]
    impl Authenticator for StaticAuthenticator {
        async fn validate(&self, _token: &str) -> Result<Identity, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Identity::new("", "alice").with_roles(self.roles.clone()))
        }
    }

    struct RejectingAuthenticator;

    #[async_trait]
    impl Authenticator for RejectingAuthenticator {
        async fn validate(&self, _token: &str) -> Result<Identity, AuthError> {
            Err(AuthError::InvalidToken {
                reason: "expired".to_string(),
            })
        }
    }

    pub(crate) struct FixedRoles {
        pub(crate) allow: bool,
        pub(crate) calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RoleManager for FixedRoles {
        async fn authorize(&self, _identity: &Identity, method: &str) -> Result<(), AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.allow {
                Ok(())
            } else {
                Err(AuthError::Denied {
                    reason: format!("access to {method} denied"),
                })
            }
        }
    }

    fn registry(issuer: &str, authenticator: Arc<dyn Authenticator>) -> Arc<AuthenticatorRegistry> {
        Arc::new(BTreeMap::from([(issuer.to_string(), authenticator)]))
    }

    fn request(token: Option<&str>) -> (Request<Body>, CallTrace) {
        let trace = CallTrace::default();
        let mut builder = Request::builder().uri("/pkg.Svc/Get");
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let mut request = builder.body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(CallContext::new("/pkg.Svc/Get", CallKind::Unary).with_trace(trace.clone()));
        (request, trace)
    }

    fn counting_endpoint(hits: Arc<AtomicUsize>) -> Endpoint {
        Box::new(move |_| {
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(Response::new(Body::empty()))
            }
            .boxed()
        })
    }

    fn chain(authenticators: Arc<AuthenticatorRegistry>, roles: Arc<dyn RoleManager>) -> Chain {
        Chain::new(vec![
            Arc::new(AuthenticationInterceptor::new(authenticators)),
            Arc::new(AuthorizationInterceptor::new(roles)),
        ])
    }

    #[test]
    fn issuer_is_read_from_payload() {
        assert_eq!(token_issuer(&token_for("iss-a")).unwrap(), "iss-a");
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert!(matches!(
            token_issuer("not-a-jwt"),
            Err(AuthError::MalformedToken { .. })
        ));
        assert!(matches!(
            token_issuer("a.!!!.c"),
            Err(AuthError::MalformedToken { .. })
        ));
        let no_iss = sign(&TestClaims {
            iss: None,
            sub: "bob",
        });
        assert!(matches!(
            token_issuer(&no_iss),
            Err(AuthError::MalformedToken { .. })
        ));
        let empty_iss = sign(&TestClaims {
            iss: Some(""),
            sub: "bob",
        });
        assert!(matches!(
            token_issuer(&empty_iss),
            Err(AuthError::MalformedToken { .. })
        ));
    }

    #[test]
    fn issuer_is_read_without_verifying_signature() {
        let token = token_for("iss-a");
        let (unsigned, _) = token.rsplit_once('.').unwrap();
        let forged = format!("{unsigned}.c2lnbmF0dXJl");
        assert_eq!(token_issuer(&forged).unwrap(), "iss-a");
    }

    #[test]
    fn bearer_scheme_is_required() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), Err(AuthError::MissingCredentials));

        headers.insert(AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Err(AuthError::MissingCredentials));

        headers.insert(AUTHORIZATION, "bearer abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Ok("abc"));
    }

    #[tokio::test]
    async fn unknown_issuer_is_unauthenticated() {
        let authn_calls = Arc::new(AtomicUsize::new(0));
        let authz_calls = Arc::new(AtomicUsize::new(0));
        let hits = Arc::new(AtomicUsize::new(0));
        let chain = chain(
            registry(
                "iss-a",
                Arc::new(StaticAuthenticator {
                    calls: authn_calls.clone(),
                    roles: vec![],
                }),
            ),
            Arc::new(FixedRoles {
                allow: true,
                calls: authz_calls.clone(),
            }),
        );

        let (call, trace) = request(Some(&token_for("iss-b")));
        let err = chain
            .dispatch(call, counting_endpoint(hits.clone()))
            .await
            .unwrap_err();

        assert_eq!(err.code(), Code::Unauthenticated);
        assert_eq!(trace.stages(), vec!["authenticate"]);
        assert_eq!(authn_calls.load(Ordering::SeqCst), 0);
        assert_eq!(authz_calls.load(Ordering::SeqCst), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_token_is_unauthenticated() {
        let hits = Arc::new(AtomicUsize::new(0));
        let chain = chain(
            registry("iss-a", Arc::new(RejectingAuthenticator)),
            Arc::new(FixedRoles {
                allow: true,
                calls: Arc::default(),
            }),
        );

        let (call, _) = request(None);
        let err = chain
            .dispatch(call, counting_endpoint(hits.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_token_is_unauthenticated() {
        let chain = chain(
            registry("iss-a", Arc::new(RejectingAuthenticator)),
            Arc::new(FixedRoles {
                allow: true,
                calls: Arc::default(),
            }),
        );

        let (call, _) = request(Some(&token_for("iss-a")));
        let err = chain
            .dispatch(call, counting_endpoint(Arc::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
        assert!(err.message().contains("expired"));
    }

    #[tokio::test]
    async fn role_denial_is_permission_denied() {
        let hits = Arc::new(AtomicUsize::new(0));
        let chain = chain(
            registry(
                "iss-a",
                Arc::new(StaticAuthenticator {
                    calls: Arc::default(),
                    roles: vec!["viewer".to_string()],
                }),
            ),
            Arc::new(FixedRoles {
                allow: false,
                calls: Arc::default(),
            }),
        );

        let (call, trace) = request(Some(&token_for("iss-a")));
        let err = chain
            .dispatch(call, counting_endpoint(hits.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);
        assert_eq!(trace.stages(), vec!["authenticate", "authorize"]);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn identity_reaches_handler() {
        let chain = chain(
            registry(
                "iss-a",
                Arc::new(StaticAuthenticator {
                    calls: Arc::default(),
                    roles: vec!["admin".to_string()],
                }),
            ),
            Arc::new(FixedRoles {
                allow: true,
                calls: Arc::default(),
            }),
        );

        let (call, _) = request(Some(&token_for("iss-a")));
        let endpoint: Endpoint = Box::new(|call| {
            async move {
                let identity = call
                    .call_context()
                    .and_then(|context| context.identity())
                    .cloned()
                    .ok_or_else(|| tonic::Status::internal("identity missing"))?;
                assert_eq!(identity.issuer, "iss-a");
                assert_eq!(identity.roles, vec!["admin".to_string()]);
                Ok(Response::new(Body::empty()))
            }
            .boxed()
        });
        chain.dispatch(call, endpoint).await.unwrap();
    }

    #[tokio::test]
    async fn authorization_without_identity_is_denied() {
        let chain = Chain::new(vec![Arc::new(AuthorizationInterceptor::new(Arc::new(
            FixedRoles {
                allow: true,
                calls: Arc::default(),
            },
        )))]);

        let (call, _) = request(None);
        let err = chain
            .dispatch(call, counting_endpoint(Arc::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);
    }
}
