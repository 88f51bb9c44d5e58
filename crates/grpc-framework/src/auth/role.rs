//! A [`RoleManager`] backed by a static role table.
//!
//! Each role holds a list of [`Rule`]s. A rule names services and APIs by
//! pattern: `*` matches anything, a leading or trailing `*` matches a suffix or
//! prefix, and anything else must match exactly (ASCII case-insensitive).
//! Services match either the fully qualified name (`pkg.Volumes`) or its last
//! segment (`Volumes`). A pattern prefixed with `!` denies instead of allows;
//! denials win over grants from any role.

use super::{Identity, RoleManager};
use crate::error::AuthError;
use async_trait::async_trait;
use std::collections::HashMap;

/// Role granted full access by [`InMemoryRoleManager::default`].
pub const SYSTEM_ADMIN_ROLE: &str = "system.admin";

/// Role granted read-only access by [`InMemoryRoleManager::default`].
pub const SYSTEM_VIEW_ROLE: &str = "system.view";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub services: Vec<String>,
    pub apis: Vec<String>,
}

impl Rule {
    pub fn new<S, A>(services: S, apis: A) -> Self
    where
        S: IntoIterator,
        S::Item: Into<String>,
        A: IntoIterator,
        A::Item: Into<String>,
    {
        Self {
            services: services.into_iter().map(Into::into).collect(),
            apis: apis.into_iter().map(Into::into).collect(),
        }
    }

    fn verdict(&self, service: &str, api: &str) -> Option<bool> {
        let service_match = matches_any(&self.services, |pattern| {
            glob_match(pattern, service)
                || service
                    .rsplit_once('.')
                    .is_some_and(|(_, short)| glob_match(pattern, short))
        });
        let api_match = matches_any(&self.apis, |pattern| glob_match(pattern, api));

        match (service_match, api_match) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        }
    }
}

/// `Some(false)` if a `!` pattern matched, `Some(true)` if a plain pattern
/// matched, `None` otherwise.
fn matches_any(patterns: &[String], matcher: impl Fn(&str) -> bool) -> Option<bool> {
    let mut allowed = None;
    for pattern in patterns {
        match pattern.strip_prefix('!') {
            Some(denied) if matcher(denied) => return Some(false),
            Some(_) => {}
            None if matcher(pattern) => allowed = Some(true),
            None => {}
        }
    }
    allowed
}

fn glob_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let pattern = pattern.to_ascii_lowercase();
    let value = value.to_ascii_lowercase();
    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        (Some(suffix), _) => value.ends_with(suffix),
        (None, Some(prefix)) => value.starts_with(prefix),
        (None, None) => pattern == value,
    }
}

#[derive(Clone, Debug)]
pub struct InMemoryRoleManager {
    roles: HashMap<String, Vec<Rule>>,
}

impl Default for InMemoryRoleManager {
    fn default() -> Self {
        Self::empty()
            .with_role(SYSTEM_ADMIN_ROLE, vec![Rule::new(["*"], ["*"])])
            .with_role(
                SYSTEM_VIEW_ROLE,
                vec![Rule::new(
                    ["*"],
                    ["get*", "list*", "enumerate*", "inspect*", "check", "watch"],
                )],
            )
    }
}

impl InMemoryRoleManager {
    /// A manager without any roles; every call is denied.
    pub fn empty() -> Self {
        Self {
            roles: HashMap::new(),
        }
    }

    pub fn with_role(mut self, name: impl Into<String>, rules: Vec<Rule>) -> Self {
        self.roles.insert(name.into(), rules);
        self
    }

    pub fn role(&self, name: &str) -> Option<&[Rule]> {
        self.roles.get(name).map(Vec::as_slice)
    }

    /// Evaluates every rule of every role held by `identity`.
    pub fn check(&self, identity: &Identity, method: &str) -> Result<(), AuthError> {
        let (service, api) = method
            .trim_start_matches('/')
            .rsplit_once('/')
            .ok_or_else(|| AuthError::Denied {
                reason: format!("malformed method path {method}"),
            })?;

        let mut granted = false;
        for rule in identity
            .roles
            .iter()
            .filter_map(|role| self.roles.get(role))
            .flatten()
        {
            match rule.verdict(service, api) {
                Some(false) => {
                    return Err(AuthError::Denied {
                        reason: format!("access to {method} denied"),
                    });
                }
                Some(true) => granted = true,
                None => {}
            }
        }

        if granted {
            Ok(())
        } else {
            Err(AuthError::Denied {
                reason: format!(
                    "{} is not permitted to call {method}",
                    identity.username()
                ),
            })
        }
    }
}

#[async_trait]
impl RoleManager for InMemoryRoleManager {
    async fn authorize(&self, identity: &Identity, method: &str) -> Result<(), AuthError> {
        self.check(identity, method)
    }
}
