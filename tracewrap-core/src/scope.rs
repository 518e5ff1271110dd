//! User-facing scope API.
//!
//! A scope is a named string that tags every span started while it is
//! active, as a `scope.{name}` attribute. Scopes ride on the ambient
//! `Context`, so starting one returns a token and stopping it restores
//! whatever was active before, including any previous value of the same
//! scope name.

use std::collections::BTreeMap;

use crate::config::HeaderRule;
use crate::context::{Context, ContextExt};

/// Token for an active scope. Pass it back to `stop_scope`.
#[derive(Debug)]
#[must_use = "stop the scope or it stays active for the rest of the thread"]
pub struct ScopeToken(crate::context::ContextToken);

/// Activate a scope on the current thread. A `None` value gets a fresh
/// unique id so correlated spans can be grouped without caller bookkeeping.
pub fn start_scope(name: impl Into<String>, value: Option<&str>) -> ScopeToken {
    let value = match value {
        Some(v) => v.to_string(),
        None => uuid::Uuid::new_v4().simple().to_string(),
    };
    let ctx = Context::current().with_scope(name, value);
    ScopeToken(Context::attach(ctx))
}

/// Activate several scopes at once under a single token.
pub fn start_scopes(scopes: BTreeMap<String, String>) -> ScopeToken {
    let ctx = Context::current().with_scopes(scopes);
    ScopeToken(Context::attach(ctx))
}

/// Deactivate a scope, restoring the snapshot from before its start.
pub fn stop_scope(token: ScopeToken) {
    Context::detach(token.0);
}

/// Run `f` with the scope active, stopping it on the way out.
pub fn with_scope<T>(name: impl Into<String>, value: Option<&str>, f: impl FnOnce() -> T) -> T {
    let token = start_scope(name, value);
    let result = f();
    stop_scope(token);
    result
}

/// Async variant of `with_scope`; the scope follows the future across polls.
pub async fn with_scope_async<F>(name: impl Into<String>, value: Option<&str>, fut: F) -> F::Output
where
    F: Future,
{
    let value = match value {
        Some(v) => v.to_string(),
        None => uuid::Uuid::new_v4().simple().to_string(),
    };
    let ctx = Context::current().with_scope(name, value);
    fut.with_context(ctx).await
}

/// All scopes active on the current thread.
pub fn current_scopes() -> BTreeMap<String, String> {
    Context::current().scopes().clone()
}

/// Map inbound request headers to scopes per the configured rules.
/// Returns `None` when no rule matches, so callers skip the detach.
/// Header names compare case-insensitively.
pub fn scopes_from_headers(
    rules: &[HeaderRule],
    headers: &BTreeMap<String, String>,
) -> Option<ScopeToken> {
    let mut scopes = BTreeMap::new();
    for rule in rules {
        let hit = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&rule.header));
        if let Some((_, value)) = hit {
            scopes.insert(rule.scope_name.clone(), value.clone());
        }
    }
    if scopes.is_empty() {
        None
    } else {
        Some(start_scopes(scopes))
    }
}
