//! Ambient execution context: current span, active scopes, workflow marker.
//!
//! Contract:
//! - A `Context` is an immutable snapshot; "mutation" produces a new one.
//! - Attach/detach is explicit and token-based. Detach restores the exact
//!   snapshot that was current before the matching attach, so nesting is
//!   correct for any LIFO interleaving per call site. There is no global
//!   mutable state.
//! - For synchronous code the ambient context is thread-local. Async code
//!   must thread it through `with_context`, which re-attaches on every poll
//!   so the context follows the logical task rather than the OS thread.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use crate::span::Span;

#[derive(Debug, Default)]
struct ContextInner {
    span: Option<Span>,
    scopes: BTreeMap<String, String>,
    workflow_open: bool,
}

/// One immutable snapshot of the ambient execution state.
#[derive(Clone, Debug, Default)]
pub struct Context {
    inner: Arc<ContextInner>,
}

thread_local! {
    static STACK: RefCell<Vec<Context>> = const { RefCell::new(Vec::new()) };
}

/// Token returned by `Context::attach`. Records the stack depth to restore.
#[derive(Debug)]
#[must_use = "detach the token or the attached context outlives its call"]
pub struct ContextToken {
    depth: usize,
}

impl Context {
    /// The context currently attached on this thread, or the empty one.
    pub fn current() -> Context {
        STACK.with(|stack| stack.borrow().last().cloned().unwrap_or_default())
    }

    pub fn span(&self) -> Option<&Span> {
        self.inner.span.as_ref()
    }

    pub fn scopes(&self) -> &BTreeMap<String, String> {
        &self.inner.scopes
    }

    pub fn workflow_open(&self) -> bool {
        self.inner.workflow_open
    }

    pub fn with_span(&self, span: Span) -> Context {
        self.update(|inner| inner.span = Some(span))
    }

    pub fn with_scope(&self, name: impl Into<String>, value: impl Into<String>) -> Context {
        self.update(|inner| {
            inner.scopes.insert(name.into(), value.into());
        })
    }

    pub fn with_scopes(&self, scopes: BTreeMap<String, String>) -> Context {
        self.update(|inner| inner.scopes.extend(scopes))
    }

    pub fn with_workflow_open(&self, open: bool) -> Context {
        self.update(|inner| inner.workflow_open = open)
    }

    fn update(&self, f: impl FnOnce(&mut ContextInner)) -> Context {
        let mut inner = ContextInner {
            span: self.inner.span.clone(),
            scopes: self.inner.scopes.clone(),
            workflow_open: self.inner.workflow_open,
        };
        f(&mut inner);
        Context {
            inner: Arc::new(inner),
        }
    }

    /// Make `ctx` current on this thread until the token is detached.
    pub fn attach(ctx: Context) -> ContextToken {
        STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(ctx);
            ContextToken { depth: stack.len() }
        })
    }

    /// Restore the snapshot that was current before the matching attach.
    pub fn detach(token: ContextToken) {
        STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.len() != token.depth {
                tracing::warn!(
                    expected = token.depth,
                    actual = stack.len(),
                    "context detached out of order; truncating to attach point"
                );
            }
            stack.truncate(token.depth.saturating_sub(1));
        });
    }
}

/// Future combinator that attaches a context around every poll.
///
/// Adds no suspension points beyond the wrapped future's own.
pub struct WithContext<F> {
    inner: Pin<Box<F>>,
    ctx: Context,
}

impl<F: Future> Future for WithContext<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let token = Context::attach(this.ctx.clone());
        let result = this.inner.as_mut().poll(cx);
        Context::detach(token);
        result
    }
}

pub trait ContextExt: Future + Sized {
    /// Run this future with `ctx` attached for the duration of every poll.
    fn with_context(self, ctx: Context) -> WithContext<Self> {
        WithContext {
            inner: Box::pin(self),
            ctx,
        }
    }
}

impl<F: Future> ContextExt for F {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::span::Tracer;

    #[test]
    fn empty_context_by_default() {
        let ctx = Context::current();
        assert!(ctx.span().is_none());
        assert!(ctx.scopes().is_empty());
        assert!(!ctx.workflow_open());
    }

    #[test]
    fn attach_detach_restores_prior_snapshot() {
        let outer = Context::current().with_scope("session", "s-1");
        let t1 = Context::attach(outer);
        assert_eq!(Context::current().scopes()["session"], "s-1");

        let inner = Context::current().with_scope("request", "r-1");
        let t2 = Context::attach(inner);
        assert_eq!(Context::current().scopes().len(), 2);

        Context::detach(t2);
        let restored = Context::current();
        assert_eq!(restored.scopes().len(), 1);
        assert!(restored.scopes().contains_key("session"));

        Context::detach(t1);
        assert!(Context::current().scopes().is_empty());
    }

    #[test]
    fn snapshots_are_immutable() {
        let base = Context::current();
        let derived = base.with_scope("a", "1").with_workflow_open(true);
        assert!(base.scopes().is_empty());
        assert!(!base.workflow_open());
        assert_eq!(derived.scopes()["a"], "1");
        assert!(derived.workflow_open());
    }

    #[test]
    fn out_of_order_detach_truncates() {
        let t1 = Context::attach(Context::current().with_scope("a", "1"));
        let _t2 = Context::attach(Context::current().with_scope("b", "2"));
        // Detach the outer token first; the stack is truncated past both.
        Context::detach(t1);
        assert!(Context::current().scopes().is_empty());
    }

    #[test]
    fn context_carries_span() {
        let tracer = Tracer::new(Arc::new(MemorySink::default()), "svc");
        let span = tracer.start_span("op", None);
        let token = Context::attach(Context::current().with_span(span.clone()));
        assert_eq!(
            Context::current().span().map(|s| s.span_id().to_string()),
            Some(span.span_id().to_string())
        );
        Context::detach(token);
        assert!(Context::current().span().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn with_context_follows_the_task_across_threads() {
        let ctx = Context::current().with_scope("session", "s-42");
        let observed = async {
            let before = Context::current().scopes().get("session").cloned();
            tokio::task::yield_now().await;
            let after = Context::current().scopes().get("session").cloned();
            (before, after)
        }
        .with_context(ctx)
        .await;
        assert_eq!(observed.0.as_deref(), Some("s-42"));
        assert_eq!(observed.1.as_deref(), Some("s-42"));
        // Nothing leaks onto whichever worker thread ran the future last.
        assert!(Context::current().scopes().is_empty());
    }

    #[tokio::test]
    async fn unrelated_tasks_share_nothing() {
        let a = tokio::spawn(async {
            let ctx = Context::current().with_scope("task", "a");
            async { Context::current().scopes().get("task").cloned() }
                .with_context(ctx)
                .await
        });
        let b = tokio::spawn(async { Context::current().scopes().get("task").cloned() });
        assert_eq!(a.await.expect("join a").as_deref(), Some("a"));
        assert_eq!(b.await.expect("join b"), None);
    }
}
