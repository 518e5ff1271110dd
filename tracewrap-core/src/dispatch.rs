//! Call dispatcher: the single tracing wrapper around instrumented calls.
//!
//! Contract:
//! - The wrapped call's outcome always propagates to the caller unchanged.
//!   No handler hook, accessor, or sink failure may alter it.
//! - One span per traced call, parented from the ambient context; a target
//!   marked as a workflow opens at most one workflow span per trace, and a
//!   nested workflow target runs without a span of its own.
//! - The ambient context is restored before the dispatcher returns, even on
//!   failure. For stream results only the span close is deferred.

use std::sync::Arc;

use futures::Stream;
use once_cell::sync::OnceCell;
use serde_json::Value;

use crate::context::{Context, ContextExt};
use crate::error::CallError;
use crate::handler::{set_default_attributes, set_workflow_properties};
use crate::span::{Span, Tracer};
use crate::stream::{DefaultStreamProcessor, InstrumentedIter, InstrumentedStream, StreamProcessor};
use crate::target::{AccessorBundle, CallInputs, InstrumentationTarget, Phase};

/// Wraps calls to instrumented targets in spans.
#[derive(Clone)]
pub struct Dispatcher {
    tracer: Tracer,
}

static GLOBAL: OnceCell<Dispatcher> = OnceCell::new();

/// Install the process-wide dispatcher. The first call wins; a second
/// install hands the rejected dispatcher back.
pub fn set_global(dispatcher: Dispatcher) -> Result<(), Dispatcher> {
    GLOBAL.set(dispatcher)
}

/// The installed dispatcher, if any. Instrumentation shims call through
/// here so application code never threads a dispatcher around.
pub fn global() -> Option<&'static Dispatcher> {
    GLOBAL.get()
}

/// An opened span plus the context the wrapped call must run under.
struct OpenCall {
    span: Span,
    parent: Option<Span>,
    call_ctx: Context,
}

/// Everything needed to close a deferred stream span once the consumer
/// exhausts it.
pub(crate) struct SpanFinisher {
    target: Arc<InstrumentationTarget>,
    inputs: CallInputs,
    span: Span,
    parent: Option<Span>,
}

impl SpanFinisher {
    /// Post-hydrate and close the span against the assembled result.
    pub(crate) fn finish(self, result: Value) {
        let handler = self.target.handler();
        let bundle = AccessorBundle {
            inputs: &self.inputs,
            result: Some(&result),
            error: None,
            span: Some(&self.span),
        };
        handler.hydrate_span(&self.target, &bundle, &self.span, Phase::Post);
        if let Err(e) =
            handler.post_task_processing(&self.target, &bundle, &self.span, self.parent.as_ref())
        {
            tracing::warn!(call = %self.target.span_name(), error = %e, "post_task_processing failed");
        }
        self.span.set_status_ok_if_unset();
        self.span.end();
    }
}

impl Dispatcher {
    pub fn new(tracer: Tracer) -> Self {
        Self { tracer }
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    fn pre_context(&self, target: &InstrumentationTarget, inputs: &CallInputs) -> Context {
        let current = Context::current();
        match target.handler().pre_tracing(target, inputs, &current) {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::warn!(call = %target.span_name(), error = %e, "pre_tracing failed");
                current
            }
        }
    }

    fn should_skip(&self, target: &InstrumentationTarget, inputs: &CallInputs, ctx: &Context) -> bool {
        target.skip()
            || target.handler().skip_span(target, inputs)
            || (target.is_workflow() && ctx.workflow_open())
    }

    /// Open the span and prepare the context the call body runs under.
    fn open_call(
        &self,
        target: &InstrumentationTarget,
        inputs: &CallInputs,
        pre_ctx: &Context,
    ) -> OpenCall {
        let handler = target.handler();
        let parent = pre_ctx.span().cloned();
        let span = self.tracer.start_span(&target.span_name(), parent.as_ref());
        set_default_attributes(&span, pre_ctx, self.tracer.service_name());
        if span.is_root() {
            set_workflow_properties(&span, target, self.tracer.service_name());
        }

        let mut call_ctx = pre_ctx.with_span(span.clone());
        if target.is_workflow() {
            call_ctx = call_ctx.with_workflow_open(true);
        }

        if let Err(e) = handler.pre_task_processing(target, inputs, &span) {
            tracing::warn!(call = %target.span_name(), error = %e, "pre_task_processing failed");
        }
        let bundle = AccessorBundle {
            inputs,
            result: None,
            error: None,
            span: Some(&span),
        };
        handler.hydrate_span(target, &bundle, &span, Phase::Pre);

        OpenCall {
            span,
            parent,
            call_ctx,
        }
    }

    fn finish_call(
        &self,
        target: &InstrumentationTarget,
        inputs: &CallInputs,
        open: OpenCall,
        result: &Result<Value, CallError>,
    ) {
        let handler = target.handler();
        let error_message = match result {
            Err(e) if !e.is_control_flow() => {
                open.span.set_status_error(e.message());
                Some(e.message().to_string())
            }
            _ => None,
        };
        let bundle = AccessorBundle {
            inputs,
            result: result.as_ref().ok(),
            error: error_message.as_deref(),
            span: Some(&open.span),
        };
        handler.hydrate_span(target, &bundle, &open.span, Phase::Post);
        if let Err(e) =
            handler.post_task_processing(target, &bundle, &open.span, open.parent.as_ref())
        {
            tracing::warn!(call = %target.span_name(), error = %e, "post_task_processing failed");
        }
        open.span.set_status_ok_if_unset();
        open.span.end();
    }

    fn post_tracing(&self, target: &InstrumentationTarget, inputs: &CallInputs) {
        if let Err(e) = target.handler().post_tracing(target, inputs) {
            tracing::warn!(call = %target.span_name(), error = %e, "post_tracing failed");
        }
    }

    /// Trace one synchronous call. `f` runs exactly once either way.
    pub fn call<F>(
        &self,
        target: &Arc<InstrumentationTarget>,
        inputs: CallInputs,
        f: F,
    ) -> Result<Value, CallError>
    where
        F: FnOnce() -> Result<Value, CallError>,
    {
        let pre_ctx = self.pre_context(target, &inputs);
        let pre_token = Context::attach(pre_ctx.clone());

        let result = if self.should_skip(target, &inputs, &pre_ctx) {
            f()
        } else {
            let open = self.open_call(target, &inputs, &pre_ctx);
            let token = Context::attach(open.call_ctx.clone());
            let result = f();
            Context::detach(token);
            self.finish_call(target, &inputs, open, &result);
            result
        };

        Context::detach(pre_token);
        self.post_tracing(target, &inputs);
        result
    }

    /// Trace one async call; the span's context follows the future.
    pub async fn call_async<F>(
        &self,
        target: &Arc<InstrumentationTarget>,
        inputs: CallInputs,
        fut: F,
    ) -> Result<Value, CallError>
    where
        F: Future<Output = Result<Value, CallError>>,
    {
        let pre_ctx = self.pre_context(target, &inputs);

        let result = if self.should_skip(target, &inputs, &pre_ctx) {
            fut.with_context(pre_ctx).await
        } else {
            let open = self.open_call(target, &inputs, &pre_ctx);
            let result = fut.with_context(open.call_ctx.clone()).await;
            self.finish_call(target, &inputs, open, &result);
            result
        };

        self.post_tracing(target, &inputs);
        result
    }

    /// Trace a call that returns an iterator of stream items. The span stays
    /// open until the returned iterator is exhausted, unless the schema's
    /// auto-close predicate fires for these kwargs.
    pub fn call_stream<I, F>(
        &self,
        target: &Arc<InstrumentationTarget>,
        inputs: CallInputs,
        f: F,
    ) -> Result<InstrumentedIter<I>, CallError>
    where
        I: Iterator<Item = Value>,
        F: FnOnce() -> Result<I, CallError>,
    {
        let pre_ctx = self.pre_context(target, &inputs);
        let pre_token = Context::attach(pre_ctx.clone());

        let result = if self.should_skip(target, &inputs, &pre_ctx) {
            f().map(InstrumentedIter::passthrough)
        } else {
            let open = self.open_call(target, &inputs, &pre_ctx);
            let token = Context::attach(open.call_ctx.clone());
            let result = f();
            Context::detach(token);
            match result {
                Ok(iter) => Ok(self.defer_or_close(target, inputs.clone(), open, iter)),
                Err(e) => {
                    self.finish_call(target, &inputs, open, &Err(e.clone()));
                    Err(e)
                }
            }
        };

        Context::detach(pre_token);
        self.post_tracing(target, &inputs);
        result
    }

    /// Async variant of `call_stream` for `Stream`-returning calls.
    pub async fn call_stream_async<S, F>(
        &self,
        target: &Arc<InstrumentationTarget>,
        inputs: CallInputs,
        fut: F,
    ) -> Result<InstrumentedStream<S>, CallError>
    where
        S: Stream<Item = Value> + Unpin,
        F: Future<Output = Result<S, CallError>>,
    {
        let pre_ctx = self.pre_context(target, &inputs);

        let result = if self.should_skip(target, &inputs, &pre_ctx) {
            fut.with_context(pre_ctx).await.map(InstrumentedStream::passthrough)
        } else {
            let open = self.open_call(target, &inputs, &pre_ctx);
            match fut.with_context(open.call_ctx.clone()).await {
                Ok(stream) => {
                    let (processor, finisher) = self.split_stream(target, inputs.clone(), open);
                    Ok(match finisher {
                        Some(finisher) => InstrumentedStream::new(stream, processor, finisher),
                        None => InstrumentedStream::passthrough(stream),
                    })
                }
                Err(e) => {
                    self.finish_call(target, &inputs, open, &Err(e.clone()));
                    Err(e)
                }
            }
        };

        self.post_tracing(target, &inputs);
        result
    }

    fn defer_or_close<I: Iterator<Item = Value>>(
        &self,
        target: &Arc<InstrumentationTarget>,
        inputs: CallInputs,
        open: OpenCall,
        iter: I,
    ) -> InstrumentedIter<I> {
        let (processor, finisher) = self.split_stream(target, inputs, open);
        match finisher {
            Some(finisher) => InstrumentedIter::new(iter, processor, finisher),
            None => InstrumentedIter::passthrough(iter),
        }
    }

    /// Close the span now if the auto-close predicate fires; otherwise hand
    /// back a finisher for the stream proxy to invoke on exhaustion.
    fn split_stream(
        &self,
        target: &Arc<InstrumentationTarget>,
        inputs: CallInputs,
        open: OpenCall,
    ) -> (Arc<dyn StreamProcessor>, Option<SpanFinisher>) {
        let schema = target.schema();
        let processor = schema
            .stream_processor
            .clone()
            .unwrap_or_else(|| Arc::new(DefaultStreamProcessor));
        let auto_close = schema
            .auto_close
            .as_ref()
            .is_some_and(|pred| pred(&inputs.kwargs));
        let finisher = SpanFinisher {
            target: target.clone(),
            inputs,
            span: open.span,
            parent: open.parent,
        };
        if auto_close {
            finisher.finish(Value::Null);
            (processor, None)
        } else {
            (processor, Some(finisher))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{DefaultSpanHandler, SpanHandler};
    use crate::scope;
    use crate::sink::MemorySink;
    use crate::span::{AttrValue, SpanStatus};
    use crate::target::{
        AccessorValue, AttributeSpec, EntityGroup, OutputSchema, ScopeBindingSpec,
    };
    use serde_json::{json, Map};

    fn dispatcher() -> (Dispatcher, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        let tracer = Tracer::new(sink.clone(), "test-app");
        (Dispatcher::new(tracer), sink)
    }

    fn plain_target(name: &str) -> Arc<InstrumentationTarget> {
        Arc::new(InstrumentationTarget::new(
            "pkg",
            "Obj",
            name,
            Arc::new(DefaultSpanHandler),
        ))
    }

    #[test]
    fn nested_calls_share_a_trace_and_link_parents() {
        let (dispatcher, sink) = dispatcher();
        let outer = plain_target("outer");
        let inner = plain_target("inner");

        let result = dispatcher.call(&outer, CallInputs::default(), || {
            dispatcher.call(&inner, CallInputs::default(), || Ok(json!("inner-ok")))?;
            Ok(json!("outer-ok"))
        });
        assert_eq!(result.unwrap(), json!("outer-ok"));

        let spans = sink.finished();
        assert_eq!(spans.len(), 2);
        let inner_span = &spans[0];
        let outer_span = &spans[1];
        assert_eq!(inner_span.name, "pkg.Obj.inner");
        assert_eq!(inner_span.trace_id, outer_span.trace_id);
        assert_eq!(inner_span.parent_span_id.as_deref(), Some(outer_span.span_id.as_str()));
        assert!(outer_span.parent_span_id.is_none());
        assert_eq!(outer_span.status, SpanStatus::Ok);
    }

    #[test]
    fn root_span_carries_workflow_and_hosting_entities() {
        let (dispatcher, sink) = dispatcher();
        let target = plain_target("run");
        dispatcher
            .call(&target, CallInputs::default(), || Ok(Value::Null))
            .unwrap();

        let root = &sink.finished()[0];
        assert_eq!(root.attr_str("span.type"), Some("workflow"));
        assert_eq!(root.attr_str("entity.1.name"), Some("test-app"));
        assert_eq!(root.attr_str("entity.1.type"), Some("workflow.generic"));
        assert!(root.attr_str("entity.2.type").is_some());
        assert_eq!(root.attr_str("workflow.name"), Some("test-app"));
        // The reserved entities are counted even with no schema groups.
        assert_eq!(root.attr("entity.count"), Some(&AttrValue::Int(2)));
    }

    #[test]
    fn nested_workflow_target_opens_no_second_workflow_span() {
        let (dispatcher, sink) = dispatcher();
        let outer = Arc::new(
            InstrumentationTarget::new("app", "Pipeline", "run", Arc::new(DefaultSpanHandler))
                .as_workflow(),
        );
        let inner_workflow = Arc::new(
            InstrumentationTarget::new("app", "SubPipeline", "run", Arc::new(DefaultSpanHandler))
                .as_workflow(),
        );
        let leaf = plain_target("leaf");

        dispatcher
            .call(&outer, CallInputs::default(), || {
                dispatcher.call(&inner_workflow, CallInputs::default(), || {
                    dispatcher.call(&leaf, CallInputs::default(), || Ok(Value::Null))
                })
            })
            .unwrap();

        let spans = sink.finished();
        assert_eq!(spans.len(), 2);
        // The leaf parents directly onto the outer workflow span; the inner
        // workflow target ran untraced.
        assert_eq!(spans[0].name, "pkg.Obj.leaf");
        assert_eq!(spans[1].name, "app.Pipeline.run");
        assert_eq!(
            spans[0].parent_span_id.as_deref(),
            Some(spans[1].span_id.as_str())
        );
    }

    #[test]
    fn failure_marks_span_error_and_propagates() {
        let (dispatcher, sink) = dispatcher();
        let target = plain_target("fails");
        let result = dispatcher.call(&target, CallInputs::default(), || {
            Err(CallError::Failure("upstream 500".into()))
        });
        assert_eq!(result.unwrap_err().message(), "upstream 500");

        let span = &sink.finished()[0];
        assert_eq!(span.status, SpanStatus::Error("upstream 500".into()));
    }

    #[test]
    fn control_flow_error_leaves_span_ok_but_propagates() {
        let (dispatcher, sink) = dispatcher();
        let target = plain_target("stops");
        let result = dispatcher.call(&target, CallInputs::default(), || {
            Err(CallError::ControlFlow("iteration finished".into()))
        });
        assert!(result.unwrap_err().is_control_flow());

        let span = &sink.finished()[0];
        assert_eq!(span.status, SpanStatus::Ok);
    }

    #[test]
    fn skipped_target_runs_untraced() {
        let (dispatcher, sink) = dispatcher();
        let target = Arc::new(
            InstrumentationTarget::new("pkg", "Obj", "m", Arc::new(DefaultSpanHandler)).skipped(),
        );
        let result = dispatcher.call(&target, CallInputs::default(), || Ok(json!(7)));
        assert_eq!(result.unwrap(), json!(7));
        assert!(sink.finished().is_empty());
    }

    #[test]
    fn handler_skip_span_is_honored() {
        struct SkipAll;
        impl SpanHandler for SkipAll {
            fn skip_span(&self, _: &InstrumentationTarget, _: &CallInputs) -> bool {
                true
            }
        }
        let (dispatcher, sink) = dispatcher();
        let target = Arc::new(InstrumentationTarget::new("pkg", "O", "m", Arc::new(SkipAll)));
        dispatcher
            .call(&target, CallInputs::default(), || Ok(Value::Null))
            .unwrap();
        assert!(sink.finished().is_empty());
    }

    #[test]
    fn active_scopes_land_on_every_span() {
        let (dispatcher, sink) = dispatcher();
        let outer = plain_target("outer");
        let inner = plain_target("inner");

        scope::with_scope("session", Some("s-1"), || {
            dispatcher
                .call(&outer, CallInputs::default(), || {
                    scope::with_scope("request", Some("r-1"), || {
                        dispatcher.call(&inner, CallInputs::default(), || Ok(Value::Null))
                    })
                })
                .unwrap();
        });

        let spans = sink.finished();
        let inner_span = &spans[0];
        let outer_span = &spans[1];
        assert_eq!(inner_span.attr_str("scope.session"), Some("s-1"));
        assert_eq!(inner_span.attr_str("scope.request"), Some("r-1"));
        assert_eq!(outer_span.attr_str("scope.session"), Some("s-1"));
        assert!(outer_span.attr("scope.request").is_none());
    }

    #[test]
    fn target_scope_binding_tags_the_span() {
        let (dispatcher, sink) = dispatcher();
        let target = Arc::new(
            InstrumentationTarget::new("pkg", "Chat", "send", Arc::new(DefaultSpanHandler))
                .with_scope(ScopeBindingSpec {
                    name: "conversation".to_string(),
                    value: None,
                }),
        );
        dispatcher
            .call(&target, CallInputs::default(), || Ok(Value::Null))
            .unwrap();

        let span = &sink.finished()[0];
        let value = span.attr_str("scope.conversation").expect("scope bound");
        assert!(!value.is_empty());
        // The binding must not leak past the dispatcher.
        assert!(scope::current_scopes().is_empty());
    }

    #[test]
    fn schema_attributes_hydrate_in_both_phases() {
        let (dispatcher, sink) = dispatcher();
        let schema = OutputSchema {
            span_type: Some("inference".to_string()),
            groups: vec![EntityGroup::new(vec![
                AttributeSpec::new(
                    "model",
                    Phase::Pre,
                    Arc::new(|b: &AccessorBundle<'_>| {
                        let model = b
                            .inputs
                            .kwarg("model")
                            .and_then(Value::as_str)
                            .ok_or_else(|| anyhow::anyhow!("model missing"))?;
                        Ok(AccessorValue::str(model))
                    }),
                ),
                AttributeSpec::new(
                    "tokens",
                    Phase::Post,
                    Arc::new(|b: &AccessorBundle<'_>| {
                        let tokens = b
                            .result
                            .and_then(|r| r.get("usage"))
                            .and_then(Value::as_i64)
                            .ok_or_else(|| anyhow::anyhow!("usage missing"))?;
                        Ok(AccessorValue::int(tokens))
                    }),
                ),
            ])],
            ..Default::default()
        };
        let target = Arc::new(
            InstrumentationTarget::new("openai", "Chat", "create", Arc::new(DefaultSpanHandler))
                .with_schema(schema),
        );
        let mut kwargs = Map::new();
        kwargs.insert("model".to_string(), json!("gpt-4"));
        let inputs = CallInputs::new(Value::Null, vec![], kwargs);

        dispatcher
            .call(&target, inputs, || Ok(json!({"usage": 42})))
            .unwrap();

        let span = &sink.finished()[0];
        // Root span, so the schema group lands at index 3.
        assert_eq!(span.attr_str("entity.3.model"), Some("gpt-4"));
        assert_eq!(span.attr("entity.3.tokens"), Some(&AttrValue::Int(42)));
        assert_eq!(span.attr("entity.count"), Some(&AttrValue::Int(3)));
    }

    #[tokio::test]
    async fn async_calls_nest_like_sync_ones() {
        let (dispatcher, sink) = dispatcher();
        let outer = plain_target("outer");
        let inner = plain_target("inner");

        let d = dispatcher.clone();
        dispatcher
            .call_async(&outer, CallInputs::default(), async move {
                tokio::task::yield_now().await;
                d.call_async(&inner, CallInputs::default(), async { Ok(Value::Null) })
                    .await
            })
            .await
            .unwrap();

        let spans = sink.finished();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].trace_id, spans[1].trace_id);
        assert_eq!(
            spans[0].parent_span_id.as_deref(),
            Some(spans[1].span_id.as_str())
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_roots_get_independent_traces() {
        let (dispatcher, sink) = dispatcher();
        let target = plain_target("op");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let d = dispatcher.clone();
            let t = target.clone();
            handles.push(tokio::spawn(async move {
                d.call_async(&t, CallInputs::default(), async {
                    tokio::task::yield_now().await;
                    Ok(Value::Null)
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").unwrap();
        }

        let spans = sink.finished();
        assert_eq!(spans.len(), 8);
        let mut trace_ids: Vec<_> = spans.iter().map(|s| s.trace_id.clone()).collect();
        trace_ids.sort();
        trace_ids.dedup();
        assert_eq!(trace_ids.len(), 8);
        assert!(spans.iter().all(|s| s.parent_span_id.is_none()));
    }

    #[test]
    fn global_dispatcher_installs_once() {
        let (dispatcher, _sink) = dispatcher();
        let _ = set_global(dispatcher.clone());
        assert!(global().is_some());
        // The slot is already taken, whoever filled it.
        assert!(set_global(dispatcher).is_err());
    }

    #[test]
    fn context_is_clean_after_dispatch() {
        let (dispatcher, _sink) = dispatcher();
        let target = plain_target("op");
        dispatcher
            .call(&target, CallInputs::default(), || Ok(Value::Null))
            .unwrap();
        assert!(Context::current().span().is_none());
        assert!(Context::current().scopes().is_empty());
        assert!(!Context::current().workflow_open());
    }
}
