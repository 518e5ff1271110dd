//! Span handler strategy: how one target's span gets populated.
//!
//! Contract:
//! - Handler hooks never disturb the wrapped call. Extraction failures are
//!   contained per attribute; lifecycle-hook failures are logged and
//!   swallowed by the dispatcher.
//! - Entity groups are indexed once per span. Root spans reserve indices
//!   1 and 2 for the workflow and hosting entities, so schema groups start
//!   at 3; on non-root spans they start at 1.
//! - `entity.count` is the highest index written, recorded in the post
//!   phase.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;

use crate::context::Context;
use crate::error::AccessorError;
use crate::span::{AttrValue, Span};
use crate::target::{AccessorBundle, AccessorValue, CallInputs, InstrumentationTarget, Phase};

/// Per-target strategy for populating spans. Every hook has a default, so
/// custom handlers override only what differs.
pub trait SpanHandler: Send + Sync {
    /// Decide at call time whether to trace at all.
    fn skip_span(&self, _target: &InstrumentationTarget, _inputs: &CallInputs) -> bool {
        false
    }

    /// Runs before any span is opened. Returns the context the call should
    /// execute under; the default activates the target's scope binding.
    fn pre_tracing(
        &self,
        target: &InstrumentationTarget,
        _inputs: &CallInputs,
        ctx: &Context,
    ) -> anyhow::Result<Context> {
        if let Some(binding) = target.scope() {
            let value = match &binding.value {
                Some(v) => v.clone(),
                None => uuid::Uuid::new_v4().simple().to_string(),
            };
            return Ok(ctx.with_scope(binding.name.clone(), value));
        }
        Ok(ctx.clone())
    }

    /// Runs after the span is closed and the context restored.
    fn post_tracing(
        &self,
        _target: &InstrumentationTarget,
        _inputs: &CallInputs,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs right after the span opens, before the wrapped call.
    fn pre_task_processing(
        &self,
        _target: &InstrumentationTarget,
        _inputs: &CallInputs,
        _span: &Span,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs after the wrapped call returns, before the span closes.
    fn post_task_processing(
        &self,
        _target: &InstrumentationTarget,
        _bundle: &AccessorBundle<'_>,
        _span: &Span,
        _parent: Option<&Span>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Run the schema's attribute accessors for one phase and write the
    /// results onto the span under indexed `entity.{i}.{name}` keys.
    fn hydrate_attributes(
        &self,
        target: &InstrumentationTarget,
        bundle: &AccessorBundle<'_>,
        span: &Span,
        phase: Phase,
    ) {
        let schema = target.schema();
        if let Some(ty) = &schema.span_type {
            span.set_attribute("span.type", ty.as_str());
        }
        if let Some(sub) = &schema.span_subtype {
            span.set_attribute("span.subtype", sub.as_str());
        }

        let base = if span.is_root() { 2 } else { 0 };
        for (i, group) in schema.groups.iter().enumerate() {
            let index = base + i + 1;
            for spec in &group.attributes {
                if spec.phase != phase {
                    continue;
                }
                match (spec.accessor)(bundle) {
                    Ok(AccessorValue::Scalar(v)) => {
                        span.set_attribute(format!("entity.{index}.{}", spec.attribute), v);
                    }
                    Ok(AccessorValue::List(v)) => {
                        span.set_attribute(format!("entity.{index}.{}", spec.attribute), v);
                    }
                    Ok(AccessorValue::Map(_)) => {
                        tracing::warn!(
                            attribute = %spec.attribute,
                            "map-valued accessor is only valid for events; dropping"
                        );
                    }
                    Err(AccessorError::Fault { message }) => {
                        span.set_status_error(message);
                    }
                    Err(e) => {
                        tracing::debug!(
                            attribute = %spec.attribute,
                            error = %e,
                            "attribute accessor failed; omitting"
                        );
                    }
                }
            }
        }
        // Root spans always carry the two reserved entities, so the count
        // is written even when the schema contributes no groups.
        let count = base + schema.groups.len();
        if phase == Phase::Post && count > 0 {
            span.set_entity_count(count);
        }
    }

    /// Run the schema's event accessors and attach the resulting events.
    fn hydrate_events(
        &self,
        target: &InstrumentationTarget,
        bundle: &AccessorBundle<'_>,
        span: &Span,
    ) {
        for event in &target.schema().events {
            let mut attrs: BTreeMap<String, AttrValue> = BTreeMap::new();
            for spec in &event.attributes {
                match ((spec.accessor)(bundle), &spec.attribute) {
                    (Ok(AccessorValue::Scalar(v)), Some(name)) => {
                        attrs.insert(name.clone(), v);
                    }
                    (Ok(AccessorValue::List(v)), Some(name)) => {
                        attrs.insert(name.clone(), AttrValue::StrList(v));
                    }
                    (Ok(AccessorValue::Map(map)), _) => {
                        attrs.extend(map);
                    }
                    (Ok(_), None) => {
                        tracing::warn!(
                            event = %event.name,
                            "unnamed event accessor returned a non-map value; dropping"
                        );
                    }
                    (Err(AccessorError::Fault { message }), _) => {
                        span.set_status_error(message);
                    }
                    (Err(e), name) => {
                        tracing::debug!(
                            event = %event.name,
                            attribute = ?name,
                            error = %e,
                            "event accessor failed; omitting"
                        );
                    }
                }
            }
            let timestamp = event_timestamp(bundle.result, &event.name);
            span.add_event(event.name.clone(), attrs, timestamp);
        }
    }

    /// Full hydration for one phase: attributes always, events post only.
    fn hydrate_span(
        &self,
        target: &InstrumentationTarget,
        bundle: &AccessorBundle<'_>,
        span: &Span,
        phase: Phase,
    ) {
        self.hydrate_attributes(target, bundle, span, phase);
        if phase == Phase::Post {
            self.hydrate_events(target, bundle, span);
        }
    }
}

/// Results may carry a `timestamps` object mapping event names to epoch
/// nanos, typically produced by stream assembly. Missing entries fall back
/// to "now" inside `add_event`.
fn event_timestamp(result: Option<&Value>, event_name: &str) -> Option<u64> {
    result?
        .get("timestamps")?
        .get(event_name)?
        .as_u64()
}

/// Handler with every hook at its default behavior.
#[derive(Debug, Default)]
pub struct DefaultSpanHandler;

impl SpanHandler for DefaultSpanHandler {}

/// Named handler lookup; targets are configured with a handler name and
/// resolved here. "default" is always present.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn SpanHandler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        let mut handlers: HashMap<String, Arc<dyn SpanHandler>> = HashMap::new();
        handlers.insert("default".to_string(), Arc::new(DefaultSpanHandler));
        Self { handlers }
    }
}

impl HandlerRegistry {
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn SpanHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SpanHandler>> {
        self.handlers.get(name).cloned()
    }
}

/// Attributes every span carries regardless of schema.
pub(crate) fn set_default_attributes(span: &Span, ctx: &Context, service_name: &str) {
    span.set_attribute("tracewrap.version", env!("CARGO_PKG_VERSION"));
    span.set_attribute("tracewrap.language", "rust");
    span.set_attribute("workflow.name", service_name);
    for (name, value) in ctx.scopes() {
        span.set_attribute(format!("scope.{name}"), value.as_str());
    }
}

const WORKFLOW_TYPE_MAP: &[(&str, &str)] = &[
    ("langchain", "workflow.langchain"),
    ("llama_index", "workflow.llamaindex"),
    ("llamaindex", "workflow.llamaindex"),
    ("haystack", "workflow.haystack"),
    ("openai", "workflow.openai"),
    ("anthropic", "workflow.anthropic"),
];

fn workflow_type_for(target: &InstrumentationTarget) -> String {
    if let Some(ty) = target.workflow_type() {
        return format!("workflow.{ty}");
    }
    for (prefix, ty) in WORKFLOW_TYPE_MAP {
        if target.package().starts_with(prefix) {
            return (*ty).to_string();
        }
    }
    "workflow.generic".to_string()
}

/// Mark a root span as the workflow entry point: entity 1 is the workflow
/// itself, entity 2 the hosting environment.
pub(crate) fn set_workflow_properties(
    span: &Span,
    target: &InstrumentationTarget,
    service_name: &str,
) {
    span.set_attribute("span.type", "workflow");
    span.set_attribute("entity.1.name", service_name);
    span.set_attribute("entity.1.type", workflow_type_for(target));
    let (infra_type, infra_name) = hosting_identity();
    span.set_attribute("entity.2.type", infra_type);
    span.set_attribute("entity.2.name", infra_name);
}

/// Detect the hosting environment from well-known platform variables.
pub fn hosting_identity() -> (String, String) {
    hosting_identity_from(|key| std::env::var(key).ok())
}

fn hosting_identity_from(get: impl Fn(&str) -> Option<String>) -> (String, String) {
    if get("AWS_LAMBDA_RUNTIME_API").is_some() {
        let name = get("AWS_LAMBDA_FUNCTION_NAME").unwrap_or_default();
        return ("app_hosting.aws_lambda".to_string(), name);
    }
    if let Some(name) = get("WEBSITE_SITE_NAME") {
        if get("FUNCTIONS_WORKER_RUNTIME").is_some() {
            return ("app_hosting.azure_func".to_string(), name);
        }
        return ("app_hosting.azure_webapp".to_string(), name);
    }
    if get("CODESPACES").is_some() {
        let name = get("CODESPACE_NAME").unwrap_or_default();
        return ("app_hosting.github_codespace".to_string(), name);
    }
    ("app_hosting.generic".to_string(), "generic".to_string())
}
