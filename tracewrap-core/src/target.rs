//! Instrumentation targets and output schemas.
//!
//! A target names one callable (`package.object.method`) and bundles
//! everything the dispatcher needs to trace it: the handler strategy, an
//! output schema describing which attributes and events to extract, the
//! workflow flag, and an optional scope binding. Targets are immutable
//! once built and shared behind `Arc`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::AccessorError;
use crate::handler::SpanHandler;
use crate::span::{AttrValue, Span};
use crate::stream::StreamProcessor;

/// The call-site data an accessor can read from.
pub struct AccessorBundle<'a> {
    pub inputs: &'a CallInputs,
    pub result: Option<&'a Value>,
    pub error: Option<&'a str>,
    pub span: Option<&'a Span>,
}

/// Inputs of one instrumented call, captured at the boundary.
#[derive(Debug, Clone, Default)]
pub struct CallInputs {
    pub instance: Value,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl CallInputs {
    pub fn new(instance: Value, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            instance,
            args,
            kwargs,
        }
    }

    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }
}

/// What an accessor hands back for one attribute or event field.
#[derive(Debug, Clone, PartialEq)]
pub enum AccessorValue {
    Scalar(AttrValue),
    List(Vec<String>),
    Map(BTreeMap<String, AttrValue>),
}

impl AccessorValue {
    pub fn str(v: impl Into<String>) -> Self {
        Self::Scalar(AttrValue::Str(v.into()))
    }

    pub fn int(v: i64) -> Self {
        Self::Scalar(AttrValue::Int(v))
    }
}

/// Extraction function run against the call-site data. Must never touch the
/// wrapped call; failures only affect the span.
pub type Accessor =
    Arc<dyn Fn(&AccessorBundle<'_>) -> Result<AccessorValue, AccessorError> + Send + Sync>;

/// When an accessor runs relative to the wrapped call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pre,
    Post,
}

/// One attribute inside an entity group.
#[derive(Clone)]
pub struct AttributeSpec {
    pub attribute: String,
    pub phase: Phase,
    pub accessor: Accessor,
}

impl AttributeSpec {
    pub fn new(attribute: impl Into<String>, phase: Phase, accessor: Accessor) -> Self {
        Self {
            attribute: attribute.into(),
            phase,
            accessor,
        }
    }
}

/// A group of attributes describing one participating entity (a model, a
/// vector store, an inference endpoint). Groups are indexed in order.
#[derive(Clone, Default)]
pub struct EntityGroup {
    pub attributes: Vec<AttributeSpec>,
}

impl EntityGroup {
    pub fn new(attributes: Vec<AttributeSpec>) -> Self {
        Self { attributes }
    }
}

/// One field of a span event. A `None` attribute name marks a map-valued
/// accessor whose entries are merged into the event wholesale.
#[derive(Clone)]
pub struct EventAttributeSpec {
    pub attribute: Option<String>,
    pub accessor: Accessor,
}

/// One span event to emit after the call completes.
#[derive(Clone)]
pub struct EventSpec {
    pub name: String,
    pub attributes: Vec<EventAttributeSpec>,
}

impl EventSpec {
    pub fn new(name: impl Into<String>, attributes: Vec<EventAttributeSpec>) -> Self {
        Self {
            name: name.into(),
            attributes,
        }
    }
}

/// Decides, from the call kwargs, whether a stream-returning call should be
/// finalized immediately instead of deferring to stream exhaustion.
pub type AutoClosePredicate = Arc<dyn Fn(&Map<String, Value>) -> bool + Send + Sync>;

/// Declarative description of what to extract from one kind of call.
#[derive(Clone, Default)]
pub struct OutputSchema {
    pub span_type: Option<String>,
    pub span_subtype: Option<String>,
    pub groups: Vec<EntityGroup>,
    pub events: Vec<EventSpec>,
    pub auto_close: Option<AutoClosePredicate>,
    pub stream_processor: Option<Arc<dyn StreamProcessor>>,
}

/// Scope to activate for the duration of one traced call. A `None` value
/// means generate a fresh id per call.
#[derive(Debug, Clone)]
pub struct ScopeBindingSpec {
    pub name: String,
    pub value: Option<String>,
}

/// A single instrumented callable and its tracing recipe.
pub struct InstrumentationTarget {
    package: String,
    object: String,
    method: String,
    span_name: Option<String>,
    handler: Arc<dyn SpanHandler>,
    schema: OutputSchema,
    workflow: bool,
    workflow_type: Option<String>,
    scope: Option<ScopeBindingSpec>,
    skip: bool,
}

impl InstrumentationTarget {
    pub fn new(
        package: impl Into<String>,
        object: impl Into<String>,
        method: impl Into<String>,
        handler: Arc<dyn SpanHandler>,
    ) -> Self {
        Self {
            package: package.into(),
            object: object.into(),
            method: method.into(),
            span_name: None,
            handler,
            schema: OutputSchema::default(),
            workflow: false,
            workflow_type: None,
            scope: None,
            skip: false,
        }
    }

    pub fn with_span_name(mut self, name: impl Into<String>) -> Self {
        self.span_name = Some(name.into());
        self
    }

    pub fn with_schema(mut self, schema: OutputSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Mark this target as a workflow root. At most one workflow span is
    /// opened per trace; nested workflow targets run untraced.
    pub fn as_workflow(mut self) -> Self {
        self.workflow = true;
        self
    }

    pub fn with_workflow_type(mut self, ty: impl Into<String>) -> Self {
        self.workflow = true;
        self.workflow_type = Some(ty.into());
        self
    }

    pub fn with_scope(mut self, scope: ScopeBindingSpec) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Disable tracing for this target without unregistering it.
    pub fn skipped(mut self) -> Self {
        self.skip = true;
        self
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Span name: the explicit override, else `package.object.method`.
    pub fn span_name(&self) -> String {
        match &self.span_name {
            Some(name) => name.clone(),
            None => format!("{}.{}.{}", self.package, self.object, self.method),
        }
    }

    pub fn handler(&self) -> &Arc<dyn SpanHandler> {
        &self.handler
    }

    pub fn schema(&self) -> &OutputSchema {
        &self.schema
    }

    pub fn is_workflow(&self) -> bool {
        self.workflow
    }

    pub fn workflow_type(&self) -> Option<&str> {
        self.workflow_type.as_deref()
    }

    pub fn scope(&self) -> Option<&ScopeBindingSpec> {
        self.scope.as_ref()
    }

    pub fn skip(&self) -> bool {
        self.skip
    }
}
