//! Span primitives and the `Tracer` entry point.
//!
//! Contract:
//! - A span is closed exactly once; later `end()` calls are no-ops.
//! - A span holds only a weak reference to its parent; parents are never
//!   kept alive by their children.
//! - `entity.count` is written at most once per span (one indexing pass).
//! - On `end()`, a serializable snapshot is handed to the installed
//!   `SpanSink`; nothing is exported for spans that are never closed.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sink::SpanSink;

/// Generate a unique 16-char hex span id (8 bytes).
fn generate_span_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

/// Generate a unique 32-char hex trace id (16 bytes).
fn generate_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Convert SystemTime to nanoseconds since Unix epoch.
pub(crate) fn system_time_to_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

pub(crate) fn now_nanos() -> u64 {
    system_time_to_nanos(SystemTime::now())
}

/// Attribute value: scalar or list of strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    StrList(Vec<String>),
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<Vec<String>> for AttrValue {
    fn from(v: Vec<String>) -> Self {
        Self::StrList(v)
    }
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SpanStatus {
    Unset,
    Ok,
    Error(String),
}

impl SpanStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp_unix_nano: u64,
    pub attributes: BTreeMap<String, AttrValue>,
}

#[derive(Debug)]
struct SpanState {
    attributes: BTreeMap<String, AttrValue>,
    events: Vec<SpanEvent>,
    status: SpanStatus,
    end_time_unix_nano: u64,
    ended: bool,
    groups_indexed: bool,
}

#[derive(Debug)]
pub(crate) struct SpanInner {
    span_id: String,
    trace_id: String,
    parent_span_id: Option<String>,
    parent: Weak<SpanInner>,
    name: String,
    start_time_unix_nano: u64,
    state: Mutex<SpanState>,
    sink: Arc<dyn SpanSink>,
}

/// A recorded operation. Cheap to clone; all clones refer to the same span.
///
/// Attributes are only ever written by the single logical task that owns the
/// span, so the internal mutex is uncontended by construction.
#[derive(Clone, Debug)]
pub struct Span {
    inner: Arc<SpanInner>,
}

impl Span {
    fn state(&self) -> MutexGuard<'_, SpanState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn span_id(&self) -> &str {
        &self.inner.span_id
    }

    pub fn trace_id(&self) -> &str {
        &self.inner.trace_id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Parent span, if it is still alive. The reference is weak by design.
    pub fn parent(&self) -> Option<Span> {
        self.inner.parent.upgrade().map(|inner| Span { inner })
    }

    /// True iff no parent existed in the execution context at creation.
    pub fn is_root(&self) -> bool {
        self.inner.parent_span_id.is_none()
    }

    pub fn status(&self) -> SpanStatus {
        self.state().status.clone()
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<AttrValue>) {
        let mut state = self.state();
        if state.ended {
            return;
        }
        state.attributes.insert(key.into(), value.into());
    }

    pub fn attribute(&self, key: &str) -> Option<AttrValue> {
        self.state().attributes.get(key).cloned()
    }

    pub fn add_event(
        &self,
        name: impl Into<String>,
        attributes: BTreeMap<String, AttrValue>,
        timestamp_unix_nano: Option<u64>,
    ) {
        let mut state = self.state();
        if state.ended {
            return;
        }
        state.events.push(SpanEvent {
            name: name.into(),
            timestamp_unix_nano: timestamp_unix_nano.unwrap_or_else(now_nanos),
            attributes,
        });
    }

    pub fn set_status_ok(&self) {
        self.state().status = SpanStatus::Ok;
    }

    /// Promote an unset status to OK. Never downgrades an error.
    pub fn set_status_ok_if_unset(&self) {
        let mut state = self.state();
        if state.status == SpanStatus::Unset {
            state.status = SpanStatus::Ok;
        }
    }

    pub fn set_status_error(&self, message: impl Into<String>) {
        self.state().status = SpanStatus::Error(message.into());
    }

    /// Record the final entity-group count. Only the first call wins: there
    /// is exactly one indexing pass per span.
    pub fn set_entity_count(&self, count: usize) {
        let mut state = self.state();
        if state.ended || state.groups_indexed {
            return;
        }
        state.groups_indexed = true;
        state
            .attributes
            .insert("entity.count".to_string(), AttrValue::Int(count as i64));
    }

    /// Close the span and export it. Exactly the first call has any effect.
    pub fn end(&self) {
        let data = {
            let mut state = self.state();
            if state.ended {
                return;
            }
            state.ended = true;
            state.end_time_unix_nano = now_nanos().max(self.inner.start_time_unix_nano);
            SpanData {
                trace_id: self.inner.trace_id.clone(),
                span_id: self.inner.span_id.clone(),
                parent_span_id: self.inner.parent_span_id.clone(),
                name: self.inner.name.clone(),
                start_time_unix_nano: self.inner.start_time_unix_nano,
                end_time_unix_nano: state.end_time_unix_nano,
                status: state.status.clone(),
                attributes: state.attributes.clone(),
                events: state.events.clone(),
            }
        };
        self.inner.sink.record(data);
    }

    pub(crate) fn downgrade(&self) -> Weak<SpanInner> {
        Arc::downgrade(&self.inner)
    }
}

/// Immutable snapshot of a finished span, as delivered to sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanData {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub name: String,
    pub start_time_unix_nano: u64,
    pub end_time_unix_nano: u64,
    pub status: SpanStatus,
    pub attributes: BTreeMap<String, AttrValue>,
    pub events: Vec<SpanEvent>,
}

impl SpanData {
    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key)
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(AttrValue::as_str)
    }

    pub fn event(&self, name: &str) -> Option<&SpanEvent> {
        self.events.iter().find(|e| e.name == name)
    }
}

/// Creates spans bound to one sink and one logical service identity.
#[derive(Clone)]
pub struct Tracer {
    sink: Arc<dyn SpanSink>,
    service_name: String,
}

impl Tracer {
    pub fn new(sink: Arc<dyn SpanSink>, service_name: impl Into<String>) -> Self {
        Self {
            sink,
            service_name: service_name.into(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Start a span. With a parent, the new span joins the parent's trace;
    /// without one it becomes the root of a fresh trace.
    pub fn start_span(&self, name: &str, parent: Option<&Span>) -> Span {
        let (trace_id, parent_span_id, parent_weak) = match parent {
            Some(p) => (
                p.trace_id().to_string(),
                Some(p.span_id().to_string()),
                p.downgrade(),
            ),
            None => (generate_trace_id(), None, Weak::new()),
        };
        Span {
            inner: Arc::new(SpanInner {
                span_id: generate_span_id(),
                trace_id,
                parent_span_id,
                parent: parent_weak,
                name: name.to_string(),
                start_time_unix_nano: now_nanos(),
                state: Mutex::new(SpanState {
                    attributes: BTreeMap::new(),
                    events: Vec::new(),
                    status: SpanStatus::Unset,
                    end_time_unix_nano: 0,
                    ended: false,
                    groups_indexed: false,
                }),
                sink: self.sink.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;

    fn tracer() -> (Tracer, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        (Tracer::new(sink.clone(), "test-service"), sink)
    }

    #[test]
    fn span_ids_are_hex_and_unique() {
        let (tracer, _sink) = tracer();
        let a = tracer.start_span("a", None);
        let b = tracer.start_span("b", None);
        assert_eq!(a.span_id().len(), 16);
        assert_eq!(a.trace_id().len(), 32);
        assert_ne!(a.span_id(), b.span_id());
        assert_ne!(a.trace_id(), b.trace_id());
    }

    #[test]
    fn child_inherits_trace_and_links_parent() {
        let (tracer, _sink) = tracer();
        let root = tracer.start_span("root", None);
        let child = tracer.start_span("child", Some(&root));
        assert!(root.is_root());
        assert!(!child.is_root());
        assert_eq!(child.trace_id(), root.trace_id());
        assert_eq!(
            child.parent().map(|p| p.span_id().to_string()),
            Some(root.span_id().to_string())
        );
    }

    #[test]
    fn end_exports_exactly_once() {
        let (tracer, sink) = tracer();
        let span = tracer.start_span("once", None);
        span.set_attribute("k", "v");
        span.end();
        span.end();
        span.end();
        let finished = sink.finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].attr_str("k"), Some("v"));
        assert!(finished[0].end_time_unix_nano >= finished[0].start_time_unix_nano);
    }

    #[test]
    fn unclosed_span_exports_nothing() {
        let (tracer, sink) = tracer();
        let span = tracer.start_span("leak", None);
        span.set_attribute("k", "v");
        drop(span);
        assert!(sink.finished().is_empty());
    }

    #[test]
    fn writes_after_end_are_dropped() {
        let (tracer, sink) = tracer();
        let span = tracer.start_span("sealed", None);
        span.end();
        span.set_attribute("late", "no");
        span.add_event("late-event", BTreeMap::new(), None);
        let finished = sink.finished();
        assert!(finished[0].attr("late").is_none());
        assert!(finished[0].events.is_empty());
    }

    #[test]
    fn entity_count_written_once() {
        let (tracer, sink) = tracer();
        let span = tracer.start_span("indexed", None);
        span.set_entity_count(4);
        span.set_entity_count(9);
        span.end();
        let finished = sink.finished();
        assert_eq!(finished[0].attr("entity.count"), Some(&AttrValue::Int(4)));
    }

    #[test]
    fn parent_reference_is_weak() {
        let (tracer, _sink) = tracer();
        let child = {
            let root = tracer.start_span("root", None);
            tracer.start_span("child", Some(&root))
        };
        // Parent dropped; the child must not have kept it alive.
        assert!(child.parent().is_none());
        assert!(!child.is_root());
    }

    #[test]
    fn status_transitions() {
        let (tracer, _sink) = tracer();
        let span = tracer.start_span("s", None);
        assert_eq!(span.status(), SpanStatus::Unset);
        span.set_status_ok_if_unset();
        assert_eq!(span.status(), SpanStatus::Ok);
        span.set_status_error("boom");
        span.set_status_ok_if_unset();
        assert!(span.status().is_error());
    }

    #[test]
    fn events_preserve_order_and_timestamps() {
        let (tracer, sink) = tracer();
        let span = tracer.start_span("ev", None);
        span.add_event("first", BTreeMap::new(), Some(100));
        let mut attrs = BTreeMap::new();
        attrs.insert("k".to_string(), AttrValue::from("v"));
        span.add_event("second", attrs, None);
        span.end();
        let finished = sink.finished();
        assert_eq!(finished[0].events.len(), 2);
        assert_eq!(finished[0].events[0].name, "first");
        assert_eq!(finished[0].events[0].timestamp_unix_nano, 100);
        assert_eq!(finished[0].event("second").unwrap().attributes["k"], AttrValue::from("v"));
    }
}
