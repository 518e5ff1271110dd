//! Streaming-response adapter.
//!
//! A stream-returning call gets a proxy (`InstrumentedIter` /
//! `InstrumentedStream`) that re-yields every item to the consumer
//! unmodified while folding it into a `StreamState`. When the underlying
//! stream is exhausted, the accumulated state is assembled into a result
//! value and the deferred span is closed. A stream that is dropped
//! half-consumed never closes its span; that span is simply not exported.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use futures::Stream;
use serde_json::{Value, json};

use crate::dispatch::SpanFinisher;
use crate::span::now_nanos;

/// Accumulator for one in-flight stream.
#[derive(Debug)]
pub struct StreamState {
    pub waiting_for_first_token: bool,
    pub stream_start_unix_nano: u64,
    pub first_token_unix_nano: Option<u64>,
    pub closed_unix_nano: Option<u64>,
    pub accumulated: String,
    pub usage: Option<Value>,
    pub finish_reason: Option<String>,
    pub role: String,
    pub raw_items: Vec<Value>,
    pub tool_calls: Vec<Value>,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            waiting_for_first_token: true,
            stream_start_unix_nano: now_nanos(),
            first_token_unix_nano: None,
            closed_unix_nano: None,
            accumulated: String::new(),
            usage: None,
            finish_reason: None,
            role: "assistant".to_string(),
            raw_items: Vec::new(),
            tool_calls: Vec::new(),
        }
    }
}

impl StreamState {
    /// Append generated text; the first non-empty fragment stamps the
    /// time-to-first-token.
    pub fn add_content(&mut self, content: &str) {
        if !content.is_empty() && self.waiting_for_first_token {
            self.waiting_for_first_token = false;
            self.first_token_unix_nano = Some(now_nanos());
        }
        self.accumulated.push_str(content);
    }

    pub fn push_raw(&mut self, item: Value) {
        self.raw_items.push(item);
    }

    pub fn close(&mut self) {
        if self.closed_unix_nano.is_none() {
            self.closed_unix_nano = Some(now_nanos());
        }
    }
}

/// Folds raw stream items into a `StreamState`, one recognizer per wire
/// shape. The provided `process_fragment` tries each in order and falls
/// back to a generic `content` field.
pub trait StreamProcessor: Send + Sync {
    /// Typed event objects (`"type": "response.*"`).
    fn handle_event(&self, _item: &Value, _state: &mut StreamState) -> bool {
        false
    }

    /// Delta chunks carrying `choices[0].delta`.
    fn handle_chunk(&self, _item: &Value, _state: &mut StreamState) -> bool {
        false
    }

    /// Trailing metadata-only items, usage blocks in particular.
    fn handle_completion(&self, _item: &Value, _state: &mut StreamState) -> bool {
        false
    }

    /// Fallback for unrecognized items: a top-level string `content` field.
    fn apply_generic(&self, item: &Value, state: &mut StreamState) {
        if let Some(content) = item.get("content").and_then(Value::as_str) {
            state.add_content(content);
        }
    }

    fn process_fragment(&self, item: &Value, state: &mut StreamState) {
        state.push_raw(item.clone());
        if self.handle_event(item, state)
            || self.handle_chunk(item, state)
            || self.handle_completion(item, state)
        {
            return;
        }
        self.apply_generic(item, state);
    }

    /// One pass over the accumulated state after exhaustion, before the
    /// result is built. Reassembles anything that arrived fragmented.
    fn assemble(&self, _state: &mut StreamState) {}

    /// Shape the accumulated state into the span's post-phase result.
    fn build_result(&self, state: &StreamState) -> Value {
        let mut timestamps = BTreeMap::new();
        timestamps.insert("data.input", state.stream_start_unix_nano);
        timestamps.insert(
            "data.output",
            state
                .first_token_unix_nano
                .unwrap_or(state.stream_start_unix_nano),
        );
        timestamps.insert("metadata", state.closed_unix_nano.unwrap_or_else(now_nanos));
        json!({
            "type": "stream",
            "role": state.role,
            "output_text": state.accumulated,
            "usage": state.usage,
            "finish_reason": state.finish_reason,
            "tool_calls": state.tool_calls,
            "timestamps": timestamps,
        })
    }
}

/// Recognizes the two common LLM wire shapes: typed response events and
/// `choices[].delta` chunks, plus bare trailing usage blocks.
#[derive(Debug, Default)]
pub struct DefaultStreamProcessor;

impl StreamProcessor for DefaultStreamProcessor {
    fn handle_event(&self, item: &Value, state: &mut StreamState) -> bool {
        let Some(ty) = item.get("type").and_then(Value::as_str) else {
            return false;
        };
        if !ty.starts_with("response.") {
            return false;
        }
        match ty {
            "response.output_text.delta" => {
                if let Some(delta) = item.get("delta").and_then(Value::as_str) {
                    state.add_content(delta);
                }
            }
            "response.completed" => {
                if let Some(usage) = item.pointer("/response/usage") {
                    state.usage = Some(usage.clone());
                }
            }
            _ => {}
        }
        true
    }

    fn handle_chunk(&self, item: &Value, state: &mut StreamState) -> bool {
        let Some(choice) = item.pointer("/choices/0") else {
            return false;
        };
        if let Some(delta) = choice.get("delta") {
            if let Some(content) = delta.get("content").and_then(Value::as_str) {
                state.add_content(content);
            }
            if let Some(role) = delta.get("role").and_then(Value::as_str) {
                state.role = role.to_string();
            }
            if let Some(fragments) = delta.get("tool_calls").and_then(Value::as_array) {
                state.tool_calls.extend(fragments.iter().cloned());
            }
        }
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            state.finish_reason = Some(reason.to_string());
        }
        if let Some(usage) = item.get("usage").filter(|u| !u.is_null()) {
            state.usage = Some(usage.clone());
        }
        true
    }

    fn handle_completion(&self, item: &Value, state: &mut StreamState) -> bool {
        if item.get("choices").is_some() {
            return false;
        }
        let Some(usage) = item.get("usage").filter(|u| !u.is_null()) else {
            return false;
        };
        state.usage = Some(usage.clone());
        true
    }

    /// Tool calls stream as argument fragments keyed by index; stitch each
    /// index back into one call object.
    fn assemble(&self, state: &mut StreamState) {
        if state.tool_calls.is_empty() {
            return;
        }
        let mut assembled: Vec<Value> = Vec::new();
        for fragment in state.tool_calls.drain(..) {
            let index = fragment.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
            while assembled.len() <= index {
                assembled.push(json!({"function": {"name": "", "arguments": ""}}));
            }
            let entry = &mut assembled[index];
            if let Some(id) = fragment.get("id").and_then(Value::as_str) {
                entry["id"] = json!(id);
            }
            if let Some(name) = fragment.pointer("/function/name").and_then(Value::as_str) {
                entry["function"]["name"] = json!(name);
            }
            if let Some(args) = fragment
                .pointer("/function/arguments")
                .and_then(Value::as_str)
            {
                let current = entry["function"]["arguments"].as_str().unwrap_or("");
                entry["function"]["arguments"] = json!(format!("{current}{args}"));
            }
        }
        state.tool_calls = assembled;
    }
}

/// Iterator proxy around a traced stream. Yields every item unmodified and
/// closes the deferred span when the inner iterator is exhausted.
pub struct InstrumentedIter<I> {
    inner: I,
    processor: Arc<dyn StreamProcessor>,
    state: StreamState,
    finisher: Option<SpanFinisher>,
}

impl<I: Iterator<Item = Value>> InstrumentedIter<I> {
    pub(crate) fn new(
        inner: I,
        processor: Arc<dyn StreamProcessor>,
        finisher: SpanFinisher,
    ) -> Self {
        Self {
            inner,
            processor,
            state: StreamState::default(),
            finisher: Some(finisher),
        }
    }

    /// Proxy with no span to close; items pass through untouched.
    pub(crate) fn passthrough(inner: I) -> Self {
        Self {
            inner,
            processor: Arc::new(DefaultStreamProcessor),
            state: StreamState::default(),
            finisher: None,
        }
    }
}

impl<I: Iterator<Item = Value>> Iterator for InstrumentedIter<I> {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        match self.inner.next() {
            Some(item) => {
                if self.finisher.is_some() {
                    self.processor.process_fragment(&item, &mut self.state);
                }
                Some(item)
            }
            None => {
                if let Some(finisher) = self.finisher.take() {
                    self.state.close();
                    self.processor.assemble(&mut self.state);
                    finisher.finish(self.processor.build_result(&self.state));
                }
                None
            }
        }
    }
}

/// Async counterpart of `InstrumentedIter` for `Stream`-returning calls.
pub struct InstrumentedStream<S> {
    inner: S,
    processor: Arc<dyn StreamProcessor>,
    state: StreamState,
    finisher: Option<SpanFinisher>,
}

impl<S: Stream<Item = Value> + Unpin> InstrumentedStream<S> {
    pub(crate) fn new(
        inner: S,
        processor: Arc<dyn StreamProcessor>,
        finisher: SpanFinisher,
    ) -> Self {
        Self {
            inner,
            processor,
            state: StreamState::default(),
            finisher: Some(finisher),
        }
    }

    pub(crate) fn passthrough(inner: S) -> Self {
        Self {
            inner,
            processor: Arc::new(DefaultStreamProcessor),
            state: StreamState::default(),
            finisher: None,
        }
    }
}

impl<S: Stream<Item = Value> + Unpin> Stream for InstrumentedStream<S> {
    type Item = Value;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Value>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(item)) => {
                if this.finisher.is_some() {
                    this.processor.process_fragment(&item, &mut this.state);
                }
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => {
                if let Some(finisher) = this.finisher.take() {
                    this.state.close();
                    this.processor.assemble(&mut this.state);
                    finisher.finish(this.processor.build_result(&this.state));
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
