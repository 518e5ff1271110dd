//! Core library for tracewrap: retrofit tracing for code that was never
//! written with tracing in mind.
//!
//! The pieces fit together like this: a [`dispatch::Dispatcher`] wraps
//! calls to registered [`target::InstrumentationTarget`]s in spans, a
//! per-target [`handler::SpanHandler`] decides what lands on each span,
//! [`context::Context`] carries the current span and active scopes across
//! sync and async call chains, and finished spans are delivered to a
//! pluggable [`sink::SpanSink`]. Stream-returning calls are covered by
//! [`stream::InstrumentedIter`] and [`stream::InstrumentedStream`], which
//! keep the span open until the stream is exhausted.

pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod scope;
pub mod sink;
pub mod span;
pub mod stream;
pub mod target;
