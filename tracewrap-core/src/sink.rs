//! Span sinks: where finished spans go.
//!
//! Any backend implementing `SpanSink` can be plugged in; the core never
//! serializes or transports spans itself. Sinks receive a span exactly once,
//! at `end()` time, and must not panic on hot paths.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use crate::error::CoreResult;
use crate::span::SpanData;

/// Implement this to receive finished spans.
///
/// Requirements:
/// - Implementations must be thread-safe (`Send + Sync`) and `'static`.
/// - `record` may be called from any thread; keep overhead minimal.
pub trait SpanSink: Send + Sync + std::fmt::Debug + 'static {
    fn record(&self, span: SpanData);
}

/// Collects spans in memory. The capture sink used throughout the tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    spans: Mutex<Vec<SpanData>>,
}

impl MemorySink {
    /// Snapshot of all finished spans, in end order.
    pub fn finished(&self) -> Vec<SpanData> {
        self.spans.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear(&self) {
        self.spans.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl SpanSink for MemorySink {
    fn record(&self, span: SpanData) {
        self.spans.lock().unwrap_or_else(|e| e.into_inner()).push(span);
    }
}

/// Appends one JSON object per finished span to a local file.
#[derive(Debug)]
pub struct FileSink {
    file: Mutex<File>,
}

impl FileSink {
    pub fn create<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl SpanSink for FileSink {
    fn record(&self, span: SpanData) {
        let line = match serde_json::to_string(&span) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("failed to serialize span {}: {}", span.span_id, e);
                return;
            }
        };
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(file, "{line}") {
            tracing::warn!("failed to write span {}: {}", span.span_id, e);
        }
    }
}

/// Drops every span. Useful as a placeholder or to disable export.
#[derive(Debug, Default)]
pub struct NullSink;

impl SpanSink for NullSink {
    fn record(&self, _span: SpanData) {}
}
