//! Runtime configuration: scope mappings and the span sink.
//!
//! Loaded from a TOML or JSON file. Everything has a default, so an empty
//! file is a valid configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{CoreResult, TracewrapError};
use crate::sink::{FileSink, MemorySink, NullSink, SpanSink};

/// Bind a scope to every call of one dotted method path.
#[derive(Debug, Clone, Deserialize)]
pub struct ScopeRule {
    pub method: String,
    pub scope_name: String,
    #[serde(default)]
    pub scope_value: Option<String>,
}

/// Map an inbound request header to a scope.
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderRule {
    pub header: String,
    pub scope_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Memory,
    File,
    #[default]
    Null,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SinkCfg {
    #[serde(default)]
    pub kind: SinkKind,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default)]
    pub scopes: Vec<ScopeRule>,
    #[serde(default)]
    pub headers: Vec<HeaderRule>,
    #[serde(default)]
    pub sink: SinkCfg,
}

fn default_service_name() -> String {
    "tracewrap".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            scopes: Vec::new(),
            headers: Vec::new(),
            sink: SinkCfg::default(),
        }
    }
}

impl Config {
    /// Load from a file, choosing the format by extension. Unknown
    /// extensions are probed as TOML first, then JSON.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&raw),
            Some("toml") => Self::from_toml(&raw),
            _ => Self::from_toml(&raw).or_else(|_| Self::from_json(&raw)),
        }
    }

    fn from_toml(raw: &str) -> CoreResult<Self> {
        toml::from_str(raw).map_err(|e| TracewrapError::Validation(format!("invalid config: {e}")))
    }

    fn from_json(raw: &str) -> CoreResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| TracewrapError::Validation(format!("invalid config: {e}")))
    }

    /// The scope rule configured for a dotted method path, if any.
    pub fn scope_for_method(&self, method: &str) -> Option<&ScopeRule> {
        self.scopes.iter().find(|rule| rule.method == method)
    }

    /// Construct the configured sink.
    pub fn build_sink(&self) -> CoreResult<Arc<dyn SpanSink>> {
        match self.sink.kind {
            SinkKind::Memory => Ok(Arc::new(MemorySink::default())),
            SinkKind::Null => Ok(Arc::new(NullSink)),
            SinkKind::File => {
                let path = self.sink.path.as_ref().ok_or_else(|| {
                    TracewrapError::Validation("file sink requires sink.path".to_string())
                })?;
                Ok(Arc::new(FileSink::create(path)?))
            }
        }
    }
}
