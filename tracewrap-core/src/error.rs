use thiserror::Error;

/// Core error type for tracewrap.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum TracewrapError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CoreResult<T> = std::result::Result<T, TracewrapError>;

/// Failure raised by the instrumented call itself. This is the only error
/// that ever crosses the dispatcher boundary, and it always propagates to
/// the caller unchanged.
///
/// `ControlFlow` marks framework-internal signals (generator stops, early
/// exits) that are not true failures: the span keeps its OK status and the
/// error is not recorded on it, but the caller still sees the error.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("{0}")]
    Failure(String),

    #[error("{0}")]
    ControlFlow(String),
}

impl CallError {
    pub fn is_control_flow(&self) -> bool {
        matches!(self, Self::ControlFlow(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Failure(m) | Self::ControlFlow(m) => m,
        }
    }
}

/// Failure raised by an attribute/event accessor.
///
/// `Fault` is raised deliberately to force the span into ERROR status with a
/// specific message; the faulting attribute is dropped but every other
/// accessor still runs. Any other error is logged and the single attribute
/// is omitted; the wrapped call is never affected either way.
#[derive(Debug, Error)]
pub enum AccessorError {
    #[error("span fault: {message}")]
    Fault { message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AccessorError {
    pub fn fault(message: impl Into<String>) -> Self {
        Self::Fault {
            message: message.into(),
        }
    }
}
