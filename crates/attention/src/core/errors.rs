//! Error types emitted while preparing and dispatching attention.

use thiserror::Error;

use crate::selector::KernelCandidate;

/// Attention-specific error category.
///
/// Every variant is fatal for the invocation that raised it; no partial output
/// is returned alongside an error.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// Incompatible or contradictory input layouts or dimensions.
    #[error("shape mismatch: {context}")]
    ShapeMismatch { context: String },

    /// A shared past/present buffer is too small for the requested append.
    #[error(
        "kv cache capacity exceeded: {required} positions required, buffer holds {capacity}"
    )]
    CapacityExceeded { required: usize, capacity: usize },

    /// No kernel candidate can serve the request.
    #[error("unsupported configuration: {reason}")]
    UnsupportedConfiguration { reason: String },

    /// The selected compute backend failed.
    #[error("{kernel} kernel failed: {message}")]
    BackendExecutionFailure {
        kernel: KernelCandidate,
        message: String,
    },

    /// Static attributes violate their documented invariants.
    #[error("invalid attention config: {0}")]
    InvalidConfig(String),

    #[error("failed to read attention config: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("failed to parse attention config: {0}")]
    ConfigFormat(String),

    /// Tensor operation issued by the orchestration layer itself failed.
    #[error("tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl AttentionError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
        }
    }

    pub(crate) fn unsupported(reason: impl Into<String>) -> Self {
        Self::UnsupportedConfiguration {
            reason: reason.into(),
        }
    }
}

impl From<toml::de::Error> for AttentionError {
    fn from(err: toml::de::Error) -> Self {
        Self::ConfigFormat(err.to_string())
    }
}

impl From<serde_json::Error> for AttentionError {
    fn from(err: serde_json::Error) -> Self {
        Self::ConfigFormat(err.to_string())
    }
}
