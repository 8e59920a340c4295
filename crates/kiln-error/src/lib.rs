//! Typed error types for Kiln dispatcher traits.
//!
//! Provides [`DispatchError`] — the canonical error type returned by the
//! tool-invocation and tool-search dispatch targets, whether they run
//! in-process or over HTTP.

use thiserror::Error;

/// Canonical error type for Kiln dispatch operations.
///
/// All variants are `#[non_exhaustive]` to allow future additions without
/// breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// The requested tool does not exist in the catalog.
    #[error("tool not found: '{0}'")]
    ToolNotFound(String),

    /// The dispatch target returned an error for this call.
    #[error("upstream error from '{tool}': {message}")]
    Upstream {
        /// The tool that was invoked.
        tool: String,
        /// The error message from the dispatch target.
        message: String,
    },

    /// The HTTP dispatch endpoint could not be reached or failed mid-flight.
    #[error("dispatch transport error: {0}")]
    Transport(String),

    /// The call was abandoned because the caller's cancellation fired.
    #[error("dispatch cancelled")]
    Cancelled,

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl DispatchError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ToolNotFound(_) => "TOOL_NOT_FOUND",
            Self::Upstream { .. } => "UPSTREAM_ERROR",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Returns whether the operation that produced this error may succeed if retried.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Upstream { .. } => true,
            Self::Transport(_) => true,
            Self::ToolNotFound(_) => false,
            Self::Cancelled => false,
            Self::Internal(_) => false,
        }
    }

    /// Convert to a structured JSON error object for the submitting agent.
    pub fn to_structured_error(&self) -> serde_json::Value {
        serde_json::json!({
            "error": true,
            "code": self.code(),
            "message": self.to_string(),
            "retryable": self.retryable(),
        })
    }
}

// Compile-time assertion: DispatchError must be Send + Sync + 'static
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<DispatchError>();
};
