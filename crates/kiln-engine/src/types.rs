//! Wire types for the engine's public operation.
//!
//! Field names follow the JSON casing the orchestrating agent speaks
//! (`timeoutSeconds`, `toolsCalled`, ...).

use serde::{Deserialize, Serialize};

/// Exit code for a successful run.
pub const EXIT_OK: i32 = 0;
/// Exit code for a bundling or runtime error in the submitted code.
pub const EXIT_ERROR: i32 = 1;
/// Exit code for a forced timeout, mirroring the conventional shell value.
pub const EXIT_TIMEOUT: i32 = 124;

/// The one scripting language the engine accepts (besides the empty string).
pub const SUPPORTED_LANGUAGE: &str = "javascript";

/// A single script submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    /// Source text of the script.
    pub code: String,

    /// Scripting language; must be [`SUPPORTED_LANGUAGE`] or empty.
    #[serde(default)]
    pub language: String,

    /// Wall-clock bound in seconds; 0 means the engine default.
    #[serde(default)]
    pub timeout_seconds: u64,
}

impl ExecutionRequest {
    /// Build a request for the default language with no explicit timeout.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language: String::new(),
            timeout_seconds: 0,
        }
    }

    /// Set an explicit timeout in seconds.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_seconds = secs;
        self
    }
}

/// The outcome of one script submission.
///
/// `exit_code == 0` implies `error.is_empty()`. `tools_called` lists the
/// tool names passed through the bridge's invocation shim, in call order,
/// repeats included, regardless of whether each call succeeded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Accumulated `console.log` output, newline-terminated per call.
    pub stdout: String,

    /// Accumulated `console.warn`/`console.error` output.
    pub stderr: String,

    /// 0 success, 1 bundling/runtime error, 124 timeout.
    pub exit_code: i32,

    /// Wall-clock duration of the VM phase only; bundling is excluded.
    pub execution_time_seconds: f64,

    /// Ordered trace of tool names invoked during this run.
    pub tools_called: Vec<String>,

    /// Human-readable failure message; empty on success.
    pub error: String,
}
