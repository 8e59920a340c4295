//! Sandboxed execution of agent-submitted JavaScript.
//!
//! Kiln runs untrusted scripts inside fresh V8 isolates with no ambient
//! authority. A script interacts with the world only through four bridged
//! capabilities — console capture, tool invocation, tool search, and
//! loopback-restricted fetch — and a timeout supervisor guarantees every
//! execution terminates.
//!
//! # Architecture
//!
//! ```text
//! ExecutionRequest
//!     │
//!     ▼
//! Workspace::stage_entry ──► bundler (static import graph walk)
//!     │
//!     ▼
//! ScriptEngine ──► dedicated VM thread ──► JsRuntime + kiln_ext ops
//!     │                                        │
//!     │          watchdog thread ◄─────────────┤ terminate on deadline
//!     ▼                                        ▼
//! ExecutionResult ◄──────────── stdout/stderr buffers + tool trace
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kiln_engine::{EngineConfig, ExecutionRequest, HttpDispatcher, ScriptEngine};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = Arc::new(HttpDispatcher::new(
//!     "http://127.0.0.1:9090/invoke".parse()?,
//!     "http://127.0.0.1:9090/search".parse()?,
//! ));
//! let engine = ScriptEngine::new(EngineConfig::new("/srv/kiln/workspace"), dispatcher)?;
//!
//! let result = engine
//!     .execute(ExecutionRequest::new(r#"console.log("hi");"#))
//!     .await?;
//! assert_eq!(result.exit_code, 0);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod bundler;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod ops;
pub mod types;

pub use dispatch::{DetailLevel, HttpDispatcher, ToolDispatcher};
pub use error::{BundleError, EngineError};
pub use executor::{EngineConfig, ScriptEngine};
pub use types::{
    ExecutionRequest, ExecutionResult, EXIT_ERROR, EXIT_OK, EXIT_TIMEOUT, SUPPORTED_LANGUAGE,
};

pub use kiln_error::DispatchError;
