//! Error types for the Kiln engine.

use std::path::PathBuf;

use thiserror::Error;

/// Engine-infrastructure failures.
///
/// These are the only failures `ScriptEngine::execute` surfaces as `Err`.
/// Everything the submitted script can cause — bundling failures, runtime
/// errors, timeouts — is encoded inside the returned `ExecutionResult`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The transient entry script could not be written to the workspace.
    #[error("cannot write entry script to workspace {path}: {source}")]
    WorkspaceWrite {
        /// The workspace root the engine tried to write into.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The configured workspace root does not exist or is not a directory.
    #[error("workspace root {0} is not a usable directory")]
    WorkspaceUnusable(PathBuf),

    /// The dedicated VM thread could not be set up or died before reporting.
    #[error("sandbox execution infrastructure failed: {0}")]
    Infrastructure(String),
}

/// Failures while turning an entry script into a self-contained bundle.
#[derive(Debug, Error)]
pub enum BundleError {
    /// An import specifier could not be resolved to a workspace module.
    #[error("cannot resolve import '{specifier}' from {referrer}: {reason}")]
    Resolve {
        /// The specifier as written in the source.
        specifier: String,
        /// The module that contained the import.
        referrer: String,
        /// Why resolution failed.
        reason: String,
    },

    /// A resolved module path points outside the workspace root.
    #[error("import '{0}' escapes the workspace")]
    EscapesWorkspace(String),

    /// A resolved module file could not be read.
    #[error("cannot read module {path}: {source}")]
    ModuleRead {
        /// The resolved module path.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}
