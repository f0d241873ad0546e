//! Error types for MCP server supervision.

use crate::process::ProcessExit;
use thiserror::Error;

/// Errors raised while supervising an MCP server.
///
/// Most of these never reach the caller of a lifecycle operation: the
/// supervisor records them in its error history and moves to `Error` status.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("MCP server '{name}' has an empty launch command")]
    InvalidCommand { name: String },

    #[error("Failed to spawn MCP server '{name}': {source}")]
    SpawnFailed {
        name: String,
        source: std::io::Error,
    },

    #[error("MCP server '{name}' exited unexpectedly ({exit})")]
    UnexpectedExit { name: String, exit: ProcessExit },

    #[error("File watcher on {path} failed: {message}")]
    Watcher { path: String, message: String },

    #[error("Session with MCP server '{name}' failed: {message}")]
    Session { name: String, message: String },

    #[error("MCP server '{name}' timed out after {timeout_secs}s")]
    Timeout { name: String, timeout_secs: u64 },

    #[error("Restart of MCP server '{name}' failed: {message}")]
    Restart { name: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
