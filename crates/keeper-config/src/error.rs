use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading MCP configuration files.
///
/// `Parse` and `Invalid` are recovered by [`crate::ConfigStore::load`], which
/// logs them and treats the file as absent. Only `Io` reaches the caller.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("Invalid MCP config in {}: {message}", path.display())]
    Invalid { path: PathBuf, message: String },

    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}
