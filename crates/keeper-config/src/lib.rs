//! MCP server configuration discovery.
//!
//! Two JSON files define the servers, with the project file taking
//! precedence:
//! 1. Project config (`<project>/.codex/mcp_config.json`)
//! 2. Global config (`~/.codex/mcp_config.json`, or `$KEEPER_CONFIG_DIR`)
//!
//! A missing, malformed or schema-invalid file is treated as absent.

mod error;
mod layer;

pub use error::ConfigError;

use keeper_mcp::McpConfig;
use layer::ConfigLayer;
use std::path::{Path, PathBuf};

/// Directory holding the config file, under home or a project root.
pub const CONFIG_DIR_NAME: &str = ".codex";

/// File name of both config files.
pub const CONFIG_FILE_NAME: &str = "mcp_config.json";

/// Environment variable that replaces `~/.codex` as the global config dir.
pub const CONFIG_DIR_ENV: &str = "KEEPER_CONFIG_DIR";

/// Locates and loads the global and project config files.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    global_path: PathBuf,
    project_path: PathBuf,
}

impl ConfigStore {
    pub fn new(global_path: impl Into<PathBuf>, project_path: impl Into<PathBuf>) -> Self {
        Self {
            global_path: global_path.into(),
            project_path: project_path.into(),
        }
    }

    /// Store for the given project root and the user's global config.
    pub fn for_project(project_root: &Path) -> Self {
        Self::new(
            global_config_path(),
            project_root.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME),
        )
    }

    pub fn global_path(&self) -> &Path {
        &self.global_path
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    /// Read both files and merge the project config over the global one.
    ///
    /// Each call re-reads the files and returns a fresh config.
    pub async fn load(&self) -> Result<McpConfig, ConfigError> {
        let global = read_layer(&self.global_path).await?;
        let project = read_layer(&self.project_path).await?;

        let merged = match (global, project) {
            (Some(global), Some(project)) => global.merge(project),
            (global, project) => project.or(global).unwrap_or_default(),
        };
        let config = merged.finish();
        tracing::debug!(servers = config.servers.len(), "loaded MCP config");
        Ok(config)
    }
}

/// Get the global config directory (`~/.codex/`).
pub fn config_dir() -> PathBuf {
    resolve_config_dir(
        std::env::var_os(CONFIG_DIR_ENV).map(PathBuf::from),
        dirs_next::home_dir(),
    )
}

/// Path of the global config file.
pub fn global_config_path() -> PathBuf {
    config_dir().join(CONFIG_FILE_NAME)
}

fn resolve_config_dir(override_dir: Option<PathBuf>, home: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = override_dir.filter(|dir| !dir.as_os_str().is_empty()) {
        return dir;
    }
    home.unwrap_or_else(|| PathBuf::from(".")).join(CONFIG_DIR_NAME)
}

/// Read one config file. `Ok(None)` means the file is absent or unusable.
async fn read_layer(path: &Path) -> Result<Option<ConfigLayer>, ConfigError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no MCP config file");
            return Ok(None);
        }
        // Not UTF-8: a content problem, not an I/O one.
        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
            tracing::warn!("Failed to parse {}: {}", path.display(), e);
            return Ok(None);
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    match ConfigLayer::parse(path, &content) {
        Ok(layer) => Ok(Some(layer)),
        Err(e) => {
            tracing::warn!("{e}; ignoring file");
            Ok(None)
        }
    }
}
