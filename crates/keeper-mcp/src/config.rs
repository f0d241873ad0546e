//! Configuration types for MCP servers.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Default handshake timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_enabled() -> bool {
    true
}

/// Merged MCP configuration: server name to server config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default, rename = "mcpServers")]
    pub servers: BTreeMap<String, ServerConfig>,
}

impl McpConfig {
    /// Iterate over servers with `enabled = true`.
    pub fn enabled_servers(&self) -> impl Iterator<Item = (&String, &ServerConfig)> {
        self.servers.iter().filter(|(_, config)| config.enabled)
    }
}

/// Optional protocol features a server is allowed to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub roots: bool,
    #[serde(default)]
    pub sampling: bool,
    #[serde(default)]
    pub logging: bool,
}

/// Configuration for a single MCP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Executable followed by its arguments.
    pub command: Vec<String>,
    /// Environment variables layered over the host environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub capabilities: Capabilities,
    /// Bound on the session handshake, in seconds (default: 30).
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

/// Executable and arguments extracted from a [`ServerConfig`] command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand<'a> {
    pub program: &'a str,
    pub args: &'a [String],
}

impl ServerConfig {
    /// Build a config with defaults for everything except the command.
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            env: HashMap::new(),
            enabled: true,
            capabilities: Capabilities::default(),
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Whether the command has at least one non-blank element.
    pub fn has_runnable_command(&self) -> bool {
        self.command.iter().any(|part| !part.trim().is_empty())
    }

    /// Split the command into program and arguments.
    ///
    /// Returns `None` when the command is empty, blank, or starts with a blank
    /// executable name.
    pub fn launch(&self) -> Option<LaunchCommand<'_>> {
        let (program, args) = self.command.split_first()?;
        if program.trim().is_empty() {
            return None;
        }
        Some(LaunchCommand { program, args })
    }
}
