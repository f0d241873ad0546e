//! One configuration file as written on disk.
//!
//! Each file is validated on its own with defaults filled in, then the
//! project file is merged over the global one. A field the project file
//! leaves out therefore takes its default, not the global value; only `env`
//! is merged key by key.

use crate::error::ConfigError;
use keeper_mcp::{McpConfig, ServerConfig};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub(crate) struct ConfigLayer {
    #[serde(default, rename = "mcpServers")]
    pub servers: BTreeMap<String, ServerConfig>,
}

impl ConfigLayer {
    /// Parse and validate the contents of one file.
    pub fn parse(path: &Path, content: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        let invalid = |message: String| ConfigError::Invalid {
            path: path.to_path_buf(),
            message,
        };

        if !value.is_object() {
            return Err(invalid("top level must be a JSON object".to_string()));
        }
        let layer: ConfigLayer = serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;

        for (name, server) in &layer.servers {
            validate(server).map_err(|message| invalid(format!("server '{name}': {message}")))?;
        }
        Ok(layer)
    }

    /// Lay `project` over `self`. Servers present in one layer only are kept
    /// as they are.
    pub fn merge(mut self, project: ConfigLayer) -> Self {
        for (name, over) in project.servers {
            let merged = match self.servers.remove(&name) {
                Some(base) => merge_server(base, over),
                None => over,
            };
            self.servers.insert(name, merged);
        }
        self
    }

    pub fn finish(self) -> McpConfig {
        McpConfig {
            servers: self.servers,
        }
    }
}

fn validate(server: &ServerConfig) -> Result<(), String> {
    if server.command.is_empty() {
        return Err("command must have at least one element".to_string());
    }
    if !server.has_runnable_command() {
        return Err("command must have a non-blank element".to_string());
    }
    if server.timeout_seconds == 0 {
        return Err("timeoutSeconds must be a positive integer".to_string());
    }
    Ok(())
}

fn merge_server(base: ServerConfig, over: ServerConfig) -> ServerConfig {
    // Arrays are replaced wholesale, never concatenated.
    let mut env = base.env;
    env.extend(over.env);
    ServerConfig { env, ..over }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeper_mcp::Capabilities;
    use keeper_mcp::config::DEFAULT_TIMEOUT_SECS;

    fn parse(content: &str) -> Result<ConfigLayer, ConfigError> {
        ConfigLayer::parse(Path::new("/tmp/mcp_config.json"), content)
    }

    #[test]
    fn parses_full_server_entry_with_defaults() {
        let layer = parse(
            r#"{
                "mcpServers": {
                    "files": {
                        "command": ["node", "server.js"],
                        "env": {"DEBUG": "1"},
                        "enabled": false,
                        "capabilities": {"roots": true},
                        "timeoutSeconds": 5,
                        "description": "unknown keys are ignored"
                    }
                }
            }"#,
        )
        .unwrap();
        let files = &layer.servers["files"];
        assert_eq!(files.command, vec!["node", "server.js"]);
        assert!(!files.enabled);
        assert_eq!(files.timeout_seconds, 5);
        assert!(files.capabilities.roots);
        assert!(!files.capabilities.sampling);
    }

    #[test]
    fn missing_servers_key_is_empty() {
        assert!(parse("{}").unwrap().servers.is_empty());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(parse("{ not json"), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn rejects_non_object_top_level() {
        assert!(matches!(parse("[1, 2]"), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn rejects_schema_violations() {
        let cases = [
            r#"{"mcpServers": {"a": {}}}"#,
            r#"{"mcpServers": {"a": {"command": []}}}"#,
            r#"{"mcpServers": {"a": {"command": ["", "  "]}}}"#,
            r#"{"mcpServers": {"a": {"command": ["x"], "timeoutSeconds": 0}}}"#,
            r#"{"mcpServers": {"a": {"command": ["x"], "timeoutSeconds": -3}}}"#,
            r#"{"mcpServers": {"a": {"command": ["x"], "env": {"K": 1}}}}"#,
            r#"{"mcpServers": {"a": {"command": "node server.js"}}}"#,
        ];
        for case in cases {
            assert!(
                matches!(parse(case), Err(ConfigError::Invalid { .. })),
                "expected invalid: {case}"
            );
        }
    }

    #[test]
    fn invalid_message_names_the_server() {
        let err = parse(r#"{"mcpServers": {"broken": {"command": []}}}"#).unwrap_err();
        assert!(err.to_string().contains("server 'broken'"));
    }

    #[test]
    fn merge_replaces_command_and_merges_env() {
        let global = parse(
            r#"{"mcpServers": {"A": {"command": ["g"], "env": {"X": "g", "Y": "g"}}}}"#,
        )
        .unwrap();
        let project = parse(
            r#"{"mcpServers": {"A": {"command": ["p"], "env": {"Y": "p", "Z": "p"}}}}"#,
        )
        .unwrap();

        let config = global.merge(project).finish();
        let a = &config.servers["A"];
        assert_eq!(a.command, vec!["p"]);
        assert_eq!(a.env.len(), 3);
        assert_eq!(a.env["X"], "g");
        assert_eq!(a.env["Y"], "p");
        assert_eq!(a.env["Z"], "p");
    }

    #[test]
    fn merge_resets_scalars_the_project_omits() {
        let global = parse(
            r#"{"mcpServers": {"A": {
                "command": ["g", "--long", "--args"],
                "env": {"TOKEN": "g"},
                "enabled": false,
                "timeoutSeconds": 90,
                "capabilities": {"roots": true, "logging": true}
            }}}"#,
        )
        .unwrap();
        let project = parse(r#"{"mcpServers": {"A": {"command": ["p"]}}}"#).unwrap();

        let a = global.merge(project).finish().servers.remove("A").unwrap();
        assert_eq!(a.command, vec!["p"]);
        assert!(a.enabled);
        assert_eq!(a.timeout_seconds, DEFAULT_TIMEOUT_SECS);
        assert_eq!(a.capabilities, Capabilities::default());
        assert_eq!(a.env["TOKEN"], "g");
    }

    #[test]
    fn merge_takes_scalars_the_project_sets() {
        let global = parse(
            r#"{"mcpServers": {"A": {"command": ["g"], "timeoutSeconds": 90}}}"#,
        )
        .unwrap();
        let project = parse(
            r#"{"mcpServers": {"A": {
                "command": ["p"],
                "enabled": false,
                "timeoutSeconds": 5,
                "capabilities": {"sampling": true}
            }}}"#,
        )
        .unwrap();

        let a = global.merge(project).finish().servers.remove("A").unwrap();
        assert!(!a.enabled);
        assert_eq!(a.timeout_seconds, 5);
        assert!(a.capabilities.sampling);
        assert!(!a.capabilities.roots);
    }

    #[test]
    fn merge_keeps_servers_from_both_layers() {
        let global = parse(r#"{"mcpServers": {"A": {"command": ["a"]}}}"#).unwrap();
        let project = parse(r#"{"mcpServers": {"B": {"command": ["b"]}}}"#).unwrap();
        let config = global.merge(project).finish();
        let names: Vec<_> = config.servers.keys().cloned().collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn parse_applies_defaults() {
        let config = parse(r#"{"mcpServers": {"A": {"command": ["a"]}}}"#)
            .unwrap()
            .finish();
        let a = &config.servers["A"];
        assert!(a.enabled);
        assert!(a.env.is_empty());
        assert_eq!(a.capabilities, Capabilities::default());
        assert_eq!(a.timeout_seconds, DEFAULT_TIMEOUT_SECS);
    }
}
