//! Supervisor pool — one supervisor per enabled server.

use crate::config::McpConfig;
use crate::session::SessionConnector;
use crate::supervisor::{ServerSnapshot, ServerStatus, ServerSupervisor, SupervisorOptions};
use futures_util::future::join_all;
use std::sync::Arc;

/// Owns the supervisors for every enabled server in a config.
pub struct SupervisorPool {
    supervisors: Vec<ServerSupervisor>,
}

impl SupervisorPool {
    /// Create supervisors for all enabled servers without starting them.
    pub fn new(
        config: &McpConfig,
        connector: Arc<dyn SessionConnector>,
        options: SupervisorOptions,
    ) -> Self {
        let supervisors = config
            .enabled_servers()
            .map(|(name, server_config)| {
                ServerSupervisor::with_options(
                    name.clone(),
                    server_config.clone(),
                    Arc::clone(&connector),
                    options.clone(),
                )
            })
            .collect();
        Self { supervisors }
    }

    /// Create the pool and connect every server in parallel.
    ///
    /// Servers that fail to start are logged and left in `Error` status; the
    /// pool continues with whatever servers are available.
    pub async fn start(
        config: &McpConfig,
        connector: Arc<dyn SessionConnector>,
        options: SupervisorOptions,
    ) -> Self {
        let pool = Self::new(config, connector, options);
        pool.connect_all().await;
        pool
    }

    /// Connect every supervisor in parallel.
    pub async fn connect_all(&self) {
        let results = join_all(self.supervisors.iter().map(|s| s.connect())).await;
        for (supervisor, result) in self.supervisors.iter().zip(results) {
            match result {
                Ok(()) => tracing::info!(
                    server = %supervisor.name(),
                    status = %supervisor.status(),
                    "MCP server start finished"
                ),
                Err(e) => tracing::warn!(server = %supervisor.name(), "Failed to start MCP server: {e}"),
            }
        }
    }

    /// Look up a supervisor by server name.
    pub fn get(&self, name: &str) -> Option<&ServerSupervisor> {
        self.supervisors.iter().find(|s| s.name() == name)
    }

    pub fn supervisors(&self) -> &[ServerSupervisor] {
        &self.supervisors
    }

    /// Number of supervised servers.
    pub fn len(&self) -> usize {
        self.supervisors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.supervisors.is_empty()
    }

    /// Number of servers currently connected.
    pub fn connected_count(&self) -> usize {
        self.supervisors
            .iter()
            .filter(|s| s.status() == ServerStatus::Connected)
            .count()
    }

    /// Status reports for every server, in config order.
    pub fn snapshots(&self) -> Vec<ServerSnapshot> {
        self.supervisors.iter().map(ServerSupervisor::snapshot).collect()
    }

    /// Dispose every supervisor in parallel.
    pub async fn shutdown(self) {
        join_all(self.supervisors.iter().map(|s| s.dispose())).await;
    }
}
