//! keeper CLI — runs and supervises stdio MCP servers.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keeper_config::ConfigStore;
use keeper_mcp::{DetachedConnector, McpConfig, ServerSnapshot, SupervisorOptions, SupervisorPool};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "keeper", version, about = "Supervise stdio MCP server processes")]
struct Cli {
    /// Enable verbose/debug logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Project root holding .codex/mcp_config.json (default: current directory)
    #[arg(long, global = true)]
    project_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start every enabled server and supervise until Ctrl+C
    Run {
        /// Quiet window before restarting after a script change, in milliseconds
        #[arg(long, default_value_t = 1000)]
        debounce_ms: u64,

        /// Print the final status report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the merged server configuration as JSON
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(io::stderr)
        .init();

    let project_root = match cli.project_root {
        Some(root) => root,
        None => std::env::current_dir().context("Failed to determine current directory")?,
    };
    let store = ConfigStore::for_project(&project_root);
    let config = store.load().await.with_context(|| {
        format!(
            "Failed to load MCP config ({} and {})",
            store.global_path().display(),
            store.project_path().display()
        )
    })?;
    tracing::debug!(
        project = %project_root.display(),
        servers = config.servers.len(),
        "configuration loaded"
    );

    match cli.command {
        Command::Config => {
            let json = serde_json::to_string_pretty(&config).context("Failed to serialize config")?;
            println!("{json}");
            Ok(())
        }
        Command::Run { debounce_ms, json } => {
            let options = SupervisorOptions {
                restart_debounce: Duration::from_millis(debounce_ms),
            };
            run(&config, options, json).await
        }
    }
}

async fn run(config: &McpConfig, options: SupervisorOptions, json: bool) -> Result<()> {
    if config.enabled_servers().next().is_none() {
        eprintln!("No enabled MCP servers configured.");
        return Ok(());
    }

    let pool = SupervisorPool::start(config, Arc::new(DetachedConnector), options).await;
    eprintln!(
        "Supervising {} MCP server(s), {} connected. Press Ctrl+C to stop.",
        pool.len(),
        pool.connected_count()
    );

    let waited = tokio::signal::ctrl_c().await;
    eprintln!();

    // Report what the servers looked like while running, then tear down.
    let snapshots = pool.snapshots();
    pool.shutdown().await;
    waited.context("Failed to listen for Ctrl+C")?;

    if json {
        let report =
            serde_json::to_string_pretty(&snapshots).context("Failed to serialize status report")?;
        println!("{report}");
    } else {
        print_summary(&snapshots);
    }
    Ok(())
}

fn print_summary(snapshots: &[ServerSnapshot]) {
    for snapshot in snapshots {
        let pid = snapshot
            .pid
            .map(|pid| format!(" (pid {pid})"))
            .unwrap_or_default();
        eprintln!("{}: {}{}", snapshot.name, snapshot.status, pid);
        if let Some(path) = &snapshot.watching {
            eprintln!("  watching {}", path.display());
        }
        let skip = snapshot.errors.len().saturating_sub(3);
        for error in &snapshot.errors[skip..] {
            eprintln!("  [{}] {}", error.at.format("%H:%M:%S"), error.message);
            if let Some(detail) = &error.detail {
                eprintln!("    {detail}");
            }
        }
    }
}
