//! Lifecycle supervision for stdio-based MCP servers.
//!
//! Each configured server is spawned as a child process with all three
//! standard streams captured. A [`ServerSupervisor`] tracks its lifecycle,
//! tells crashes apart from requested shutdowns, and restarts the server
//! (debounced) when the script it runs changes on disk. The protocol spoken
//! over stdin/stdout is left to a pluggable [`SessionConnector`].

pub mod config;
pub mod error;
pub mod history;
pub mod pool;
pub mod process;
pub mod session;
pub mod supervisor;
pub mod watcher;

pub use config::{Capabilities, McpConfig, ServerConfig};
pub use error::SupervisorError;
pub use history::ErrorRecord;
pub use pool::SupervisorPool;
pub use process::{ProcessEvent, ProcessExit, ProcessHandle, ProcessStreams};
pub use session::{DetachedConnector, Session, SessionConnector};
pub use supervisor::{ServerSnapshot, ServerStatus, ServerSupervisor, SupervisorOptions};
pub use watcher::{ChangeWatcher, WatchEvent};
