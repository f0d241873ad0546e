//! Per-server lifecycle supervision.
//!
//! A [`ServerSupervisor`] owns at most one process, one file watcher and one
//! session at a time. Process and watcher events arrive on background tasks
//! tagged with the id of the run that produced them, so events from a
//! previous run never touch the current one. Every handler reads the current
//! status under the state lock before deciding what an event means.

use crate::config::ServerConfig;
use crate::error::SupervisorError;
use crate::history::{DiagnosticHistory, ErrorRecord, error_chain};
use crate::process::{ProcessEvent, ProcessExit, ProcessHandle, ProcessStreams};
use crate::session::{Session, SessionConnector};
use crate::watcher::{ChangeWatcher, WatchEvent, watch_target};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Quiet window after the last change before a restart runs.
pub const DEFAULT_RESTART_DEBOUNCE: Duration = Duration::from_millis(1000);

/// Lifecycle state of one server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    #[default]
    Idle,
    Starting,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Error,
}

impl ServerStatus {
    /// Whether a lifecycle transition is in flight.
    pub fn is_transitional(self) -> bool {
        matches!(self, Self::Starting | Self::Connecting | Self::Disconnecting)
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Tunables for a supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Quiet window used to coalesce change notifications.
    pub restart_debounce: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            restart_debounce: DEFAULT_RESTART_DEBOUNCE,
        }
    }
}

/// Point-in-time report of a server for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSnapshot {
    pub name: String,
    pub status: ServerStatus,
    pub pid: Option<u32>,
    pub watching: Option<PathBuf>,
    pub stderr: Vec<String>,
    pub errors: Vec<ErrorRecord>,
}

/// Supervises one configured MCP server.
///
/// Cloning is cheap and yields another handle to the same supervisor.
/// `connect` and `disconnect` are meant to be called one at a time per
/// server; overlapping calls are rejected or wait rather than interleave.
#[derive(Clone)]
pub struct ServerSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    config: ServerConfig,
    options: SupervisorOptions,
    connector: Arc<dyn SessionConnector>,
    status_tx: watch::Sender<ServerStatus>,
    state: Mutex<State>,
    restart: Mutex<PendingRestart>,
}

#[derive(Default)]
struct State {
    status: ServerStatus,
    /// Id of the most recent run. Bumped on every start attempt.
    run: u64,
    process: Option<ProcessHandle>,
    watcher: Option<ChangeWatcher>,
    session: Option<Box<dyn Session>>,
    history: DiagnosticHistory,
    disposed: bool,
}

#[derive(Default)]
struct PendingRestart {
    generation: u64,
    token: Option<CancellationToken>,
}

/// Resources released by a disconnect, torn down outside the state lock.
enum Teardown {
    NotRunning(ServerStatus),
    InProgress,
    Release {
        watcher: Option<ChangeWatcher>,
        session: Option<Box<dyn Session>>,
        process: Option<ProcessHandle>,
    },
}

/// Result of a start attempt.
enum Launch {
    /// Process spawned; the session still has to be established.
    Started {
        run: u64,
        streams: Option<ProcessStreams>,
    },
    /// Process spawned and the handshake ran, successfully or not.
    Attempted,
    /// Nothing started because of the current state.
    Refused,
    /// No process could be started; already recorded.
    Failed(String),
}

/// What to do with a finished handshake, decided under the state lock.
enum HandshakeOutcome {
    Attached,
    Stale(Option<Box<dyn Session>>),
    Failed(Option<ProcessHandle>),
}

impl ServerSupervisor {
    /// Create a supervisor in `Idle` status. Nothing is spawned yet.
    pub fn new(
        name: impl Into<String>,
        config: ServerConfig,
        connector: Arc<dyn SessionConnector>,
    ) -> Self {
        Self::with_options(name, config, connector, SupervisorOptions::default())
    }

    pub fn with_options(
        name: impl Into<String>,
        config: ServerConfig,
        connector: Arc<dyn SessionConnector>,
        options: SupervisorOptions,
    ) -> Self {
        let (status_tx, _) = watch::channel(ServerStatus::Idle);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                config,
                options,
                connector,
                status_tx,
                state: Mutex::new(State::default()),
                restart: Mutex::new(PendingRestart::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Current lifecycle status.
    pub fn status(&self) -> ServerStatus {
        *self.inner.status_tx.borrow()
    }

    /// Receiver that observes every status change.
    pub fn subscribe(&self) -> watch::Receiver<ServerStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Spawn the server process and establish its session.
    ///
    /// Failures are recorded in the error history and leave the supervisor in
    /// `Error` status, including a missing or non-executable program. An error
    /// is returned only when the OS refused the launch for another reason.
    pub async fn connect(&self) -> Result<(), SupervisorError> {
        self.inner.connect().await.map(|_| ())
    }

    /// Stop the server: close the watcher and session, kill the process and
    /// wait for it to exit. Cancels any pending restart.
    pub async fn disconnect(&self) {
        self.inner.cancel_pending_restart();
        self.inner.disconnect().await;
    }

    /// Schedule a debounced restart, exactly as a file change would.
    pub fn request_restart(&self) {
        self.inner.schedule_restart();
    }

    /// Shut down for good. Afterwards no process or watcher is alive and
    /// `connect` is refused.
    pub async fn dispose(&self) {
        self.inner.lock_state().disposed = true;
        self.inner.cancel_pending_restart();
        self.inner.disconnect().await;

        // A transition racing with dispose may have left something behind.
        let (watcher, session, process) = {
            let mut state = self.inner.lock_state();
            (
                state.watcher.take(),
                state.session.take(),
                state.process.take(),
            )
        };
        drop(watcher);
        if let Some(session) = session {
            self.inner.close_session(session).await;
        }
        if let Some(process) = process {
            process.terminate().await;
        }
        tracing::debug!(server = %self.inner.name, "supervisor disposed");
    }

    /// OS pid of the live process, if any.
    pub fn pid(&self) -> Option<u32> {
        self.inner
            .lock_state()
            .process
            .as_ref()
            .and_then(ProcessHandle::pid)
    }

    /// Path currently being watched for changes, if any.
    pub fn watched_path(&self) -> Option<PathBuf> {
        self.inner
            .lock_state()
            .watcher
            .as_ref()
            .map(|w| w.path().to_path_buf())
    }

    /// Stderr lines of the current run, oldest first.
    pub fn stderr_history(&self) -> Vec<String> {
        self.inner.lock_state().history.stderr()
    }

    /// Errors recorded during the current run, oldest first.
    pub fn error_history(&self) -> Vec<ErrorRecord> {
        self.inner.lock_state().history.errors()
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        let state = self.inner.lock_state();
        ServerSnapshot {
            name: self.inner.name.clone(),
            status: state.status,
            pid: state.process.as_ref().and_then(ProcessHandle::pid),
            watching: state.watcher.as_ref().map(|w| w.path().to_path_buf()),
            stderr: state.history.stderr(),
            errors: state.history.errors(),
        }
    }
}

impl fmt::Debug for ServerSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSupervisor")
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_restart(&self) -> MutexGuard<'_, PendingRestart> {
        self.restart.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, state: &mut State, status: ServerStatus) {
        if state.status != status {
            tracing::info!(server = %self.name, from = %state.status, to = %status, "status changed");
        }
        state.status = status;
        self.status_tx.send_replace(status);
    }

    fn record_failure(&self, state: &mut State, error: &SupervisorError, detail: Option<String>) {
        let detail = detail.or_else(|| error_chain(error));
        state.history.push_error(error.to_string(), detail);
        self.set_status(state, ServerStatus::Error);
    }

    // -- connect -------------------------------------------------------------

    async fn connect(self: &Arc<Self>) -> Result<Launch, SupervisorError> {
        let launch = self.start_process()?;
        if let Launch::Started { run, streams } = launch {
            self.establish_session(run, streams).await;
            return Ok(Launch::Attempted);
        }
        Ok(launch)
    }

    /// Spawn the process. Only a launch primitive that cannot be invoked at
    /// all is returned as an error.
    fn start_process(self: &Arc<Self>) -> Result<Launch, SupervisorError> {
        let mut state = self.lock_state();

        if state.disposed {
            tracing::warn!(server = %self.name, "connect refused: supervisor disposed");
            return Ok(Launch::Refused);
        }
        if state.status.is_transitional() {
            tracing::warn!(server = %self.name, status = %state.status, "connect refused: transition in progress");
            return Ok(Launch::Refused);
        }
        if state.status == ServerStatus::Connected || state.process.is_some() {
            tracing::warn!(server = %self.name, "connect ignored: server process already running");
            return Ok(Launch::Refused);
        }

        state.run += 1;
        let run = state.run;
        state.history.clear();
        self.set_status(&mut state, ServerStatus::Starting);

        let Some(launch) = self.config.launch() else {
            let error = SupervisorError::InvalidCommand {
                name: self.name.clone(),
            };
            tracing::error!(server = %self.name, "{error}");
            self.record_failure(&mut state, &error, None);
            return Ok(Launch::Failed(error.to_string()));
        };

        tracing::info!(server = %self.name, command = %self.config.command.join(" "), "spawning server process");
        let (mut process, events) =
            match ProcessHandle::spawn(launch.program, launch.args, &self.config.env) {
                Ok(spawned) => spawned,
                Err(SupervisorError::SpawnFailed { source, .. }) => {
                    let contained = matches!(
                        source.kind(),
                        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
                    );
                    let error = SupervisorError::SpawnFailed {
                        name: self.name.clone(),
                        source,
                    };
                    tracing::error!(server = %self.name, "{error}");
                    self.record_failure(&mut state, &error, None);
                    if contained {
                        return Ok(Launch::Failed(error.to_string()));
                    }
                    return Err(error);
                }
                Err(error) => {
                    tracing::error!(server = %self.name, "{error}");
                    self.record_failure(&mut state, &error, None);
                    return Err(error);
                }
            };

        tracing::info!(server = %self.name, pid = ?process.pid(), "server process started");
        let streams = process.take_streams();
        state.process = Some(process);
        self.spawn_process_pump(run, events);
        self.set_status(&mut state, ServerStatus::Connecting);
        self.start_watcher(&mut state, run);

        Ok(Launch::Started { run, streams })
    }

    async fn establish_session(self: &Arc<Self>, run: u64, streams: Option<ProcessStreams>) {
        let timeout_secs = self.config.timeout_seconds;
        let result = match streams {
            Some(streams) => {
                let handshake = self.connector.establish(&self.name, &self.config, streams);
                match tokio::time::timeout(Duration::from_secs(timeout_secs), handshake).await {
                    Ok(result) => result,
                    Err(_) => Err(SupervisorError::Timeout {
                        name: self.name.clone(),
                        timeout_secs,
                    }),
                }
            }
            None => Err(SupervisorError::Session {
                name: self.name.clone(),
                message: "process streams unavailable".to_string(),
            }),
        };

        let outcome = {
            let mut state = self.lock_state();
            let current = state.run == run && state.status == ServerStatus::Connecting;
            match result {
                Ok(session) if current => {
                    state.session = Some(session);
                    self.set_status(&mut state, ServerStatus::Connected);
                    HandshakeOutcome::Attached
                }
                Ok(session) => HandshakeOutcome::Stale(Some(session)),
                Err(error) if current => {
                    tracing::error!(server = %self.name, "session handshake failed: {error}");
                    self.record_failure(&mut state, &error, None);
                    // Released before the kill so its exit is not reported again.
                    let process = state.process.take();
                    drop(state.watcher.take());
                    HandshakeOutcome::Failed(process)
                }
                Err(error) => {
                    tracing::debug!(server = %self.name, "handshake for a finished run failed: {error}");
                    HandshakeOutcome::Stale(None)
                }
            }
        };

        match outcome {
            HandshakeOutcome::Attached => {
                tracing::info!(server = %self.name, "session established");
            }
            HandshakeOutcome::Stale(session) => {
                if let Some(session) = session {
                    tracing::debug!(server = %self.name, "run ended during handshake; closing session");
                    self.close_session(session).await;
                }
            }
            HandshakeOutcome::Failed(process) => {
                if let Some(process) = process {
                    process.terminate().await;
                }
            }
        }
    }

    fn start_watcher(self: &Arc<Self>, state: &mut State, run: u64) {
        // At most one live watcher; drop any leftover before subscribing.
        drop(state.watcher.take());

        let Some(target) = watch_target(&self.config.command) else {
            tracing::debug!(server = %self.name, "no script in command; auto-restart disabled");
            return;
        };

        match ChangeWatcher::watch(&target) {
            Ok((watcher, events)) => {
                tracing::info!(server = %self.name, path = %target.display(), "watching for changes");
                state.watcher = Some(watcher);
                self.spawn_watch_pump(run, events);
            }
            Err(error) => {
                tracing::warn!(server = %self.name, "{error}");
                state.history.push_error(error.to_string(), None);
            }
        }
    }

    // -- event handling ------------------------------------------------------

    fn spawn_process_pump(self: &Arc<Self>, run: u64, mut events: mpsc::UnboundedReceiver<ProcessEvent>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.on_process_event(run, event);
            }
        });
    }

    fn spawn_watch_pump(self: &Arc<Self>, run: u64, mut events: mpsc::UnboundedReceiver<WatchEvent>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.on_watch_event(run, event);
            }
        });
    }

    fn on_process_event(&self, run: u64, event: ProcessEvent) {
        match event {
            ProcessEvent::Stderr(line) => {
                let mut state = self.lock_state();
                if state.run != run {
                    tracing::debug!(server = %self.name, "stderr from previous run: {line}");
                    return;
                }
                tracing::info!(server = %self.name, "stderr: {line}");
                state.history.push_stderr(line);
            }
            ProcessEvent::Exited(exit) => self.on_process_gone(run, exit, None),
            ProcessEvent::Failed(reason) => {
                self.on_process_gone(run, ProcessExit::default(), Some(reason));
            }
        }
    }

    fn on_process_gone(&self, run: u64, exit: ProcessExit, failure: Option<String>) {
        let (watcher, session) = {
            let mut state = self.lock_state();
            if state.run != run {
                tracing::debug!(server = %self.name, %exit, "ignoring exit of previous run");
                return;
            }
            // An empty slot means the supervisor already released this process.
            let released = state.process.take().is_none();
            let watcher = state.watcher.take();

            match state.status {
                ServerStatus::Disconnecting | ServerStatus::Disconnected => {
                    tracing::info!(server = %self.name, %exit, "server process exited");
                    self.set_status(&mut state, ServerStatus::Disconnected);
                    (watcher, None)
                }
                _ if released => {
                    tracing::debug!(server = %self.name, %exit, "released server process exited");
                    (watcher, None)
                }
                _ => {
                    let error = SupervisorError::UnexpectedExit {
                        name: self.name.clone(),
                        exit,
                    };
                    match &failure {
                        Some(reason) => tracing::error!(server = %self.name, "{error}: {reason}"),
                        None => tracing::error!(server = %self.name, "{error}"),
                    }
                    self.record_failure(&mut state, &error, failure);
                    (watcher, state.session.take())
                }
            }
        };

        drop(watcher);
        if let Some(session) = session {
            let name = self.name.clone();
            tokio::spawn(async move {
                if let Err(e) = session.close().await {
                    tracing::warn!(server = %name, "closing session after crash failed: {e}");
                }
            });
        }
    }

    fn on_watch_event(self: &Arc<Self>, run: u64, event: WatchEvent) {
        let mut state = self.lock_state();
        if state.run != run || state.watcher.is_none() {
            tracing::debug!(server = %self.name, ?event, "ignoring event from closed watcher");
            return;
        }
        match event {
            WatchEvent::Changed => {
                drop(state);
                tracing::info!(server = %self.name, "watched file changed; restart scheduled");
                self.schedule_restart();
            }
            WatchEvent::Error(message) => {
                let path = state
                    .watcher
                    .take()
                    .map(|w| w.path().display().to_string())
                    .unwrap_or_default();
                let error = SupervisorError::Watcher { path, message };
                tracing::warn!(server = %self.name, "{error}; auto-restart disabled for this run");
                state.history.push_error(error.to_string(), None);
            }
        }
    }

    // -- restart debounce ----------------------------------------------------

    fn schedule_restart(self: &Arc<Self>) {
        if self.lock_state().disposed {
            return;
        }

        let token = CancellationToken::new();
        let generation = {
            let mut pending = self.lock_restart();
            if let Some(previous) = pending.token.replace(token.clone()) {
                previous.cancel();
            }
            pending.generation += 1;
            pending.generation
        };

        let weak = Arc::downgrade(self);
        let window = self.options.restart_debounce;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(window) => {}
            }
            let Some(inner) = weak.upgrade() else { return };
            if inner.claim_restart(generation, &token) {
                inner.run_restart().await;
            }
        });
    }

    /// Take ownership of a restart whose quiet window has elapsed.
    ///
    /// Once claimed it is no longer pending: later changes schedule a fresh
    /// restart instead of cancelling this one.
    fn claim_restart(&self, generation: u64, token: &CancellationToken) -> bool {
        let mut pending = self.lock_restart();
        if pending.generation != generation || token.is_cancelled() {
            return false;
        }
        pending.token = None;
        true
    }

    fn cancel_pending_restart(&self) {
        let mut pending = self.lock_restart();
        // A timer past its sleep but not yet claimed must not run either.
        pending.generation += 1;
        if let Some(token) = pending.token.take() {
            token.cancel();
        }
    }

    async fn run_restart(self: &Arc<Self>) {
        let status = self.lock_state().status;
        if status.is_transitional() {
            tracing::info!(server = %self.name, %status, "restart skipped: transition in progress");
            return;
        }

        tracing::info!(server = %self.name, "restarting after change");
        self.disconnect().await;
        let failure = match self.connect().await {
            Ok(Launch::Failed(message)) => Some(message),
            Err(error) => Some(error.to_string()),
            Ok(_) => None,
        };
        if let Some(message) = failure {
            let error = SupervisorError::Restart {
                name: self.name.clone(),
                message,
            };
            tracing::error!(server = %self.name, "{error}");
            let mut state = self.lock_state();
            self.record_failure(&mut state, &error, None);
        }
    }

    // -- disconnect ----------------------------------------------------------

    async fn disconnect(&self) {
        let teardown = {
            let mut state = self.lock_state();
            match state.status {
                status @ (ServerStatus::Idle | ServerStatus::Disconnected) => {
                    Teardown::NotRunning(status)
                }
                ServerStatus::Disconnecting => Teardown::InProgress,
                _ => {
                    self.set_status(&mut state, ServerStatus::Disconnecting);
                    Teardown::Release {
                        watcher: state.watcher.take(),
                        session: state.session.take(),
                        process: state.process.take(),
                    }
                }
            }
        };

        match teardown {
            Teardown::NotRunning(status) => {
                tracing::warn!(server = %self.name, %status, "disconnect ignored: not running");
            }
            Teardown::InProgress => {
                let mut status_rx = self.status_tx.subscribe();
                let _ = status_rx
                    .wait_for(|status| *status != ServerStatus::Disconnecting)
                    .await;
            }
            Teardown::Release {
                watcher,
                session,
                process,
            } => {
                tracing::info!(server = %self.name, "disconnecting");
                drop(watcher);
                if let Some(session) = session {
                    self.close_session(session).await;
                }
                if let Some(process) = process {
                    let exit = process.terminate().await;
                    tracing::debug!(server = %self.name, ?exit, "server process terminated");
                }
                let mut state = self.lock_state();
                if state.status == ServerStatus::Disconnecting {
                    self.set_status(&mut state, ServerStatus::Disconnected);
                }
            }
        }
    }

    async fn close_session(&self, session: Box<dyn Session>) {
        let timeout = Duration::from_secs(self.config.timeout_seconds);
        match tokio::time::timeout(timeout, session.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(server = %self.name, "session close failed: {e}"),
            Err(_) => tracing::warn!(server = %self.name, "session close timed out"),
        }
    }
}
