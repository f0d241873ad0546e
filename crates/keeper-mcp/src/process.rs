//! Child process ownership for a single MCP server run.
//!
//! Spawns the configured command with all three standard streams piped and
//! runs a monitor task that owns the [`Child`]. The monitor forwards stderr
//! line by line and reports exactly one terminal event when the process is
//! gone.

use crate::error::SupervisorError;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};

/// How long to keep reading buffered stderr after the process has exited.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// How a process terminated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessExit {
    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Events produced by a running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// One line written to stderr, without the trailing newline.
    Stderr(String),
    /// The OS could not report on the process. Terminal.
    Failed(String),
    /// The process exited. Terminal.
    Exited(ProcessExit),
}

/// The stdin/stdout pair handed to the session layer.
#[derive(Debug)]
pub struct ProcessStreams {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// Owner of one spawned server process.
///
/// Dropping the handle requests termination of the process.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    streams: Option<ProcessStreams>,
}

impl ProcessHandle {
    /// Spawn `program` with `args`, layering `env` over the host environment.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        program: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ProcessEvent>), SupervisorError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SupervisorError::SpawnFailed {
            name: program.to_string(),
            source: e,
        })?;

        let streams = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => Some(ProcessStreams { stdin, stdout }),
            _ => None,
        };
        let stderr = child.stderr.take();
        let pid = child.id();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(monitor(child, stderr, kill_rx, event_tx, exit_tx));

        Ok((
            Self {
                pid,
                kill_tx: Some(kill_tx),
                exit_rx,
                streams,
            },
            event_rx,
        ))
    }

    /// OS process id, if the process was running when spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the stdin/stdout pair. Returns `None` after the first call.
    pub fn take_streams(&mut self) -> Option<ProcessStreams> {
        self.streams.take()
    }

    /// The exit status, once the process is gone.
    pub fn exit(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    /// Request termination. Fire-and-forget; repeated calls are ignored.
    pub fn kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Kill the process and wait until it has exited.
    pub async fn terminate(mut self) -> Option<ProcessExit> {
        self.kill();
        let mut exit_rx = self.exit_rx.clone();
        match exit_rx.wait_for(Option::is_some).await {
            Ok(exit) => *exit,
            // Monitor is gone without reporting; nothing left to wait for.
            Err(_) => None,
        }
    }
}

/// Line reader that survives output which is not valid UTF-8.
///
/// Invalid sequences are replaced rather than ending the stream, so a
/// misbehaving write never closes the pipe on the child.
pub(crate) struct LossyLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LossyLines<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    /// Next line without its terminator, or `None` at end of stream.
    pub(crate) async fn next_line(&mut self) -> Option<String> {
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf).await {
            Ok(0) => None,
            Ok(_) => {
                if self.buf.last() == Some(&b'\n') {
                    self.buf.pop();
                    if self.buf.last() == Some(&b'\r') {
                        self.buf.pop();
                    }
                }
                Some(String::from_utf8_lossy(&self.buf).into_owned())
            }
            Err(e) => {
                tracing::debug!("Failed to read child output: {e}");
                None
            }
        }
    }
}

/// Owns the child until it exits. Sends stderr lines, then one terminal event.
async fn monitor(
    mut child: Child,
    stderr: Option<ChildStderr>,
    mut kill_rx: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<ProcessEvent>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
) {
    let mut lines = stderr.map(LossyLines::new);
    let mut stderr_done = false;
    let mut kill_requested = false;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            // Resolves on an explicit kill or when the handle is dropped.
            _ = &mut kill_rx, if !kill_requested => {
                kill_requested = true;
                if let Err(e) = child.start_kill() {
                    tracing::debug!("Failed to signal child process: {e}");
                }
            }
            line = next_line(&mut lines), if !stderr_done => match line {
                Some(line) => {
                    let _ = events.send(ProcessEvent::Stderr(line));
                }
                // The reader stays alive until exit so the pipe is never
                // closed under a running child.
                None => stderr_done = true,
            },
        }
    };

    // Deliver whatever stderr was still buffered before the terminal event.
    if let Some(mut remaining) = lines.filter(|_| !stderr_done) {
        let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, async {
            while let Some(line) = remaining.next_line().await {
                let _ = events.send(ProcessEvent::Stderr(line));
            }
        })
        .await;
    }

    let (event, exit) = match status {
        Ok(status) => {
            let exit = ProcessExit::from_status(status);
            (ProcessEvent::Exited(exit), exit)
        }
        Err(e) => (ProcessEvent::Failed(e.to_string()), ProcessExit::default()),
    };
    let _ = events.send(event);
    exit_tx.send_replace(Some(exit));
}

/// Next stderr line, or `None` at end of stream. Pends forever without stderr.
async fn next_line(lines: &mut Option<LossyLines<ChildStderr>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}
