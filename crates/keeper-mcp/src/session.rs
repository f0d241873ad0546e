//! Session collaborator traits.
//!
//! The protocol spoken over a server's stdin/stdout is not implemented here.
//! The supervisor hands the process streams to a [`SessionConnector`] once the
//! process is up and closes the resulting [`Session`] on shutdown.

use crate::config::ServerConfig;
use crate::error::SupervisorError;
use crate::process::{LossyLines, ProcessStreams};
use std::future::Future;
use std::pin::Pin;
use tokio::process::ChildStdin;
use tokio::task::JoinHandle;

/// Boxed future returned by the session traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An established protocol session with one server.
pub trait Session: Send {
    /// Close the session. Best-effort: the supervisor logs and ignores errors.
    fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), SupervisorError>>;
}

/// Establishes sessions over freshly spawned server processes.
///
/// Dyn-compatible so supervisors can share an `Arc<dyn SessionConnector>`.
pub trait SessionConnector: Send + Sync {
    /// Perform whatever handshake the protocol needs over `streams`.
    ///
    /// The supervisor bounds this call by the server's `timeout_seconds`.
    fn establish<'a>(
        &'a self,
        server: &'a str,
        config: &'a ServerConfig,
        streams: ProcessStreams,
    ) -> BoxFuture<'a, Result<Box<dyn Session>, SupervisorError>>;
}

/// Connector that performs no handshake.
///
/// Keeps stdin open and logs each stdout line at debug level so the server
/// never blocks on a full pipe. Used by the CLI when no protocol layer is
/// plugged in.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedConnector;

impl SessionConnector for DetachedConnector {
    fn establish<'a>(
        &'a self,
        server: &'a str,
        _config: &'a ServerConfig,
        streams: ProcessStreams,
    ) -> BoxFuture<'a, Result<Box<dyn Session>, SupervisorError>> {
        let server = server.to_string();
        Box::pin(async move {
            let ProcessStreams { stdin, stdout } = streams;
            let reader = tokio::spawn(async move {
                let mut lines = LossyLines::new(stdout);
                while let Some(line) = lines.next_line().await {
                    tracing::debug!(server = %server, "stdout: {line}");
                }
            });
            Ok(Box::new(DetachedSession {
                stdin: Some(stdin),
                reader,
            }) as Box<dyn Session>)
        })
    }
}

/// Session produced by [`DetachedConnector`].
#[derive(Debug)]
pub struct DetachedSession {
    stdin: Option<ChildStdin>,
    reader: JoinHandle<()>,
}

impl Session for DetachedSession {
    fn close(mut self: Box<Self>) -> BoxFuture<'static, Result<(), SupervisorError>> {
        Box::pin(async move {
            // Dropping stdin sends EOF to the server.
            drop(self.stdin.take());
            self.reader.abort();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ProcessEvent, ProcessHandle};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn connector_is_dyn_compatible() {
        fn _accept(_c: &dyn SessionConnector) {}
        fn _assert_send_sync<T: Send + Sync>() {}
        _assert_send_sync::<Arc<dyn SessionConnector>>();
    }

    #[tokio::test]
    async fn detached_session_close_sends_eof() {
        // `cat` exits once its stdin is closed.
        let (mut handle, mut events) = ProcessHandle::spawn("cat", &[], &HashMap::new()).unwrap();
        let streams = handle.take_streams().unwrap();
        let config = ServerConfig::new(vec!["cat".to_string()]);

        let session = DetachedConnector
            .establish("cat", &config, streams)
            .await
            .unwrap();
        session.close().await.unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                if let ProcessEvent::Exited(exit) = event {
                    return Some(exit);
                }
            }
            None
        })
        .await
        .unwrap();
        assert_eq!(exit.and_then(|e| e.code), Some(0));
        drop(handle);
    }

    #[tokio::test]
    async fn detached_session_survives_invalid_utf8_on_stdout() {
        let args = vec![
            "-c".to_string(),
            "printf 'bad \\377\\n'; sleep 0.3; echo after; echo done >&2; exec sleep 30".to_string(),
        ];
        let (mut handle, mut events) = ProcessHandle::spawn("sh", &args, &HashMap::new()).unwrap();
        let streams = handle.take_streams().unwrap();
        let config = ServerConfig::new(vec!["sh".to_string()]);
        let session = DetachedConnector
            .establish("sh", &config, streams)
            .await
            .unwrap();

        // A closed stdout would kill the shell before it reaches stderr.
        let first = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        assert_eq!(first, Some(ProcessEvent::Stderr("done".to_string())));
        assert!(handle.exit().is_none());

        session.close().await.unwrap();
        handle.terminate().await;
    }
}
