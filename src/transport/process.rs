//! Child-process workers speaking newline-delimited JSON over stdio.
//!
//! The child is expected to run [`serve_stdio`](crate::worker::serve_stdio).

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{EventReceiver, TransportError, TransportEvent, TransportFactory, WorkerTransport};
use crate::protocol::{decode_worker_message, encode_line, CoordinatorMessage, WorkerId};

/// Spawns each worker as `program args..`.
#[derive(Debug, Clone)]
pub struct ProcessTransportFactory {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ProcessTransportFactory {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), args: Vec::new(), envs: Vec::new() }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl TransportFactory for ProcessTransportFactory {
    fn spawn(
        &self,
        worker_id: WorkerId,
    ) -> Result<(Arc<dyn WorkerTransport>, EventReceiver), TransportError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(TransportError::Spawn("process workers need a tokio runtime".into()));
        }

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Spawn(format!("{}: {e}", self.program.display())))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(TransportError::Spawn("worker stdio not captured".into()));
        };
        debug!(worker_id = worker_id.0, pid = ?child.id(), "spawned worker process");

        let token = CancellationToken::new();
        let terminated = Arc::new(AtomicBool::new(false));
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_lines(stdin, lines_rx, token.clone()));
        tokio::spawn(read_events(
            worker_id,
            stdout,
            events_tx,
            Arc::clone(&terminated),
            token.clone(),
        ));
        tokio::spawn(supervise(worker_id, child, token.clone()));

        let transport = ProcessTransport { lines: lines_tx, token, terminated };
        Ok((Arc::new(transport), events_rx))
    }

    fn kind(&self) -> &'static str {
        "process"
    }
}

/// How long a terminated worker gets to exit on its own before it is killed.
const EXIT_GRACE: Duration = Duration::from_millis(250);

/// Forward encoded lines to the worker. Once cancelled, lines already queued
/// (the final `terminate`) are still written before stdin closes.
async fn write_lines<W>(
    mut stdin: W,
    mut lines: mpsc::UnboundedReceiver<String>,
    token: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let line = tokio::select! {
            biased;
            line = lines.recv() => match line {
                Some(line) => line,
                None => break,
            },
            _ = token.cancelled() => match lines.try_recv() {
                Ok(line) => line,
                Err(_) => break,
            },
        };
        if let Err(e) = write_line(&mut stdin, &line).await {
            debug!(error = %e, "worker stdin closed");
            return;
        }
    }
    let _ = stdin.shutdown().await;
}

async fn write_line<W: AsyncWrite + Unpin>(stdin: &mut W, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

async fn read_events(
    worker_id: WorkerId,
    stdout: ChildStdout,
    events: mpsc::UnboundedSender<TransportEvent>,
    terminated: Arc<AtomicBool>,
    token: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    let reason = loop {
        let next = tokio::select! {
            _ = token.cancelled() => return,
            next = lines.next_line() => next,
        };
        match next {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match decode_worker_message(&line) {
                Ok(message) => {
                    if events.send(TransportEvent::Message(message)).is_err() {
                        return;
                    }
                }
                Err(e) => warn!(worker_id = worker_id.0, error = %e, "dropping malformed worker message"),
            },
            Ok(None) => break "worker process exited".to_string(),
            Err(e) => break format!("worker output failed: {e}"),
        }
    };
    if !terminated.load(Ordering::Acquire) {
        let _ = events.send(TransportEvent::Crashed(reason));
    }
    token.cancel();
}

async fn supervise(worker_id: WorkerId, mut child: Child, token: CancellationToken) {
    tokio::select! {
        _ = token.cancelled() => {
            if tokio::time::timeout(EXIT_GRACE, child.wait()).await.is_err() {
                debug!(worker_id = worker_id.0, "worker ignored terminate, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        status = child.wait() => {
            debug!(worker_id = worker_id.0, status = ?status.ok(), "worker process exited");
        }
    }
}

pub struct ProcessTransport {
    lines: mpsc::UnboundedSender<String>,
    token: CancellationToken,
    terminated: Arc<AtomicBool>,
}

impl WorkerTransport for ProcessTransport {
    fn send(&self, message: CoordinatorMessage) -> Result<(), TransportError> {
        if self.terminated.load(Ordering::Acquire) || self.token.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let line = encode_line(&message)?;
        self.lines.send(line).map_err(|_| TransportError::Closed)
    }

    fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.token.cancel();
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let factory = ProcessTransportFactory::new("/nonexistent/snippet-worker");
        assert!(matches!(factory.spawn(WorkerId(1)), Err(TransportError::Spawn(_))));
    }

    #[test]
    fn test_spawn_outside_runtime_fails() {
        let factory = ProcessTransportFactory::new("true");
        assert!(matches!(factory.spawn(WorkerId(1)), Err(TransportError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_queued_lines_flush_after_cancellation() {
        use tokio::io::AsyncReadExt;

        let (writer, mut reader) = tokio::io::duplex(1024);
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        tx.send(encode_line(&CoordinatorMessage::Terminate).unwrap()).unwrap();
        token.cancel();

        write_lines(writer, rx, token).await;
        let mut written = String::new();
        reader.read_to_string(&mut written).await.unwrap();
        assert_eq!(written, "{\"type\":\"terminate\"}\n");
        drop(tx);
    }

    #[tokio::test]
    async fn test_cancelled_writer_stops_when_idle() {
        let (writer, _reader) = tokio::io::duplex(64);
        let (_tx, rx) = mpsc::unbounded_channel::<String>();
        let token = CancellationToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), write_lines(writer, rx, token))
            .await
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_without_terminate_is_crash() {
        let factory = ProcessTransportFactory::new("true");
        let (_transport, mut events) = factory.spawn(WorkerId(2)).unwrap();
        assert!(matches!(events.recv().await, Some(TransportEvent::Crashed(_))));
    }
}
