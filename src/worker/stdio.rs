//! Line-oriented worker loop for child processes.
//!
//! Messages are read on a dedicated thread so a `cancel` line reaches the
//! cancel signal while an evaluation is still running.

use std::io::{self, BufRead, Write};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use tracing::warn;

use super::{Step, WorkerRuntime};
use crate::evaluator::{CancelSignal, EvaluatorFactory};
use crate::protocol::{decode_coordinator_message, encode_line, CoordinatorMessage};

/// Serve the worker protocol over an arbitrary reader/writer pair.
///
/// Returns when the coordinator sends `terminate` or closes the input.
pub fn serve<R, W>(factory: Arc<dyn EvaluatorFactory>, reader: R, mut writer: W) -> io::Result<()>
where
    R: BufRead + Send + 'static,
    W: Write,
{
    let signal = CancelSignal::new();
    let (inbox_tx, inbox_rx) = mpsc::channel::<CoordinatorMessage>();

    let reader_signal = Arc::clone(&signal);
    thread::Builder::new()
        .name("snippet-worker-stdin".into())
        .spawn(move || {
            for line in reader.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "worker input failed");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match decode_coordinator_message(&line) {
                    Ok(CoordinatorMessage::Cancel { task_id }) => reader_signal.request(task_id),
                    Ok(message) => {
                        let terminate = message == CoordinatorMessage::Terminate;
                        if terminate {
                            reader_signal.terminate();
                        }
                        if inbox_tx.send(message).is_err() || terminate {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping malformed coordinator message"),
                }
            }
        })?;

    let mut runtime = WorkerRuntime::new(factory, signal);
    while let Ok(message) = inbox_rx.recv() {
        match runtime.handle(message) {
            Step::Reply(reply) => {
                let line = encode_line(&reply)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                writer.write_all(line.as_bytes())?;
                writer.write_all(b"\n")?;
                writer.flush()?;
            }
            Step::Continue => {}
            Step::Exit => break,
        }
    }
    Ok(())
}

/// Serve the worker protocol on this process's stdin and stdout.
pub fn serve_stdio(factory: Arc<dyn EvaluatorFactory>) -> io::Result<()> {
    let stdin = io::BufReader::new(io::stdin());
    let stdout = io::stdout();
    serve(factory, stdin, stdout.lock())
}
