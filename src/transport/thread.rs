//! OS-thread workers.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{EventReceiver, TransportError, TransportEvent, TransportFactory, WorkerTransport};
use crate::evaluator::{CancelSignal, EvaluatorFactory};
use crate::protocol::{CoordinatorMessage, WorkerId};
use crate::worker::{Step, WorkerRuntime};

const THREAD_NAME_PREFIX: &str = "snippet-worker";

/// Spawns each worker as a named thread running a [`WorkerRuntime`].
pub struct ThreadTransportFactory {
    evaluators: Arc<dyn EvaluatorFactory>,
    stack_size: Option<usize>,
}

impl ThreadTransportFactory {
    pub fn new(evaluators: Arc<dyn EvaluatorFactory>) -> Self {
        Self { evaluators, stack_size: None }
    }

    pub fn with_stack_size(mut self, stack_size: Option<usize>) -> Self {
        self.stack_size = stack_size;
        self
    }
}

impl TransportFactory for ThreadTransportFactory {
    fn spawn(
        &self,
        worker_id: WorkerId,
    ) -> Result<(Arc<dyn WorkerTransport>, EventReceiver), TransportError> {
        let (inbox_tx, inbox_rx) = std_mpsc::channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let signal = CancelSignal::new();

        let mut builder = thread::Builder::new().name(format!("{THREAD_NAME_PREFIX}-{}", worker_id.0));
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }

        let runtime = WorkerRuntime::new(Arc::clone(&self.evaluators), Arc::clone(&signal));
        builder
            .spawn(move || worker_loop(worker_id, runtime, inbox_rx, events_tx))
            .map_err(|e| TransportError::Spawn(e.to_string()))?;

        let transport = ThreadTransport {
            inbox: Mutex::new(Some(inbox_tx)),
            signal,
            terminated: AtomicBool::new(false),
        };
        Ok((Arc::new(transport), events_rx))
    }

    fn kind(&self) -> &'static str {
        "thread"
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

fn worker_loop(
    worker_id: WorkerId,
    mut runtime: WorkerRuntime,
    inbox: std_mpsc::Receiver<CoordinatorMessage>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Ok(message) = inbox.recv() {
        match panic::catch_unwind(AssertUnwindSafe(|| runtime.handle(message))) {
            Ok(Step::Reply(reply)) => {
                if events.send(TransportEvent::Message(reply)).is_err() {
                    break;
                }
            }
            Ok(Step::Continue) => {}
            Ok(Step::Exit) => break,
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                warn!(worker_id = worker_id.0, reason = %reason, "worker thread panicked");
                let _ = events.send(TransportEvent::Crashed(reason));
                return;
            }
        }
    }
    debug!(worker_id = worker_id.0, "worker thread exiting");
}

pub struct ThreadTransport {
    inbox: Mutex<Option<std_mpsc::Sender<CoordinatorMessage>>>,
    signal: Arc<CancelSignal>,
    terminated: AtomicBool,
}

impl WorkerTransport for ThreadTransport {
    fn send(&self, message: CoordinatorMessage) -> Result<(), TransportError> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        // Cancellation must reach an evaluation that is already running.
        if let CoordinatorMessage::Cancel { task_id } = message {
            self.signal.request(task_id);
            return Ok(());
        }
        match self.inbox.lock().as_ref() {
            Some(inbox) => inbox.send(message).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.signal.terminate();
        if let Some(inbox) = self.inbox.lock().take() {
            let _ = inbox.send(CoordinatorMessage::Terminate);
        }
    }
}
