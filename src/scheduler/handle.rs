//! Coordinator-side handle for one worker.
//!
//! A handle owns one transport and at most one outstanding task. Worker
//! replies are matched against the id of that task; anything else is
//! discarded. After a timeout or cancellation the handle keeps the task id as
//! `draining` and refuses new work until the worker reports on it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{CoordinatorMessage, InitOptions, TaskError, TaskId, TaskResult, WorkerId, WorkerMessage};
use crate::telemetry;
use crate::transport::{EventReceiver, TransportEvent, TransportFactory, WorkerTransport};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandleError {
    #[error("Worker is not alive")]
    NotAlive,

    #[error("Worker is busy")]
    Busy,

    #[error("Worker initialization failed: {0}")]
    Init(TaskError),

    #[error("Worker transport failed: {0}")]
    Transport(String),
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Initializing,
    Idle,
    Busy,
    /// Waiting for a worker to report on a task that already settled locally.
    Draining,
    Dead,
}

/// Called with the worker id when a handle finishes draining or dies.
pub type IdleListener = Arc<dyn Fn(WorkerId) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initializing,
    Ready,
    Dead,
}

struct Pending {
    task_id: TaskId,
    tx: oneshot::Sender<TaskResult>,
}

struct Shared {
    phase: Phase,
    init_tx: Option<oneshot::Sender<Result<(), HandleError>>>,
    pending: Option<Pending>,
    draining: Option<TaskId>,
    on_idle: Option<IdleListener>,
}

pub struct WorkerHandle {
    id: WorkerId,
    transport: Arc<dyn WorkerTransport>,
    shared: Arc<Mutex<Shared>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl WorkerHandle {
    /// Spawn a worker and wait until it reports `ready`.
    ///
    /// Dropping the returned future before it completes tears the worker down.
    pub async fn spawn(
        id: WorkerId,
        transports: &dyn TransportFactory,
        init: InitOptions,
    ) -> Result<Arc<WorkerHandle>, HandleError> {
        let started = Instant::now();
        let (transport, events) =
            transports.spawn(id).map_err(|e| HandleError::Transport(e.to_string()))?;
        telemetry::record_worker_spawn();

        let (init_tx, init_rx) = oneshot::channel();
        let shared = Arc::new(Mutex::new(Shared {
            phase: Phase::Initializing,
            init_tx: Some(init_tx),
            pending: None,
            draining: None,
            on_idle: None,
        }));
        let pump = tokio::spawn(pump_events(id, Arc::clone(&shared), events));
        let handle = Arc::new(WorkerHandle {
            id,
            transport,
            shared,
            pump: Mutex::new(Some(pump)),
        });

        if let Err(e) = handle.transport.send(CoordinatorMessage::Init(init)) {
            handle.dispose();
            return Err(HandleError::Transport(e.to_string()));
        }

        match init_rx.await {
            Ok(Ok(())) => {
                info!(
                    worker_id = id.0,
                    transport = transports.kind(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "worker ready"
                );
                Ok(handle)
            }
            Ok(Err(e)) => {
                warn!(worker_id = id.0, error = %e, "worker failed to initialize");
                handle.dispose();
                Err(e)
            }
            Err(_) => {
                handle.dispose();
                Err(HandleError::NotAlive)
            }
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> HandleState {
        let shared = self.shared.lock();
        match shared.phase {
            Phase::Initializing => HandleState::Initializing,
            Phase::Dead => HandleState::Dead,
            Phase::Ready if shared.pending.is_some() => HandleState::Busy,
            Phase::Ready if shared.draining.is_some() => HandleState::Draining,
            Phase::Ready => HandleState::Idle,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.shared.lock().phase != Phase::Dead
    }

    /// True while a task is outstanding or draining.
    pub fn is_busy(&self) -> bool {
        let shared = self.shared.lock();
        shared.pending.is_some() || shared.draining.is_some()
    }

    pub fn is_idle(&self) -> bool {
        self.state() == HandleState::Idle
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.shared.lock().pending.as_ref().map(|p| p.task_id.clone())
    }

    pub fn set_idle_listener(&self, listener: IdleListener) {
        self.shared.lock().on_idle = Some(listener);
    }

    /// Start a task. Fails fast when the handle is dead, busy or draining.
    ///
    /// The returned future settles exactly once: with the worker's reply,
    /// a timeout error at the deadline, a crash error, or a disposal error.
    pub fn execute(
        &self,
        task_id: TaskId,
        code: String,
        filename: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<BoxFuture<'static, TaskResult>, HandleError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut shared = self.shared.lock();
            if shared.phase != Phase::Ready {
                return Err(HandleError::NotAlive);
            }
            if shared.pending.is_some() || shared.draining.is_some() {
                return Err(HandleError::Busy);
            }
            shared.pending = Some(Pending { task_id: task_id.clone(), tx });
        }

        let timeout_ms = timeout.map(|t| t.as_millis() as u64);
        let eval = CoordinatorMessage::Eval { task_id: task_id.clone(), code, filename, timeout_ms };
        if let Err(e) = self.transport.send(eval) {
            mark_dead(self.id, &self.shared, &e.to_string());
        }

        let id = self.id;
        let shared = Arc::clone(&self.shared);
        let transport = Arc::clone(&self.transport);
        let abandon = AbandonGuard {
            id,
            task_id: task_id.clone(),
            shared: Arc::clone(&shared),
            transport: Arc::clone(&transport),
        };
        Ok(async move {
            let _abandon = abandon;
            let mut rx = rx;
            let Some(limit) = timeout else {
                return rx.await.unwrap_or_else(|_| Err(TaskError::disposed()));
            };
            match tokio::time::timeout(limit, &mut rx).await {
                Ok(result) => result.unwrap_or_else(|_| Err(TaskError::disposed())),
                Err(_) => {
                    let expired = {
                        let mut shared = shared.lock();
                        if shared.pending.as_ref().is_some_and(|p| p.task_id == task_id) {
                            shared.pending = None;
                            shared.draining = Some(task_id.clone());
                            true
                        } else {
                            false
                        }
                    };
                    if !expired {
                        // Settled concurrently with the deadline.
                        return rx.await.unwrap_or_else(|_| Err(TaskError::disposed()));
                    }
                    warn!(worker_id = id.0, task_id = %task_id, timeout_ms = limit.as_millis() as u64, "task timed out");
                    let _ = transport.send(CoordinatorMessage::Cancel { task_id });
                    Err(TaskError::timeout(limit.as_millis() as u64))
                }
            }
        }
        .boxed())
    }

    /// Cancel the outstanding task if it is `task_id`.
    ///
    /// The caller is settled with a cancellation error immediately and the
    /// worker is asked to interrupt. A stale id is a no-op.
    pub fn cancel_current(&self, task_id: &TaskId) -> bool {
        self.cancel_current_with(task_id, TaskError::cancelled())
    }

    /// Like [`cancel_current`](Self::cancel_current), settling the caller with `error`.
    pub fn cancel_current_with(&self, task_id: &TaskId, error: TaskError) -> bool {
        let pending = {
            let mut shared = self.shared.lock();
            match shared.pending.take() {
                Some(p) if &p.task_id == task_id => {
                    shared.draining = Some(p.task_id.clone());
                    p
                }
                other => {
                    shared.pending = other;
                    return false;
                }
            }
        };
        debug!(worker_id = self.id.0, task_id = %task_id, "cancelling running task");
        let _ = self.transport.send(CoordinatorMessage::Cancel { task_id: task_id.clone() });
        let _ = pending.tx.send(Err(error));
        true
    }

    /// Idempotent. Settles any outstanding task with a disposal error.
    pub fn dispose(&self) {
        let settle = {
            let mut shared = self.shared.lock();
            shared.on_idle = None;
            if shared.phase == Phase::Dead {
                None
            } else {
                shared.phase = Phase::Dead;
                shared.draining = None;
                Some((shared.pending.take(), shared.init_tx.take()))
            }
        };
        if let Some((pending, init_tx)) = settle {
            debug!(worker_id = self.id.0, "disposing worker");
            if let Some(pending) = pending {
                let _ = pending.tx.send(Err(TaskError::disposed()));
            }
            if let Some(init_tx) = init_tx {
                let _ = init_tx.send(Err(HandleError::NotAlive));
            }
            let _ = self.transport.send(CoordinatorMessage::Terminate);
        }
        // Dead handles may still own a live transport (init-error, crash).
        self.transport.terminate();
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn pump_events(id: WorkerId, shared: Arc<Mutex<Shared>>, mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(message) => on_message(id, &shared, message),
            TransportEvent::Crashed(reason) => {
                mark_dead(id, &shared, &reason);
                return;
            }
        }
    }
    mark_dead(id, &shared, "worker channel closed");
}

fn on_message(id: WorkerId, shared: &Mutex<Shared>, message: WorkerMessage) {
    let (task_id, result) = match message {
        WorkerMessage::Ready => {
            let init_tx = {
                let mut shared = shared.lock();
                if shared.phase != Phase::Initializing {
                    return;
                }
                shared.phase = Phase::Ready;
                shared.init_tx.take()
            };
            if let Some(tx) = init_tx {
                let _ = tx.send(Ok(()));
            }
            return;
        }
        WorkerMessage::InitError { error } => {
            let init_tx = {
                let mut shared = shared.lock();
                if shared.phase != Phase::Initializing {
                    return;
                }
                shared.phase = Phase::Dead;
                shared.init_tx.take()
            };
            if let Some(tx) = init_tx {
                let _ = tx.send(Err(HandleError::Init(error)));
            }
            return;
        }
        WorkerMessage::Completed { task_id, value } => (task_id, Ok(value)),
        WorkerMessage::Failed { task_id, error } => (task_id, Err(error)),
    };

    let mut guard = shared.lock();
    match guard.pending.take() {
        Some(pending) if pending.task_id == task_id => {
            drop(guard);
            let _ = pending.tx.send(result);
        }
        other => {
            guard.pending = other;
            if guard.draining.as_ref() == Some(&task_id) {
                guard.draining = None;
                let listener = guard.on_idle.clone();
                drop(guard);
                debug!(worker_id = id.0, task_id = %task_id, "late result drained");
                if let Some(listener) = listener {
                    listener(id);
                }
            } else {
                debug!(worker_id = id.0, task_id = %task_id, "ignoring result for unexpected task");
            }
        }
    }
}

/// Dropped with the execution future. If the caller gave up before the task
/// settled, the worker is asked to stop and the handle drains.
struct AbandonGuard {
    id: WorkerId,
    task_id: TaskId,
    shared: Arc<Mutex<Shared>>,
    transport: Arc<dyn WorkerTransport>,
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        let abandoned = {
            let mut shared = self.shared.lock();
            match shared.pending.take() {
                Some(p) if p.task_id == self.task_id => {
                    shared.draining = Some(p.task_id);
                    true
                }
                other => {
                    shared.pending = other;
                    false
                }
            }
        };
        if abandoned {
            debug!(worker_id = self.id.0, task_id = %self.task_id, "execution abandoned, cancelling");
            let _ = self.transport.send(CoordinatorMessage::Cancel { task_id: self.task_id.clone() });
        }
    }
}

fn mark_dead(id: WorkerId, shared: &Mutex<Shared>, reason: &str) {
    let (pending, init_tx, listener) = {
        let mut shared = shared.lock();
        if shared.phase == Phase::Dead {
            return;
        }
        shared.phase = Phase::Dead;
        shared.draining = None;
        (shared.pending.take(), shared.init_tx.take(), shared.on_idle.take())
    };
    warn!(worker_id = id.0, reason = %reason, "worker crashed");
    telemetry::record_worker_crash();
    if let Some(tx) = init_tx {
        let _ = tx.send(Err(HandleError::Transport(reason.to_string())));
    }
    if let Some(pending) = pending {
        let _ = pending.tx.send(Err(TaskError::worker_crash(&pending.task_id, reason)));
    }
    if let Some(listener) = listener {
        listener(id);
    }
}

#[cfg(test)]
#[path = "handle_tests.rs"]
mod tests;
