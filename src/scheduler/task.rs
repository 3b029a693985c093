//! Task records as they move from submission to a worker.

use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use super::priority::Priority;
use crate::protocol::{TaskError, TaskId, TaskResult};

/// Sender half that settles a submitted task.
pub type Responder = oneshot::Sender<TaskResult>;

/// A unit of work as the caller describes it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Task {
    pub code: String,
    pub filename: Option<String>,
    /// Overrides the pool default. `Some(0)` disables the timeout.
    pub timeout_ms: Option<u64>,
    pub priority: Priority,
}

impl Task {
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into(), ..Default::default() }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = priority.into();
        self
    }
}

/// A task after admission: unique id, resolved timeout, admission time.
#[derive(Debug, Clone)]
pub struct InternalTask {
    pub id: TaskId,
    pub code: String,
    pub filename: Option<String>,
    pub timeout: Option<Duration>,
    pub priority: Priority,
    pub enqueued_at: Instant,
}

impl InternalTask {
    pub fn new(id: TaskId, task: Task, timeout: Option<Duration>) -> Self {
        Self {
            id,
            code: task.code,
            filename: task.filename,
            timeout,
            priority: task.priority,
            enqueued_at: Instant::now(),
        }
    }

    pub fn timeout_ms(&self) -> Option<u64> {
        self.timeout.map(|t| t.as_millis() as u64)
    }
}

/// An admitted task waiting in the queue, together with its responder.
#[derive(Debug)]
pub struct QueuedTask {
    pub task: InternalTask,
    responder: Option<Responder>,
    cancelled: bool,
}

impl QueuedTask {
    pub fn new(task: InternalTask, responder: Responder) -> Self {
        Self { task, responder: Some(responder), cancelled: false }
    }

    pub fn id(&self) -> &TaskId {
        &self.task.id
    }

    pub fn priority(&self) -> Priority {
        self.task.priority
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Mark cancelled and settle the caller. Returns false if already cancelled.
    pub fn cancel(&mut self) -> bool {
        if self.cancelled {
            return false;
        }
        self.cancelled = true;
        if let Some(responder) = self.responder.take() {
            let _ = responder.send(Err(TaskError::cancelled()));
        }
        true
    }

    /// Settle the caller without dispatching.
    pub fn settle(mut self, result: TaskResult) {
        if let Some(responder) = self.responder.take() {
            let _ = responder.send(result);
        }
    }

    pub fn into_parts(self) -> (InternalTask, Option<Responder>) {
        (self.task, self.responder)
    }
}
