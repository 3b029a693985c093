//! Message protocol between the pool coordinator and its workers.
//!
//! Every exchange is one of two tagged unions: [`CoordinatorMessage`] flows
//! toward a worker, [`WorkerMessage`] flows back. Task-scoped replies carry the
//! task id they answer so a handle can discard anything that does not match the
//! task it is currently waiting on.

mod encoding;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use encoding::{
    decode_coordinator_message, decode_worker_message, encode_line, MAX_MESSAGE_SIZE,
};

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Unique task identifier (`task-7`, `session-2-task-3`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Id for the `seq`-th task submitted to a pool.
    pub fn pool(seq: u64) -> Self {
        Self(format!("task-{seq}"))
    }

    /// Id for the `seq`-th evaluation inside a session.
    pub fn session(session: &SessionId, seq: u64) -> Self {
        Self(format!("{session}-task-{seq}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Session identifier (`session-1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(seq: u64) -> Self {
        Self(format!("session-{seq}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable numeric identity of a worker handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Interpreter flavour loaded by each worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Variant {
    /// Fully isolated workers, no shared state.
    #[default]
    #[serde(rename = "singlefile")]
    SingleFile,
    /// Workers mount one shared filesystem directory. Needs real parallel workers.
    SharedFs,
}

/// Opaque interpreter context configuration, forwarded untouched to the evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextOptions(pub Value);

impl Default for ContextOptions {
    fn default() -> Self {
        Self(Value::Object(serde_json::Map::new()))
    }
}

/// Payload of the `init` message; also what an evaluator factory receives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitOptions {
    #[serde(default)]
    pub context_options: ContextOptions,
    #[serde(default)]
    pub variant: Variant,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_fs_mount: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wasm_location: Option<String>,
}

/// Messages sent from the coordinator to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CoordinatorMessage {
    Init(InitOptions),
    #[serde(rename_all = "camelCase")]
    Eval {
        task_id: TaskId,
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Cancel { task_id: TaskId },
    Terminate,
}

/// Messages sent from a worker back to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerMessage {
    Ready,
    InitError { error: TaskError },
    #[serde(rename = "result", rename_all = "camelCase")]
    Completed { task_id: TaskId, value: Value },
    #[serde(rename = "error", rename_all = "camelCase")]
    Failed { task_id: TaskId, error: TaskError },
}

impl WorkerMessage {
    /// Task this message answers, if it is task-scoped.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::Ready | Self::InitError { .. } => None,
            Self::Completed { task_id, .. } | Self::Failed { task_id, .. } => Some(task_id),
        }
    }
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// Structured error record carried in a failed task result.
///
/// Script-level exceptions carry none of the flags; scheduler-synthesized
/// outcomes set exactly one of them.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{name}: {message}")]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_timeout: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_worker_crash: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_cancelled: bool,
}

pub const TIMEOUT_ERROR: &str = "TimeoutError";
pub const CANCELLED_ERROR: &str = "CancelledError";
pub const WORKER_CRASH_ERROR: &str = "WorkerCrashError";
pub const POOL_DISPOSED_ERROR: &str = "PoolDisposedError";
pub const SESSION_RELEASED_ERROR: &str = "SessionReleasedError";

impl TaskError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            is_timeout: false,
            is_worker_crash: false,
            is_cancelled: false,
        }
    }

    pub fn with_stack(mut self, stack: Option<String>) -> Self {
        self.stack = stack;
        self
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self {
            is_timeout: true,
            ..Self::new(TIMEOUT_ERROR, format!("Task timed out after {timeout_ms}ms"))
        }
    }

    pub fn cancelled() -> Self {
        Self {
            is_cancelled: true,
            ..Self::new(CANCELLED_ERROR, "Task was cancelled")
        }
    }

    pub fn worker_crash(task_id: &TaskId, reason: &str) -> Self {
        Self {
            is_worker_crash: true,
            ..Self::new(
                WORKER_CRASH_ERROR,
                format!("Worker crashed while executing task {task_id}: {reason}"),
            )
        }
    }

    pub fn disposed() -> Self {
        Self::new(POOL_DISPOSED_ERROR, "Worker pool has been disposed")
    }

    pub fn session_released() -> Self {
        Self::new(SESSION_RELEASED_ERROR, "Session has been released")
    }

    pub fn is_disposed(&self) -> bool {
        self.name == POOL_DISPOSED_ERROR
    }
}

/// Outcome of one evaluation: an opaque value or a structured error.
pub type TaskResult = Result<Value, TaskError>;
