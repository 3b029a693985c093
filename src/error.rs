//! Pool-level error types.
//!
//! Admission and construction failures are returned as `PoolError`. Anything
//! that happens while a task runs is a [`TaskError`](crate::TaskError) value
//! inside the task result instead.

use thiserror::Error;

use crate::config::ConfigError;
use crate::protocol::TaskError;
use crate::scheduler::{ExecutorError, QueueError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Worker pool has been disposed")]
    Disposed,

    #[error("Task queue is full (max: {max})")]
    QueueFull { max: usize },

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("Multi-threading was forced but is not available in this environment")]
    MultiThreadingUnavailable,

    #[error("Sessions are not supported in single-threaded mode")]
    SessionsUnsupported,

    #[error("No available workers")]
    NoWorkerAvailable,

    #[error("Worker initialization failed: {0}")]
    WorkerInit(String),
}

impl From<QueueError> for PoolError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Full { max } => PoolError::QueueFull { max },
        }
    }
}

impl From<ExecutorError> for PoolError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::NoWorkerAvailable => PoolError::NoWorkerAvailable,
            ExecutorError::SessionsUnsupported => PoolError::SessionsUnsupported,
            ExecutorError::Disposed => PoolError::Disposed,
            ExecutorError::WorkerInit(msg) => PoolError::WorkerInit(msg),
            ExecutorError::Busy => PoolError::NoWorkerAvailable,
        }
    }
}

impl From<ConfigError> for PoolError {
    fn from(err: ConfigError) -> Self {
        PoolError::InvalidConfig(err.to_string())
    }
}

/// Admission failures surface as task results in the `eval_code` helpers.
impl From<PoolError> for TaskError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Disposed => TaskError::disposed(),
            PoolError::QueueFull { .. } => TaskError::new("QueueFullError", err.to_string()),
            other => TaskError::new("Error", other.to_string()),
        }
    }
}
