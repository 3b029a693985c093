//! The executor seam between the pool coordinator and where code runs.

use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;

use super::handle::WorkerHandle;
use super::task::InternalTask;
use crate::protocol::{TaskId, TaskResult, WorkerId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("No available workers")]
    NoWorkerAvailable,

    #[error("Executor is busy")]
    Busy,

    #[error("Sessions are not supported in single-threaded mode")]
    SessionsUnsupported,

    #[error("Executor has been disposed")]
    Disposed,

    #[error("Worker initialization failed: {0}")]
    WorkerInit(String),
}

/// Invoked when capacity frees up outside a normal task completion.
pub type CapacityListener = Arc<dyn Fn() + Send + Sync>;

pub type ReserveFuture = BoxFuture<'static, Result<Arc<WorkerHandle>, ExecutorError>>;

/// Runs admitted tasks.
///
/// `execute` claims capacity synchronously and fails fast when there is
/// none; it never queues. The returned future does the work and always
/// settles with a [`TaskResult`].
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: &InternalTask) -> Result<BoxFuture<'static, TaskResult>, ExecutorError>;

    /// Best-effort interrupt of a dispatched task. Stale ids are ignored.
    fn cancel(&self, task_id: &TaskId) -> bool;

    fn available_count(&self) -> usize;

    fn busy_count(&self) -> usize;

    fn max_concurrency(&self) -> usize;

    fn is_multi_threaded(&self) -> bool;

    /// Lease one worker exclusively. It stops counting as available.
    fn reserve_worker_for_session(&self) -> ReserveFuture;

    fn release_reserved_worker(&self, worker_id: WorkerId);

    fn reserved_count(&self) -> usize;

    fn set_capacity_listener(&self, listener: CapacityListener);

    /// Idempotent.
    fn dispose(&self);

    /// Short label for logs and spans.
    fn kind(&self) -> &'static str;
}
