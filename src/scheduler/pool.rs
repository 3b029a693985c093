//! Pool coordinator: admission, queueing, dispatch and teardown.
//!
//! All scheduling state sits behind one lock. Executors run work in parallel
//! but report every completion back through [`PoolInner::complete`], which
//! updates statistics and drains the queue. Lock order is pool state, then
//! executor internals, then worker handles.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use super::executor::{ExecutorError, TaskExecutor};
use super::pool_executor::WorkerPoolExecutor;
use super::priority::Priority;
use super::queue::TaskQueue;
use super::sequential::SequentialExecutor;
use super::session::{Session, SessionInner};
use super::task::{InternalTask, QueuedTask, Responder, Task};
use crate::capabilities::{self, Capabilities};
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::evaluator::EvaluatorFactory;
use crate::protocol::{SessionId, TaskError, TaskId, TaskResult, Variant, WorkerId};
use crate::telemetry::{self, SpanExt, TaskSpan};
use crate::transport::{ThreadTransportFactory, TransportFactory};

/// Options for [`Pool::eval_code`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvalOptions {
    pub filename: Option<String>,
    /// Overrides the pool default. `Some(0)` disables the timeout.
    pub timeout_ms: Option<u64>,
    pub priority: Priority,
}

impl EvalOptions {
    fn into_task(self, code: String) -> Task {
        Task { code, filename: self.filename, timeout_ms: self.timeout_ms, priority: self.priority }
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub pool_size: usize,
    pub busy_workers: usize,
    pub available_workers: usize,
    pub queued_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub average_execution_time_ms: f64,
    pub is_multi_threaded: bool,
}

struct InFlight {
    responder: Responder,
    started: Instant,
}

struct State {
    disposed: bool,
    queue: TaskQueue,
    in_flight: HashMap<TaskId, InFlight>,
    completed: u64,
    failed: u64,
    total_execution: Duration,
    next_task: u64,
    next_session: u64,
}

pub(crate) struct PoolInner {
    id: Uuid,
    runtime: Handle,
    config: Arc<PoolConfig>,
    executor: Arc<dyn TaskExecutor>,
    state: Mutex<State>,
    sessions: DashMap<SessionId, Arc<SessionInner>>,
}

fn failure_kind(error: &TaskError) -> &'static str {
    if error.is_timeout {
        "timeout"
    } else if error.is_cancelled {
        "cancelled"
    } else if error.is_worker_crash {
        "crash"
    } else if error.is_disposed() {
        "disposed"
    } else {
        "error"
    }
}

impl PoolInner {
    /// Hand a task to the executor. False if it had to go back in the queue.
    fn dispatch(self: &Arc<Self>, state: &mut State, queued: QueuedTask) -> bool {
        let (task, responder) = queued.into_parts();
        // Cancelled entries were settled when they were cancelled.
        let Some(responder) = responder else {
            return true;
        };
        match self.executor.execute(&task) {
            Ok(run) => {
                let task_id = task.id.clone();
                let span = TaskSpan::new(&task_id, self.executor.kind());
                let waited = task.enqueued_at.elapsed();
                debug!(
                    task_id = %task_id,
                    priority = task.priority.0,
                    waited_ms = waited.as_millis() as u64,
                    code = %telemetry::truncate_code(&task.code, None),
                    "task dispatched"
                );
                let started = Instant::now();
                state.in_flight.insert(task_id.clone(), InFlight { responder, started });

                let inner = Arc::clone(self);
                self.runtime.spawn(async move {
                    let result = run.instrument(span.clone()).await;
                    span.record("elapsed_ms", started.elapsed().as_millis() as u64);
                    span.record_task_outcome(&result);
                    inner.complete(&task_id, result);
                });
                true
            }
            Err(ExecutorError::Disposed) => {
                let _ = responder.send(Err(TaskError::disposed()));
                true
            }
            Err(e) => {
                debug!(task_id = %task.id, error = %e, "dispatch raced with capacity change, requeueing");
                state.queue.requeue(QueuedTask::new(task, responder));
                false
            }
        }
    }

    /// Settle a finished task, then refill freed capacity from the queue.
    fn complete(self: &Arc<Self>, task_id: &TaskId, result: TaskResult) {
        let mut state = self.state.lock();
        // Gone when disposal already settled it.
        let Some(entry) = state.in_flight.remove(task_id) else {
            return;
        };
        let elapsed = entry.started.elapsed();
        state.total_execution += elapsed;
        match &result {
            Ok(_) => {
                state.completed += 1;
                telemetry::record_task_success(elapsed);
                debug!(task_id = %task_id, elapsed = %telemetry::format_duration(elapsed), "task completed");
            }
            Err(e) => {
                state.failed += 1;
                telemetry::record_task_failure(failure_kind(e), elapsed);
                debug!(task_id = %task_id, error = %e, elapsed = %telemetry::format_duration(elapsed), "task failed");
            }
        }
        let _ = entry.responder.send(result);
        self.drain_locked(&mut state);
    }

    fn drain(self: &Arc<Self>) {
        let mut state = self.state.lock();
        self.drain_locked(&mut state);
    }

    fn drain_locked(self: &Arc<Self>, state: &mut State) {
        while !state.disposed && self.executor.available_count() > 0 {
            let Some(queued) = state.queue.dequeue() else {
                break;
            };
            if !self.dispatch(state, queued) {
                break;
            }
        }
        telemetry::record_queue_depth(state.queue.len());
        telemetry::record_workers(self.executor.busy_count(), self.executor.available_count());
    }

    fn cancel(&self, task_id: &TaskId) -> bool {
        {
            let mut state = self.state.lock();
            if state.queue.contains(task_id) && state.queue.cancel(task_id) {
                debug!(task_id = %task_id, "queued task cancelled");
                telemetry::record_queue_depth(state.queue.len());
                return true;
            }
            if !state.in_flight.contains_key(task_id) {
                return false;
            }
        }
        debug!(task_id = %task_id, "requesting interrupt of running task");
        self.executor.cancel(task_id)
    }

    fn is_pending(&self, task_id: &TaskId) -> bool {
        let state = self.state.lock();
        state.in_flight.contains_key(task_id) || state.queue.contains(task_id)
    }

    /// Idempotent. Settles every queued and running task with a disposal error.
    fn dispose(&self) {
        let (queued, in_flight) = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            (state.queue.clear(), std::mem::take(&mut state.in_flight))
        };
        info!(
            pool_id = %self.id,
            queued = queued.len(),
            in_flight = in_flight.len(),
            sessions = self.sessions.len(),
            "disposing worker pool"
        );

        let sessions: Vec<Arc<SessionInner>> =
            self.sessions.iter().map(|entry| Arc::clone(entry.value())).collect();
        for session in sessions {
            session.release_with(TaskError::disposed());
        }
        self.sessions.clear();

        for task in queued {
            task.settle(Err(TaskError::disposed()));
        }
        for (_, entry) in in_flight {
            let _ = entry.responder.send(Err(TaskError::disposed()));
        }
        self.executor.dispose();
        telemetry::record_queue_depth(0);
    }
}

/// Eventual result of a submitted task.
///
/// Awaiting yields the task result. Dropping the handle does not cancel the
/// task.
pub struct TaskHandle {
    task_id: TaskId,
    rx: oneshot::Receiver<TaskResult>,
    pool: Weak<PoolInner>,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle").field("task_id", &self.task_id).finish()
    }
}

impl TaskHandle {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// True while the task is queued or running.
    pub fn is_pending(&self) -> bool {
        self.pool.upgrade().is_some_and(|pool| pool.is_pending(&self.task_id))
    }

    /// Cancel the task.
    ///
    /// A queued task is guaranteed never to start. A running task is asked
    /// to stop; completion may still win the race.
    pub fn cancel(&self) -> bool {
        self.pool.upgrade().is_some_and(|pool| pool.cancel(&self.task_id))
    }
}

impl Future for TaskHandle {
    type Output = TaskResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<TaskResult> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|settled| settled.unwrap_or_else(|_| Err(TaskError::disposed())))
    }
}

/// Builder for [`Pool`].
pub struct PoolBuilder {
    evaluators: Arc<dyn EvaluatorFactory>,
    config: PoolConfig,
    transports: Option<Arc<dyn TransportFactory>>,
    capabilities: Option<Capabilities>,
}

impl PoolBuilder {
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Worker transport for the multi-threaded executor. Defaults to threads.
    pub fn transport(mut self, transports: Arc<dyn TransportFactory>) -> Self {
        self.transports = Some(transports);
        self
    }

    /// Override the environment probe.
    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Select an executor, start it, and return the pool.
    ///
    /// Must be awaited inside a tokio runtime; the pool keeps a handle to it.
    pub async fn build(self) -> Result<Pool, PoolError> {
        let mut config = self.config;
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| PoolError::InvalidConfig("pool must be built inside a tokio runtime".into()))?;

        let caps = self.capabilities.unwrap_or_else(capabilities::probe);
        if config.force_multi_threaded && !caps.multi_threading {
            return Err(PoolError::MultiThreadingUnavailable);
        }
        let multi_threaded = caps.multi_threading && !config.force_single_threaded;
        if config.variant == Variant::SharedFs && !multi_threaded {
            warn!("shared-fs variant needs parallel workers, falling back to singlefile");
            config.variant = Variant::SingleFile;
        }
        let init = config.init_options();

        let executor: Arc<dyn TaskExecutor> = if multi_threaded {
            let transports = self.transports.unwrap_or_else(|| {
                Arc::new(
                    ThreadTransportFactory::new(Arc::clone(&self.evaluators))
                        .with_stack_size(config.thread_stack_size),
                )
            });
            let executor = WorkerPoolExecutor::new(config.pool_size, transports, init);
            if config.pre_warm {
                executor.pre_warm().await?;
            }
            Arc::new(executor)
        } else {
            let evaluators = Arc::clone(&self.evaluators);
            let executor = tokio::task::spawn_blocking(move || {
                SequentialExecutor::new(evaluators.as_ref(), &init)
            })
            .await
            .map_err(|e| PoolError::WorkerInit(e.to_string()))??;
            Arc::new(executor)
        };

        let inner = Arc::new(PoolInner {
            id: Uuid::new_v4(),
            runtime,
            state: Mutex::new(State {
                disposed: false,
                queue: TaskQueue::new(config.max_queue_size),
                in_flight: HashMap::new(),
                completed: 0,
                failed: 0,
                total_execution: Duration::ZERO,
                next_task: 0,
                next_session: 0,
            }),
            config: Arc::new(config),
            executor,
            sessions: DashMap::new(),
        });

        // Capacity can free up from inside executor locks, so drain on a fresh task.
        let weak = Arc::downgrade(&inner);
        inner.executor.set_capacity_listener(Arc::new(move || {
            if let Some(pool) = weak.upgrade() {
                let runtime = pool.runtime.clone();
                runtime.spawn(async move { pool.drain() });
            }
        }));

        info!(
            pool_id = %inner.id,
            executor = inner.executor.kind(),
            pool_size = inner.executor.max_concurrency(),
            variant = ?inner.config.variant,
            "worker pool ready"
        );
        Ok(Pool { inner })
    }
}

/// A pool of isolated evaluators.
///
/// Dropping the pool disposes it.
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.inner.id)
            .field("executor", &self.inner.executor.kind())
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Pool {
    pub fn builder(evaluators: Arc<dyn EvaluatorFactory>) -> PoolBuilder {
        PoolBuilder {
            evaluators,
            config: PoolConfig::default(),
            transports: None,
            capabilities: None,
        }
    }

    /// Shorthand for `Pool::builder(evaluators).config(config).build()`.
    pub async fn new(evaluators: Arc<dyn EvaluatorFactory>, config: PoolConfig) -> Result<Self, PoolError> {
        Self::builder(evaluators).config(config).build().await
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Admit a task: dispatch it now if a worker is free, otherwise queue it.
    pub fn submit(&self, task: Task) -> Result<TaskHandle, PoolError> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.disposed {
            return Err(PoolError::Disposed);
        }
        state.next_task += 1;
        let task_id = TaskId::pool(state.next_task);
        let timeout = inner.config.effective_timeout(task.timeout_ms);
        let (tx, rx) = oneshot::channel();
        let queued = QueuedTask::new(InternalTask::new(task_id.clone(), task, timeout), tx);

        // Anything already waiting goes first.
        inner.drain_locked(&mut state);
        if inner.executor.available_count() > 0 {
            inner.dispatch(&mut state, queued);
        } else {
            state.queue.enqueue(queued)?;
            debug!(task_id = %task_id, queued = state.queue.len(), "task queued");
            telemetry::record_queue_depth(state.queue.len());
        }

        Ok(TaskHandle { task_id, rx, pool: Arc::downgrade(inner) })
    }

    /// Submit and await. Admission failures come back as the task's error.
    pub async fn eval_code(&self, code: impl Into<String>, options: EvalOptions) -> TaskResult {
        match self.submit(options.into_task(code.into())) {
            Ok(handle) => handle.await,
            Err(e) => Err(e.into()),
        }
    }

    /// Submit every task, then await all results in input order.
    pub async fn eval_code_batch(&self, tasks: Vec<Task>) -> Vec<TaskResult> {
        let runs = tasks.into_iter().map(|task| {
            let submitted = self.submit(task);
            async move {
                match submitted {
                    Ok(handle) => handle.await,
                    Err(e) => Err(e.into()),
                }
            }
        });
        // Collect first so every task is admitted before any is awaited.
        let runs: Vec<_> = runs.collect();
        future::join_all(runs).await
    }

    /// Lease a worker for stateful calls.
    ///
    /// Waits for the worker to start if one has to be spawned.
    pub async fn create_session(&self) -> Result<Session, PoolError> {
        let inner = &self.inner;
        if !inner.executor.is_multi_threaded() {
            return Err(PoolError::SessionsUnsupported);
        }
        let seq = {
            let mut state = inner.state.lock();
            if state.disposed {
                return Err(PoolError::Disposed);
            }
            state.next_session += 1;
            state.next_session
        };

        let handle = inner.executor.reserve_worker_for_session().await?;
        let session_id = SessionId::new(seq);
        let worker_id = handle.id();
        let weak = Arc::downgrade(inner);
        let session = SessionInner::new(
            session_id.clone(),
            handle,
            Arc::clone(&inner.config),
            Box::new(move |id: &SessionId, worker_id: WorkerId| {
                if let Some(pool) = weak.upgrade() {
                    pool.sessions.remove(id);
                    pool.executor.release_reserved_worker(worker_id);
                }
            }),
        );
        inner.sessions.insert(session_id.clone(), Arc::clone(&session));

        if inner.state.lock().disposed {
            session.release();
            return Err(PoolError::Disposed);
        }
        info!(session_id = %session_id, worker_id = worker_id.0, "session created");
        Ok(Session::new(session))
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let executor = &self.inner.executor;
        let finished = state.completed + state.failed;
        let average_execution_time_ms = if finished == 0 {
            0.0
        } else {
            state.total_execution.as_secs_f64() * 1000.0 / finished as f64
        };
        PoolStats {
            pool_size: executor.max_concurrency(),
            busy_workers: executor.busy_count(),
            available_workers: executor.available_count(),
            queued_tasks: state.queue.len(),
            completed_tasks: state.completed,
            failed_tasks: state.failed,
            average_execution_time_ms,
            is_multi_threaded: executor.is_multi_threaded(),
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.inner.state.lock().disposed
    }

    pub fn is_multi_threaded(&self) -> bool {
        self.inner.executor.is_multi_threaded()
    }

    pub fn busy_workers(&self) -> usize {
        self.inner.executor.busy_count()
    }

    pub fn available_workers(&self) -> usize {
        self.inner.executor.available_count()
    }

    pub fn queued_tasks(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn active_session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Tear the pool down. Idempotent and non-blocking.
    ///
    /// Sessions are released first, then every queued and running task is
    /// settled with a disposal error, then the workers are terminated.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
