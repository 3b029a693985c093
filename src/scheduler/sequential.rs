//! In-process executor with a single slot.
//!
//! Used when parallel workers are unavailable or single-threaded mode is
//! forced. Evaluation runs on tokio's blocking pool so the runtime stays
//! responsive; timeouts rely on the evaluator polling its interrupt hook.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::executor::{CapacityListener, ExecutorError, ReserveFuture, TaskExecutor};
use super::task::InternalTask;
use crate::evaluator::{self, CancelSignal, Evaluator, EvaluatorFactory};
use crate::protocol::{InitOptions, TaskError, TaskId, TaskResult, WorkerId};

pub struct SequentialExecutor {
    evaluator: Arc<Mutex<Box<dyn Evaluator>>>,
    signal: Arc<CancelSignal>,
    busy: Arc<AtomicBool>,
    current: Arc<Mutex<Option<TaskId>>>,
    disposed: AtomicBool,
}

impl SequentialExecutor {
    /// Build the evaluator and run the bootstrap source, if any.
    pub fn new(factory: &dyn EvaluatorFactory, init: &InitOptions) -> Result<Self, ExecutorError> {
        let evaluator = evaluator::initialize(factory, init)
            .map_err(|e| ExecutorError::WorkerInit(e.to_string()))?;
        Ok(Self {
            evaluator: Arc::new(Mutex::new(evaluator)),
            signal: CancelSignal::new(),
            busy: Arc::new(AtomicBool::new(false)),
            current: Arc::new(Mutex::new(None)),
            disposed: AtomicBool::new(false),
        })
    }
}

impl TaskExecutor for SequentialExecutor {
    fn execute(&self, task: &InternalTask) -> Result<BoxFuture<'static, TaskResult>, ExecutorError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(ExecutorError::Disposed);
        }
        if self.busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(ExecutorError::Busy);
        }
        *self.current.lock() = Some(task.id.clone());

        let evaluator = Arc::clone(&self.evaluator);
        let signal = Arc::clone(&self.signal);
        let busy = Arc::clone(&self.busy);
        let current = Arc::clone(&self.current);
        let task = task.clone();
        debug!(task_id = %task.id, "running task in-process");

        Ok(async move {
            let task_id = task.id.clone();
            let timeout_ms = task.timeout_ms();
            let joined = tokio::task::spawn_blocking(move || {
                let mut evaluator = evaluator.lock();
                evaluator::run_eval(
                    evaluator.as_mut(),
                    &task.id,
                    &task.code,
                    task.filename.as_deref(),
                    timeout_ms,
                    &signal,
                )
            })
            .await;
            *current.lock() = None;
            busy.store(false, Ordering::Release);
            joined.unwrap_or_else(|e| {
                warn!(task_id = %task_id, error = %e, "in-process evaluation panicked");
                Err(TaskError::worker_crash(&task_id, &e.to_string()))
            })
        }
        .boxed())
    }

    fn cancel(&self, task_id: &TaskId) -> bool {
        if self.current.lock().as_ref() != Some(task_id) {
            return false;
        }
        self.signal.request(task_id.clone());
        true
    }

    fn available_count(&self) -> usize {
        let unavailable = self.disposed.load(Ordering::Acquire) || self.busy.load(Ordering::Acquire);
        usize::from(!unavailable)
    }

    fn busy_count(&self) -> usize {
        usize::from(self.busy.load(Ordering::Acquire))
    }

    fn max_concurrency(&self) -> usize {
        1
    }

    fn is_multi_threaded(&self) -> bool {
        false
    }

    fn reserve_worker_for_session(&self) -> ReserveFuture {
        future::ready(Err(ExecutorError::SessionsUnsupported)).boxed()
    }

    fn release_reserved_worker(&self, _worker_id: WorkerId) {}

    fn reserved_count(&self) -> usize {
        0
    }

    // Capacity only frees up on task completion, which the pool already observes.
    fn set_capacity_listener(&self, _listener: CapacityListener) {}

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.signal.terminate();
    }

    fn kind(&self) -> &'static str {
        "sequential"
    }
}
