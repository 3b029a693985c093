//! The interpreter boundary.
//!
//! The pool never looks inside an interpreter. Each worker owns one
//! [`Evaluator`] built by an [`EvaluatorFactory`], and the only channel back
//! into a running evaluation is the [`Interrupt`] hook the evaluator is
//! expected to poll.

mod echo;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

use crate::protocol::{InitOptions, TaskError, TaskId, TaskResult};

pub use echo::EchoEvaluator;

pub const DEFAULT_FILENAME: &str = "eval.js";
pub const BOOTSTRAP_FILENAME: &str = "<bootstrap>";

/// One interpreter instance. Never shared between workers.
pub trait Evaluator: Send {
    /// Evaluate `code` and return its value.
    ///
    /// Long-running evaluations should poll [`Interrupt::should_interrupt`]
    /// and abort with any error once it returns true.
    fn eval(&mut self, code: &str, filename: &str, interrupt: &Interrupt) -> TaskResult;
}

/// Builds one evaluator per worker.
pub trait EvaluatorFactory: Send + Sync + 'static {
    fn create(&self, options: &InitOptions) -> Result<Box<dyn Evaluator>, TaskError>;
}

impl<F> EvaluatorFactory for F
where
    F: Fn(&InitOptions) -> Result<Box<dyn Evaluator>, TaskError> + Send + Sync + 'static,
{
    fn create(&self, options: &InitOptions) -> Result<Box<dyn Evaluator>, TaskError> {
        self(options)
    }
}

/// Cancellation requests addressed to a worker, readable from a running evaluation.
#[derive(Debug, Default)]
pub struct CancelSignal {
    requested: Mutex<Option<TaskId>>,
    terminated: AtomicBool,
}

impl CancelSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn request(&self, task_id: TaskId) {
        *self.requested.lock() = Some(task_id);
    }

    /// Consume the request if it targets `task_id`.
    pub fn take_if(&self, task_id: &TaskId) -> bool {
        let mut requested = self.requested.lock();
        if requested.as_ref() == Some(task_id) {
            *requested = None;
            true
        } else {
            false
        }
    }

    pub fn clear(&self) {
        *self.requested.lock() = None;
    }

    /// Interrupt whatever is running, permanently.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

/// Interrupt hook handed to [`Evaluator::eval`].
#[derive(Debug)]
pub struct Interrupt {
    task_id: Option<TaskId>,
    deadline: Option<Instant>,
    signal: Option<Arc<CancelSignal>>,
    timed_out: AtomicBool,
    cancelled: AtomicBool,
}

impl Interrupt {
    pub fn new(task_id: TaskId, timeout: Option<Duration>, signal: Arc<CancelSignal>) -> Self {
        Self {
            task_id: Some(task_id),
            deadline: timeout.map(|t| Instant::now() + t),
            signal: Some(signal),
            timed_out: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    /// A hook that never fires. Used for bootstrap code.
    pub fn never() -> Self {
        Self {
            task_id: None,
            deadline: None,
            signal: None,
            timed_out: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    /// True once the task was cancelled or ran past its deadline. Sticky.
    pub fn should_interrupt(&self) -> bool {
        if self.cancelled() || self.timed_out() {
            return true;
        }
        if let (Some(signal), Some(task_id)) = (&self.signal, &self.task_id) {
            if signal.is_terminated() || signal.take_if(task_id) {
                self.cancelled.store(true, Ordering::Release);
                return true;
            }
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            self.timed_out.store(true, Ordering::Release);
            return true;
        }
        false
    }

    pub fn task_id(&self) -> Option<&TaskId> {
        self.task_id.as_ref()
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Drop a leading `#!` line.
pub fn strip_shebang(code: &str) -> &str {
    if !code.starts_with("#!") {
        return code;
    }
    match code.find('\n') {
        Some(idx) => &code[idx + 1..],
        None => "",
    }
}

/// Run one task against an evaluator, mapping interrupts onto scheduler errors.
pub fn run_eval(
    evaluator: &mut dyn Evaluator,
    task_id: &TaskId,
    code: &str,
    filename: Option<&str>,
    timeout_ms: Option<u64>,
    signal: &Arc<CancelSignal>,
) -> TaskResult {
    let code = strip_shebang(code);

    if signal.take_if(task_id) {
        return Err(TaskError::cancelled());
    }
    // Anything left over targets an earlier task.
    signal.clear();

    let timeout = timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis);
    let interrupt = Interrupt::new(task_id.clone(), timeout, Arc::clone(signal));
    let result = evaluator.eval(code, filename.unwrap_or(DEFAULT_FILENAME), &interrupt);

    if interrupt.cancelled() || signal.take_if(task_id) {
        return Err(TaskError::cancelled());
    }
    match result {
        Err(_) if interrupt.timed_out() => Err(TaskError::timeout(timeout_ms.unwrap_or_default())),
        other => other,
    }
}

/// Run bootstrap source in a fresh evaluator.
pub fn run_bootstrap(evaluator: &mut dyn Evaluator, source: &str) -> Result<Value, TaskError> {
    evaluator
        .eval(source, BOOTSTRAP_FILENAME, &Interrupt::never())
        .map_err(|e| {
            TaskError::new("BootstrapError", format!("Bootstrap code failed: {}", e.message))
                .with_stack(e.stack)
        })
}

/// Build an evaluator and run the configured bootstrap in it.
pub fn initialize(
    factory: &dyn EvaluatorFactory,
    options: &InitOptions,
) -> Result<Box<dyn Evaluator>, TaskError> {
    let mut evaluator = factory.create(options).map_err(|e| {
        if e.name == "Error" || e.name.is_empty() {
            TaskError::new("InitializationError", e.message).with_stack(e.stack)
        } else {
            e
        }
    })?;
    if let Some(source) = options.bootstrap_source.as_deref() {
        run_bootstrap(evaluator.as_mut(), source)?;
    }
    Ok(evaluator)
}
