//! Worker side of the protocol.
//!
//! [`WorkerRuntime`] owns one evaluator and turns each [`CoordinatorMessage`]
//! into at most one reply. Transports decide how messages arrive; the
//! runtime itself is synchronous and runs on the worker's own thread.

mod stdio;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::evaluator::{self, CancelSignal, Evaluator, EvaluatorFactory};
use crate::protocol::{CoordinatorMessage, TaskError, WorkerMessage};

pub use stdio::{serve, serve_stdio};

/// What a worker loop should do after handling one message.
#[derive(Debug, PartialEq)]
pub enum Step {
    Reply(WorkerMessage),
    Continue,
    Exit,
}

pub struct WorkerRuntime {
    factory: Arc<dyn EvaluatorFactory>,
    evaluator: Option<Box<dyn Evaluator>>,
    signal: Arc<CancelSignal>,
}

impl WorkerRuntime {
    pub fn new(factory: Arc<dyn EvaluatorFactory>, signal: Arc<CancelSignal>) -> Self {
        Self { factory, evaluator: None, signal }
    }

    pub fn signal(&self) -> &Arc<CancelSignal> {
        &self.signal
    }

    pub fn is_initialized(&self) -> bool {
        self.evaluator.is_some()
    }

    pub fn handle(&mut self, message: CoordinatorMessage) -> Step {
        match message {
            CoordinatorMessage::Init(options) => {
                debug!(variant = ?options.variant, "initializing evaluator");
                match evaluator::initialize(self.factory.as_ref(), &options) {
                    Ok(evaluator) => {
                        self.evaluator = Some(evaluator);
                        Step::Reply(WorkerMessage::Ready)
                    }
                    Err(error) => {
                        warn!(error = %error, "evaluator initialization failed");
                        Step::Reply(WorkerMessage::InitError { error })
                    }
                }
            }
            CoordinatorMessage::Eval { task_id, code, filename, timeout_ms } => {
                let Some(evaluator) = self.evaluator.as_mut() else {
                    return Step::Reply(WorkerMessage::Failed {
                        task_id,
                        error: TaskError::new("Error", "Worker not initialized"),
                    });
                };
                let result = evaluator::run_eval(
                    evaluator.as_mut(),
                    &task_id,
                    &code,
                    filename.as_deref(),
                    timeout_ms,
                    &self.signal,
                );
                Step::Reply(match result {
                    Ok(value) => WorkerMessage::Completed { task_id, value },
                    Err(error) => WorkerMessage::Failed { task_id, error },
                })
            }
            CoordinatorMessage::Cancel { task_id } => {
                self.signal.request(task_id);
                Step::Continue
            }
            CoordinatorMessage::Terminate => {
                self.evaluator = None;
                Step::Exit
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::EchoEvaluator;
    use crate::protocol::{InitOptions, TaskId};
    use serde_json::json;

    fn runtime() -> WorkerRuntime {
        WorkerRuntime::new(Arc::new(EchoEvaluator::factory()), CancelSignal::new())
    }

    fn eval(id: u64, code: &str) -> CoordinatorMessage {
        CoordinatorMessage::Eval {
            task_id: TaskId::pool(id),
            code: code.into(),
            filename: None,
            timeout_ms: None,
        }
    }

    #[test]
    fn test_eval_before_init_fails() {
        let mut rt = runtime();
        let step = rt.handle(eval(1, "1"));
        let Step::Reply(WorkerMessage::Failed { error, .. }) = step else {
            panic!("expected failure, got {step:?}");
        };
        assert_eq!(error.message, "Worker not initialized");
    }

    #[test]
    fn test_init_then_eval() {
        let mut rt = runtime();
        assert_eq!(
            rt.handle(CoordinatorMessage::Init(InitOptions::default())),
            Step::Reply(WorkerMessage::Ready)
        );
        assert_eq!(
            rt.handle(eval(1, "#!/bin/snippet\n[1]")),
            Step::Reply(WorkerMessage::Completed { task_id: TaskId::pool(1), value: json!([1]) })
        );
    }

    #[test]
    fn test_bootstrap_error_reported_as_init_error() {
        let mut rt = runtime();
        let options =
            InitOptions { bootstrap_source: Some("throw Error: bad".into()), ..Default::default() };
        let Step::Reply(WorkerMessage::InitError { error }) =
            rt.handle(CoordinatorMessage::Init(options))
        else {
            panic!("expected init-error");
        };
        assert_eq!(error.name, "BootstrapError");
        assert!(!rt.is_initialized());
    }

    #[test]
    fn test_bootstrap_state_visible_to_tasks() {
        let mut rt = runtime();
        let options =
            InitOptions { bootstrap_source: Some("set greeting \"hi\"".into()), ..Default::default() };
        rt.handle(CoordinatorMessage::Init(options));
        assert_eq!(
            rt.handle(eval(1, "get greeting")),
            Step::Reply(WorkerMessage::Completed { task_id: TaskId::pool(1), value: json!("hi") })
        );
    }

    #[test]
    fn test_cancel_before_eval() {
        let mut rt = runtime();
        rt.handle(CoordinatorMessage::Init(InitOptions::default()));
        assert_eq!(rt.handle(CoordinatorMessage::Cancel { task_id: TaskId::pool(2) }), Step::Continue);
        let Step::Reply(WorkerMessage::Failed { error, .. }) = rt.handle(eval(2, "1")) else {
            panic!("expected cancellation");
        };
        assert!(error.is_cancelled);
    }

    #[test]
    fn test_terminate_drops_evaluator() {
        let mut rt = runtime();
        rt.handle(CoordinatorMessage::Init(InitOptions::default()));
        assert_eq!(rt.handle(CoordinatorMessage::Terminate), Step::Exit);
        assert!(!rt.is_initialized());
    }
}
