//! Span helpers for task execution.

use tracing::{info_span, Span};

use crate::protocol::{TaskError, TaskId};

/// Extension trait for recording outcomes onto a span.
pub trait SpanExt {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;

    /// Record the outcome of a task, including which scheduler flag fired.
    fn record_task_outcome<T>(&self, result: &Result<T, TaskError>);
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }

    fn record_task_outcome<T>(&self, result: &Result<T, TaskError>) {
        self.record_result(result);
        let flagged = match result {
            Err(e) if e.is_timeout => Some("timeout"),
            Err(e) if e.is_cancelled => Some("cancelled"),
            Err(e) if e.is_worker_crash => Some("crash"),
            _ => None,
        };
        if let Some(status) = flagged {
            self.record("status", status);
        }
    }
}

/// Standard span for one task execution.
pub struct TaskSpan;

impl TaskSpan {
    /// Fields `status`, `error.message` and `elapsed_ms` are filled in on completion.
    pub fn new(task_id: &TaskId, executor: &'static str) -> Span {
        info_span!(
            "snippet_task",
            task_id = %task_id,
            executor = executor,
            worker_id = tracing::field::Empty,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
            elapsed_ms = tracing::field::Empty,
        )
    }
}
