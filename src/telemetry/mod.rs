//! Telemetry for the snippet pool.
//!
//! Structured logging through `tracing`, per-task spans, and `metrics` facade
//! counters. Installing a recorder or subscriber is left to the embedding
//! application; without one every call here is a cheap no-op.

mod format;
mod logging;
mod metrics;
mod spans;

pub use format::{format_duration, truncate_code};
pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{
    record_queue_depth, record_task_failure, record_task_success, record_worker_crash,
    record_worker_spawn, record_workers,
};
pub use spans::{SpanExt, TaskSpan};
