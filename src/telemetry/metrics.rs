//! `metrics` facade instrumentation.
//!
//! Names are stable; labels stay low-cardinality (never task ids).

use std::time::Duration;

use metrics::{counter, gauge, histogram};

const TASKS_COMPLETED: &str = "snippet_pool_tasks_completed_total";
const TASKS_FAILED: &str = "snippet_pool_tasks_failed_total";
const TASK_DURATION: &str = "snippet_pool_task_duration_ms";
const QUEUE_DEPTH: &str = "snippet_pool_queue_depth";
const WORKERS: &str = "snippet_pool_workers";
const WORKER_SPAWNS: &str = "snippet_pool_worker_spawns_total";
const WORKER_CRASHES: &str = "snippet_pool_worker_crashes_total";

pub fn record_task_success(elapsed: Duration) {
    counter!(TASKS_COMPLETED).increment(1);
    histogram!(TASK_DURATION).record(elapsed.as_secs_f64() * 1000.0);
}

/// `kind` is one of `error`, `timeout`, `cancelled`, `crash`, `disposed`.
pub fn record_task_failure(kind: &'static str, elapsed: Duration) {
    counter!(TASKS_FAILED, "kind" => kind).increment(1);
    histogram!(TASK_DURATION).record(elapsed.as_secs_f64() * 1000.0);
}

pub fn record_queue_depth(depth: usize) {
    gauge!(QUEUE_DEPTH).set(depth as f64);
}

pub fn record_workers(busy: usize, available: usize) {
    gauge!(WORKERS, "state" => "busy").set(busy as f64);
    gauge!(WORKERS, "state" => "available").set(available as f64);
}

pub fn record_worker_spawn() {
    counter!(WORKER_SPAWNS).increment(1);
}

pub fn record_worker_crash() {
    counter!(WORKER_CRASHES).increment(1);
}
