//! Shared evaluators and pool builders for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use snippet_pool::{
    EchoEvaluator, Evaluator, EvaluatorFactory, InitOptions, Interrupt, Pool, PoolConfig, TaskError,
    TaskResult,
};

pub async fn echo_pool(pool_size: usize) -> Pool {
    echo_pool_with(PoolConfig { pool_size, ..Default::default() }).await
}

pub async fn echo_pool_with(config: PoolConfig) -> Pool {
    Pool::new(Arc::new(EchoEvaluator::factory()), config).await.unwrap()
}

/// Counts how many evaluations are running at once across all workers.
#[derive(Debug, Default)]
pub struct Tracker {
    active: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

impl Tracker {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

/// Echoes `code` after a short interruptible pause, recording concurrency.
pub struct TrackingEvaluator {
    tracker: Arc<Tracker>,
    busy: bool,
}

impl TrackingEvaluator {
    pub fn factory(tracker: Arc<Tracker>) -> impl EvaluatorFactory {
        move |_: &InitOptions| -> Result<Box<dyn Evaluator>, TaskError> {
            Ok(Box::new(TrackingEvaluator { tracker: Arc::clone(&tracker), busy: false }))
        }
    }
}

impl Evaluator for TrackingEvaluator {
    fn eval(&mut self, code: &str, _filename: &str, interrupt: &Interrupt) -> TaskResult {
        if self.busy {
            return Err(TaskError::new("ReentrancyError", "evaluator entered twice"));
        }
        self.busy = true;
        let now = self.tracker.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.tracker.peak.fetch_max(now, Ordering::SeqCst);
        self.tracker.total.fetch_add(1, Ordering::SeqCst);

        for _ in 0..3 {
            if interrupt.should_interrupt() {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        self.tracker.active.fetch_sub(1, Ordering::SeqCst);
        self.busy = false;
        Ok(Value::String(code.to_string()))
    }
}

/// Ignores interrupts entirely. `late <ms>` sleeps then returns `"late"`;
/// anything else bumps a counter.
#[derive(Default)]
pub struct StubbornEvaluator {
    counter: u64,
}

impl StubbornEvaluator {
    pub fn factory() -> impl EvaluatorFactory {
        |_: &InitOptions| -> Result<Box<dyn Evaluator>, TaskError> {
            Ok(Box::new(StubbornEvaluator::default()))
        }
    }
}

impl Evaluator for StubbornEvaluator {
    fn eval(&mut self, code: &str, _filename: &str, _interrupt: &Interrupt) -> TaskResult {
        if let Some(ms) = code.strip_prefix("late ") {
            let ms: u64 = ms.trim().parse().map_err(|_| TaskError::new("SyntaxError", "bad duration"))?;
            std::thread::sleep(Duration::from_millis(ms));
            return Ok(json!("late"));
        }
        self.counter += 1;
        Ok(json!(self.counter))
    }
}
