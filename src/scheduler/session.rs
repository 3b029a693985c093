//! Sessions: an exclusive lease on one worker for stateful evaluation.
//!
//! Session calls bypass the task queue and run directly on the reserved
//! handle, so evaluator state carries over from one call to the next.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, Instrument};

use super::handle::{HandleError, WorkerHandle};
use crate::config::PoolConfig;
use crate::protocol::{SessionId, TaskError, TaskId, TaskResult, WorkerId};
use crate::telemetry::{SpanExt, TaskSpan};

/// Per-call options for [`Session::eval_code`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionEvalOptions {
    pub filename: Option<String>,
    /// Overrides the pool default. `Some(0)` disables the timeout.
    pub timeout_ms: Option<u64>,
}

/// Runs once when a session is released.
pub(crate) type ReleaseHook = Box<dyn FnOnce(&SessionId, WorkerId) + Send>;

pub(crate) struct SessionInner {
    id: SessionId,
    handle: Arc<WorkerHandle>,
    config: Arc<PoolConfig>,
    released: AtomicBool,
    next_call: AtomicU64,
    on_release: Mutex<Option<ReleaseHook>>,
}

impl SessionInner {
    pub(crate) fn new(
        id: SessionId,
        handle: Arc<WorkerHandle>,
        config: Arc<PoolConfig>,
        on_release: ReleaseHook,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            handle,
            config,
            released: AtomicBool::new(false),
            next_call: AtomicU64::new(0),
            on_release: Mutex::new(Some(on_release)),
        })
    }

    /// Idempotent. Interrupts a call in progress and returns the worker.
    pub(crate) fn release(&self) {
        self.release_with(TaskError::cancelled());
    }

    /// Release, settling a call in progress with `error`.
    pub(crate) fn release_with(&self, error: TaskError) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task_id) = self.handle.current_task() {
            self.handle.cancel_current_with(&task_id, error);
        }
        debug!(session_id = %self.id, worker_id = self.handle.id().0, "session released");
        let hook = self.on_release.lock().take();
        if let Some(hook) = hook {
            hook(&self.id, self.handle.id());
        }
    }

    fn is_alive(&self) -> bool {
        !self.released.load(Ordering::Acquire) && self.handle.is_alive()
    }
}

/// A caller-held lease on one worker.
///
/// Dropping the session releases it.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("worker_id", &self.inner.handle.id())
            .field("alive", &self.inner.is_alive())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.id
    }

    pub fn worker_id(&self) -> WorkerId {
        self.inner.handle.id()
    }

    /// False once released or once the worker died.
    pub fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }

    /// Evaluate `code` on the session's worker.
    ///
    /// Calls must not overlap: a call made while another is outstanding
    /// fails instead of waiting.
    pub async fn eval_code(&self, code: impl Into<String>, options: SessionEvalOptions) -> TaskResult {
        let inner = &self.inner;
        if inner.released.load(Ordering::Acquire) {
            return Err(TaskError::session_released());
        }
        let seq = inner.next_call.fetch_add(1, Ordering::Relaxed) + 1;
        let task_id = TaskId::session(&inner.id, seq);
        if !inner.handle.is_alive() {
            return Err(TaskError::worker_crash(&task_id, "session worker is no longer alive"));
        }

        let timeout = inner.config.effective_timeout(options.timeout_ms);
        let run = match inner.handle.execute(task_id.clone(), code.into(), options.filename, timeout) {
            Ok(run) => run,
            Err(HandleError::NotAlive) => {
                return Err(TaskError::worker_crash(&task_id, "session worker is no longer alive"));
            }
            Err(e) => return Err(TaskError::new("Error", e.to_string())),
        };

        let span = TaskSpan::new(&task_id, "session");
        span.record("worker_id", inner.handle.id().0);
        let started = Instant::now();
        let result = run.instrument(span.clone()).await;
        span.record("elapsed_ms", started.elapsed().as_millis() as u64);
        span.record_task_outcome(&result);
        result
    }

    /// Idempotent. Later calls fail with a session-released error.
    pub fn release(&self) {
        self.inner.release();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::EchoEvaluator;
    use crate::protocol::InitOptions;
    use crate::transport::ThreadTransportFactory;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn session(config: PoolConfig) -> (Session, Arc<AtomicUsize>) {
        let factory = ThreadTransportFactory::new(Arc::new(EchoEvaluator::factory()));
        let handle = WorkerHandle::spawn(WorkerId(1), &factory, InitOptions::default()).await.unwrap();
        let releases = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&releases);
        let inner = SessionInner::new(
            SessionId::new(1),
            handle,
            Arc::new(config),
            Box::new(move |_: &SessionId, _: WorkerId| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (Session::new(inner), releases)
    }

    #[tokio::test]
    async fn test_state_persists_across_calls() {
        let (session, _) = session(PoolConfig::default()).await;
        for expected in 1..=3 {
            let value = session.eval_code("incr", SessionEvalOptions::default()).await;
            assert_eq!(value, Ok(json!(expected)));
        }
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_final() {
        let (session, releases) = session(PoolConfig::default()).await;
        session.release();
        session.release();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert!(!session.is_alive());

        let err = session.eval_code("1", SessionEvalOptions::default()).await.unwrap_err();
        assert_eq!(err.name, crate::protocol::SESSION_RELEASED_ERROR);
        drop(session);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_overlapping_call_is_rejected() {
        let (session, _) = session(PoolConfig::default()).await;
        let first = session.eval_code("sleep 50 1", SessionEvalOptions::default());
        let second = session.eval_code("2", SessionEvalOptions::default());
        let (first, second) = tokio::join!(first, second);
        assert_eq!(first, Ok(json!(1)));
        assert!(second.unwrap_err().message.contains("busy"));
    }

    #[tokio::test]
    async fn test_default_timeout_applies() {
        let config = PoolConfig { default_timeout_ms: 20, ..Default::default() };
        let (session, _) = session(config).await;
        let err = session.eval_code("spin", SessionEvalOptions::default()).await.unwrap_err();
        assert!(err.is_timeout);
    }

    #[tokio::test]
    async fn test_dead_worker_fails_with_crash() {
        let (session, _) = session(PoolConfig::default()).await;
        let err = session.eval_code("panic", SessionEvalOptions::default()).await.unwrap_err();
        assert!(err.is_worker_crash);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!session.is_alive());

        let err = session.eval_code("1", SessionEvalOptions::default()).await.unwrap_err();
        assert!(err.is_worker_crash);
        assert!(err.message.contains("session-1-task-"));
    }
}
