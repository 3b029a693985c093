//! Pool disposal: one teardown path that settles everything exactly once.

mod common;

use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use snippet_pool::protocol::POOL_DISPOSED_ERROR;
use snippet_pool::{EvalOptions, PoolConfig, PoolError, SessionEvalOptions, Task};

use common::{echo_pool, echo_pool_with};

#[tokio::test]
async fn test_dispose_settles_k_queued_and_m_running() {
    let pool = echo_pool(2).await;
    let running: Vec<_> = (0..2).map(|_| pool.submit(Task::new("sleep 1000 0")).unwrap()).collect();
    let queued: Vec<_> = (0..3).map(|i| pool.submit(Task::new(i.to_string())).unwrap()).collect();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(pool.stats().queued_tasks, 3);

    pool.dispose();

    let results = join_all(running.into_iter().chain(queued)).await;
    assert_eq!(results.len(), 5);
    for result in results {
        let err = result.unwrap_err();
        assert_eq!(err.name, POOL_DISPOSED_ERROR);
        assert!(err.is_disposed());
    }
}

#[tokio::test]
async fn test_dispose_is_idempotent() {
    let pool = echo_pool(1).await;
    pool.eval_code("1", EvalOptions::default()).await.unwrap();
    pool.dispose();
    pool.dispose();
    assert!(!pool.is_alive());
    assert_eq!(pool.stats().available_workers, 0);
}

#[tokio::test]
async fn test_disposed_pool_rejects_everything() {
    let pool = echo_pool(1).await;
    pool.dispose();

    assert_eq!(pool.submit(Task::new("1")).err(), Some(PoolError::Disposed));
    assert!(pool.eval_code("1", EvalOptions::default()).await.unwrap_err().is_disposed());
    assert_eq!(pool.create_session().await.err(), Some(PoolError::Disposed));

    let batch = pool.eval_code_batch(vec![Task::new("1"), Task::new("2")]).await;
    assert!(batch.iter().all(|r| r.as_ref().unwrap_err().is_disposed()));
}

#[tokio::test]
async fn test_dispose_releases_sessions_first() {
    let pool = echo_pool(2).await;
    let session = pool.create_session().await.unwrap();
    let call = session.eval_code("sleep 1000 0", SessionEvalOptions::default());
    let dispose = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.dispose();
    };
    let (result, ()) = tokio::join!(call, dispose);

    let err = result.unwrap_err();
    assert_eq!(err.name, POOL_DISPOSED_ERROR);
    assert!(!err.is_cancelled);
    assert!(!session.is_alive());
    assert_eq!(pool.active_session_count(), 0);
    let err = session.eval_code("1", SessionEvalOptions::default()).await.unwrap_err();
    assert_eq!(err.name, snippet_pool::protocol::SESSION_RELEASED_ERROR);
}

#[tokio::test]
async fn test_sequential_dispose_interrupts_running_task() {
    let pool = echo_pool_with(PoolConfig { force_single_threaded: true, ..Default::default() }).await;
    let running = pool.submit(Task::new("spin")).unwrap();
    let queued = pool.submit(Task::new("1")).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    pool.dispose();
    assert!(running.await.unwrap_err().is_disposed());
    assert!(queued.await.unwrap_err().is_disposed());
}

#[tokio::test]
async fn test_drop_disposes() {
    let pool = echo_pool(1).await;
    let running = pool.submit(Task::new("sleep 1000 0")).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(pool);
    assert!(running.await.unwrap_err().is_disposed());
}

#[tokio::test]
async fn test_completed_results_survive_dispose() {
    let pool = echo_pool(1).await;
    let done = pool.submit(Task::new("\"kept\"")).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.dispose();
    assert_eq!(done.await, Ok(json!("kept")));
}
