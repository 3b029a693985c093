//! Property-based tests for queue ordering, cancellation and worker exclusivity.

mod common;

use std::sync::Arc;

use proptest::prelude::*;
use snippet_pool::scheduler::{InternalTask, Priority, QueuedTask, Task, TaskQueue};
use snippet_pool::{Pool, PoolConfig, TaskId};
use tokio::sync::oneshot;

use common::{Tracker, TrackingEvaluator};

fn queued(seq: u64, priority: i32) -> QueuedTask {
    let (tx, _rx) = oneshot::channel();
    let task = Task::new(seq.to_string()).with_priority(priority);
    QueuedTask::new(InternalTask::new(TaskId::pool(seq), task, None), tx)
}

fn seq_of(task: &QueuedTask) -> u64 {
    task.task.code.parse().unwrap()
}

proptest! {
    #[test]
    fn dequeue_is_priority_then_fifo(priorities in prop::collection::vec(-3i32..=3, 0..64)) {
        let mut queue = TaskQueue::new(0);
        for (seq, priority) in priorities.iter().enumerate() {
            queue.enqueue(queued(seq as u64, *priority)).unwrap();
        }

        let mut drained = Vec::new();
        while let Some(task) = queue.dequeue() {
            drained.push((task.priority(), seq_of(&task)));
        }
        prop_assert_eq!(drained.len(), priorities.len());
        for pair in drained.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            prop_assert!(a.0 >= b.0);
            if a.0 == b.0 {
                prop_assert!(a.1 < b.1);
            }
        }
    }

    #[test]
    fn cancelled_tasks_never_dequeue(
        priorities in prop::collection::vec(-3i32..=3, 1..48),
        cancel_mask in prop::collection::vec(any::<bool>(), 48),
    ) {
        let mut queue = TaskQueue::new(0);
        for (seq, priority) in priorities.iter().enumerate() {
            queue.enqueue(queued(seq as u64, *priority)).unwrap();
        }

        let mut live = priorities.len();
        for seq in 0..priorities.len() {
            if cancel_mask[seq] {
                prop_assert!(queue.cancel(&TaskId::pool(seq as u64)));
                prop_assert!(queue.cancel(&TaskId::pool(seq as u64)));
                live -= 1;
            }
        }
        prop_assert_eq!(queue.len(), live);

        while let Some(task) = queue.dequeue() {
            prop_assert!(!cancel_mask[seq_of(&task) as usize]);
            live -= 1;
        }
        prop_assert_eq!(live, 0);
    }

    #[test]
    fn bounded_queue_never_exceeds_limit(max in 1usize..16, submitted in 0usize..40) {
        let mut queue = TaskQueue::new(max);
        let mut accepted = 0;
        for seq in 0..submitted {
            if queue.enqueue(queued(seq as u64, 0)).is_ok() {
                accepted += 1;
            }
        }
        prop_assert_eq!(accepted, submitted.min(max));
        prop_assert_eq!(queue.len(), accepted);
        prop_assert_eq!(queue.is_full(), submitted >= max);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn running_tasks_never_exceed_pool_size(pool_size in 1usize..4, tasks in 1usize..24) {
        let tracker = Arc::new(Tracker::default());
        let factory = Arc::new(TrackingEvaluator::factory(Arc::clone(&tracker)));
        let results = tokio_test::block_on(async move {
            let pool = Pool::new(factory, PoolConfig { pool_size, ..Default::default() }).await.unwrap();
            let batch = (0..tasks).map(|i| Task::new(format!("t{i}"))).collect();
            let results = pool.eval_code_batch(batch).await;
            pool.dispose();
            results
        });

        prop_assert_eq!(results.len(), tasks);
        prop_assert!(results.iter().all(|r| r.is_ok()));
        prop_assert_eq!(tracker.total(), tasks);
        prop_assert!(tracker.peak() <= pool_size);
    }
}

#[test]
fn priority_constants_order() {
    assert!(Priority::LOW < Priority::NORMAL && Priority::NORMAL < Priority::HIGH);
}
