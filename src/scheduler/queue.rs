//! Priority-ordered holding area for tasks that could not dispatch at once.

use std::collections::VecDeque;

use thiserror::Error;

use super::task::QueuedTask;
use crate::protocol::TaskId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Task queue is full (max: {max})")]
    Full { max: usize },
}

/// Not internally synchronized; the pool guards it with its state lock.
///
/// Cancellation only marks entries. They are dropped lazily by
/// [`dequeue`](Self::dequeue) or [`compact`](Self::compact), and keep counting
/// toward the size limit until then.
#[derive(Debug)]
pub struct TaskQueue {
    entries: VecDeque<QueuedTask>,
    /// 0 means unbounded.
    max_size: usize,
}

impl TaskQueue {
    pub fn new(max_size: usize) -> Self {
        Self { entries: VecDeque::new(), max_size }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn is_full(&self) -> bool {
        self.max_size > 0 && self.entries.len() >= self.max_size
    }

    /// Insert before the first entry with strictly lower priority.
    pub fn enqueue(&mut self, task: QueuedTask) -> Result<(), QueueError> {
        if self.is_full() {
            return Err(QueueError::Full { max: self.max_size });
        }
        let priority = task.priority();
        let position = self
            .entries
            .iter()
            .position(|queued| queued.priority() < priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(position, task);
        Ok(())
    }

    /// Put back a task that was dequeued but could not dispatch.
    ///
    /// It goes ahead of its priority peers and ignores the size limit, since
    /// it was already admitted once.
    pub fn requeue(&mut self, task: QueuedTask) {
        let priority = task.priority();
        let position = self
            .entries
            .iter()
            .position(|queued| queued.priority() <= priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(position, task);
    }

    /// Pop the first live entry, discarding cancelled ones on the way.
    pub fn dequeue(&mut self) -> Option<QueuedTask> {
        while let Some(task) = self.entries.pop_front() {
            if !task.is_cancelled() {
                return Some(task);
            }
        }
        None
    }

    /// Cancel a queued task in place. True if the id is still in the queue,
    /// even when it was already cancelled; the caller is settled only once.
    pub fn cancel(&mut self, task_id: &TaskId) -> bool {
        match self.entries.iter_mut().find(|queued| queued.id() == task_id) {
            Some(queued) => {
                queued.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.entries.iter().any(|queued| queued.id() == task_id && !queued.is_cancelled())
    }

    /// Drop cancelled entries.
    pub fn compact(&mut self) {
        self.entries.retain(|queued| !queued.is_cancelled());
    }

    /// Remove and return every entry, cancelled ones included.
    pub fn clear(&mut self) -> Vec<QueuedTask> {
        self.entries.drain(..).collect()
    }

    /// Live entries only.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|queued| !queued.is_cancelled()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
