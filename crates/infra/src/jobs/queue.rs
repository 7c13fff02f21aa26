//! Task queue between the cache facade and the workers.
//!
//! Delivery is at-least-once: a task is removed from the pending side when a
//! worker takes it and fully forgotten only on [`TaskQueue::ack`]. Duplicate
//! delivery is harmless because the dispatcher checks the job record before
//! running and the result store rejects stale generations.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use super::types::TaskDescriptor;

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("queue connection failed: {0}")]
    Connection(String),
    #[error("queue command failed: {0}")]
    Command(String),
    #[error("task could not be (de)serialized: {0}")]
    Serialization(String),
}

/// A task taken from the queue, to be acknowledged once handled.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub task: TaskDescriptor,
    /// Backend-specific handle used by `ack` (the raw payload for Redis).
    pub(crate) receipt: Option<String>,
}

impl Delivery {
    pub fn new(task: TaskDescriptor) -> Self {
        Self {
            task,
            receipt: None,
        }
    }
}

pub trait TaskQueue: Send + Sync {
    fn enqueue(&self, task: &TaskDescriptor) -> Result<(), QueueError>;

    /// Wait up to `timeout` for the next task. A zero timeout polls.
    fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError>;

    fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Tasks waiting to be picked up.
    fn pending(&self) -> Result<usize, QueueError>;

    /// Return tasks left unacknowledged by a previous run of this consumer to
    /// the pending side. Returns how many were moved.
    fn recover(&self) -> Result<usize, QueueError> {
        Ok(0)
    }
}

impl<Q> TaskQueue for Arc<Q>
where
    Q: TaskQueue + ?Sized,
{
    fn enqueue(&self, task: &TaskDescriptor) -> Result<(), QueueError> {
        (**self).enqueue(task)
    }

    fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        (**self).dequeue(timeout)
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        (**self).ack(delivery)
    }

    fn pending(&self) -> Result<usize, QueueError> {
        (**self).pending()
    }

    fn recover(&self) -> Result<usize, QueueError> {
        (**self).recover()
    }
}

/// FIFO queue shared by threads of one process.
#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    tasks: Mutex<VecDeque<TaskDescriptor>>,
    available: Condvar,
    enqueued: AtomicU64,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks enqueued over the queue's lifetime.
    pub fn enqueued_total(&self) -> u64 {
        self.enqueued.load(Ordering::SeqCst)
    }
}

fn poisoned() -> QueueError {
    QueueError::Command("lock poisoned".to_string())
}

impl TaskQueue for InMemoryTaskQueue {
    fn enqueue(&self, task: &TaskDescriptor) -> Result<(), QueueError> {
        let mut tasks = self.tasks.lock().map_err(|_| poisoned())?;
        tasks.push_back(task.clone());
        self.enqueued.fetch_add(1, Ordering::SeqCst);
        self.available.notify_one();
        Ok(())
    }

    fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + timeout;
        let mut tasks = self.tasks.lock().map_err(|_| poisoned())?;
        loop {
            if let Some(task) = tasks.pop_front() {
                return Ok(Some(Delivery::new(task)));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tasks = self
                .available
                .wait_timeout(tasks, deadline - now)
                .map_err(|_| poisoned())?
                .0;
        }
    }

    fn ack(&self, _delivery: &Delivery) -> Result<(), QueueError> {
        Ok(())
    }

    fn pending(&self) -> Result<usize, QueueError> {
        Ok(self.tasks.lock().map_err(|_| poisoned())?.len())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use vizcache_core::{CacheKey, EntityId, QueryKind};

    use super::*;
    use crate::jobs::types::Job;
    use crate::source::ExecutionConfig;

    fn task(entity: &str) -> TaskDescriptor {
        let key = CacheKey::new(
            QueryKind::new("prs").unwrap(),
            EntityId::new(entity).unwrap(),
        );
        Job::new(key, ExecutionConfig::default(), 1).task()
    }

    #[test]
    fn fifo_order() {
        let queue = InMemoryTaskQueue::new();
        queue.enqueue(&task("a")).unwrap();
        queue.enqueue(&task("b")).unwrap();

        let first = queue.dequeue(Duration::ZERO).unwrap().unwrap();
        let second = queue.dequeue(Duration::ZERO).unwrap().unwrap();
        assert_eq!(first.task.key.entity_id().as_str(), "a");
        assert_eq!(second.task.key.entity_id().as_str(), "b");
        assert!(queue.dequeue(Duration::ZERO).unwrap().is_none());
        assert_eq!(queue.enqueued_total(), 2);
    }

    #[test]
    fn dequeue_wakes_on_enqueue() {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.enqueue(&task("late")).unwrap();
            })
        };

        let got = queue.dequeue(Duration::from_secs(5)).unwrap();
        producer.join().unwrap();
        assert_eq!(got.unwrap().task.key.entity_id().as_str(), "late");
    }

    #[test]
    fn dequeue_times_out_when_empty() {
        let queue = InMemoryTaskQueue::new();
        let started = Instant::now();
        assert!(queue.dequeue(Duration::from_millis(20)).unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
