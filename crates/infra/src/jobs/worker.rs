//! Worker pool: threads that take tasks off the queue and dispatch them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use super::dispatcher::{DispatchOutcome, Dispatcher};
use super::queue::{Delivery, QueueError, TaskQueue};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Prefix for thread names and log fields.
    pub name: String,
    pub concurrency: usize,
    /// How long one dequeue blocks; also the shutdown check interval.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "vizcache-worker".to_string(),
            concurrency: 4,
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub tasks_processed: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_abandoned: u64,
    pub tasks_skipped: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &DispatchOutcome) {
        self.tasks_processed += 1;
        match outcome {
            DispatchOutcome::Succeeded { .. } => self.tasks_succeeded += 1,
            DispatchOutcome::Failed { .. } => self.tasks_failed += 1,
            DispatchOutcome::Abandoned { .. } => self.tasks_abandoned += 1,
            DispatchOutcome::Skipped => self.tasks_skipped += 1,
        }
    }
}

/// Handle to a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: Arc<AtomicBool>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Stop taking new tasks and wait for in-flight ones to finish.
    pub fn shutdown(self) {
        stop_workers(&self.shutdown, self.joins);
    }

    pub fn stats(&self) -> WorkerStats {
        let mut stats = self
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

pub struct WorkerPool {
    queue: Arc<dyn TaskQueue>,
    dispatcher: Arc<Dispatcher>,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn TaskQueue>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { queue, dispatcher }
    }

    /// Spawn `config.concurrency` worker threads.
    pub fn spawn(self, config: WorkerConfig) -> std::io::Result<WorkerPoolHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let mut joins = Vec::with_capacity(config.concurrency);

        for index in 0..config.concurrency.max(1) {
            let worker = format!("{}-{index}", config.name);
            let queue = self.queue.clone();
            let dispatcher = self.dispatcher.clone();
            let stop = shutdown.clone();
            let stats = stats.clone();
            let poll_interval = config.poll_interval;

            let spawned = thread::Builder::new().name(worker.clone()).spawn(move || {
                worker_loop(&worker, &*queue, &dispatcher, &stop, &stats, poll_interval);
            });
            match spawned {
                Ok(join) => joins.push(join),
                Err(e) => {
                    stop_workers(&shutdown, joins);
                    return Err(e);
                }
            }
        }

        info!(pool = %config.name, workers = joins.len(), "worker pool started");
        Ok(WorkerPoolHandle {
            shutdown,
            joins,
            stats,
            started: Instant::now(),
        })
    }

    /// Process queued tasks on the calling thread until the queue is empty.
    pub fn run_pending(&self) -> Result<Vec<DispatchOutcome>, QueueError> {
        let mut outcomes = Vec::new();
        while let Some(delivery) = self.queue.dequeue(Duration::ZERO)? {
            if let Some(outcome) = handle(&*self.queue, &self.dispatcher, &delivery) {
                outcomes.push(outcome);
            }
        }
        Ok(outcomes)
    }
}

/// Raise the pool's shutdown flag and join every worker holding it.
fn stop_workers(shutdown: &AtomicBool, joins: Vec<thread::JoinHandle<()>>) {
    shutdown.store(true, Ordering::SeqCst);
    for join in joins {
        let _ = join.join();
    }
}

fn worker_loop(
    worker: &str,
    queue: &dyn TaskQueue,
    dispatcher: &Dispatcher,
    shutdown: &AtomicBool,
    stats: &Mutex<WorkerStats>,
    poll_interval: Duration,
) {
    debug!(worker, "worker started");

    while !shutdown.load(Ordering::SeqCst) {
        match queue.dequeue(poll_interval) {
            Ok(Some(delivery)) => {
                if let Ok(mut s) = stats.lock() {
                    s.current_running += 1;
                }
                let outcome = handle(queue, dispatcher, &delivery);
                if let Ok(mut s) = stats.lock() {
                    s.current_running = s.current_running.saturating_sub(1);
                    if let Some(outcome) = &outcome {
                        s.record(outcome);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!(worker, error = %e, "failed to take task from queue");
                thread::sleep(poll_interval);
            }
        }
    }

    debug!(worker, "worker stopped");
}

/// Dispatch one delivery and acknowledge it. Tracker failures leave the
/// delivery unacknowledged so it is recovered on the next start.
fn handle(queue: &dyn TaskQueue, dispatcher: &Dispatcher, delivery: &Delivery) -> Option<DispatchOutcome> {
    match dispatcher.run(&delivery.task) {
        Ok(outcome) => {
            if let Err(e) = queue.ack(delivery) {
                error!(key = %delivery.task.key, error = %e, "failed to acknowledge task");
            }
            Some(outcome)
        }
        Err(e) => {
            error!(key = %delivery.task.key, error = %e, "job tracker unavailable, task left unacknowledged");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use vizcache_core::{CacheKey, ColumnType, EntityId, QueryKind, TableBuilder};

    use super::*;
    use crate::codec::Codec;
    use crate::jobs::queue::InMemoryTaskQueue;
    use crate::jobs::tracker::{InMemoryJobTracker, JobTracker};
    use crate::jobs::types::RetryPolicy;
    use crate::source::{ExecutionConfig, FnQuerySource};
    use crate::store::{InMemoryResultStore, ResultStore};

    fn pool() -> (Arc<InMemoryTaskQueue>, Arc<InMemoryJobTracker>, Arc<InMemoryResultStore>, WorkerPool) {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let tracker = Arc::new(InMemoryJobTracker::default());
        let store = Arc::new(InMemoryResultStore::new());
        let source = FnQuerySource::new(|_: &QueryKind, entity: &EntityId, _: &ExecutionConfig| {
            let mut builder = TableBuilder::new().column("repo", ColumnType::Text);
            builder.push_row(vec![entity.as_str().into()]).unwrap();
            Ok(builder.build().unwrap())
        });
        let dispatcher = Dispatcher::new(
            store.clone(),
            tracker.clone(),
            Arc::new(source),
            Codec::default(),
            RetryPolicy::immediate(0),
        );
        let pool = WorkerPool::new(queue.clone(), Arc::new(dispatcher));
        (queue, tracker, store, pool)
    }

    fn enqueue(queue: &InMemoryTaskQueue, tracker: &InMemoryJobTracker, entity: &str) -> CacheKey {
        let key = CacheKey::new(
            QueryKind::new("commits").unwrap(),
            EntityId::new(entity).unwrap(),
        );
        let job = tracker.register(&key, &ExecutionConfig::default()).unwrap().unwrap();
        queue.enqueue(&job.task()).unwrap();
        key
    }

    #[test]
    fn run_pending_drains_the_queue() {
        let (queue, tracker, store, pool) = pool();
        let a = enqueue(&queue, &tracker, "a");
        let b = enqueue(&queue, &tracker, "b");

        let outcomes = pool.run_pending().unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(store.exists(&a).unwrap());
        assert!(store.exists(&b).unwrap());
        assert_eq!(queue.pending().unwrap(), 0);
    }

    #[test]
    fn spawned_workers_process_and_shut_down() {
        let (queue, tracker, store, pool) = pool();
        let handle = pool
            .spawn(
                WorkerConfig::default()
                    .with_concurrency(2)
                    .with_name("test-pool"),
            )
            .unwrap();

        let keys: Vec<_> = (0..5)
            .map(|i| enqueue(&queue, &tracker, &format!("repo{i}")))
            .collect();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().tasks_processed < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        let stats = handle.stats();
        handle.shutdown();
        assert_eq!(stats.tasks_processed, 5);
        assert_eq!(stats.tasks_succeeded, 5);
        for key in keys {
            assert!(store.exists(&key).unwrap());
        }
    }

    #[test]
    fn stopping_the_pool_flag_ends_every_started_worker() {
        let (queue, _tracker, _store, pool) = pool();
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let joins: Vec<_> = (0..3)
            .map(|i| {
                let queue = queue.clone();
                let dispatcher = pool.dispatcher.clone();
                let stop = shutdown.clone();
                let stats = stats.clone();
                thread::spawn(move || {
                    let name = format!("idle-{i}");
                    worker_loop(&name, &*queue, &dispatcher, &stop, &stats, Duration::from_millis(10));
                })
            })
            .collect();

        let started = Instant::now();
        stop_workers(&shutdown, joins);
        assert!(shutdown.load(Ordering::SeqCst));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
