//! Background computation of cache entries.
//!
//! ## Components
//!
//! - [`JobTracker`]: one record per cache key; deduplicates dispatch and
//!   carries the lease that keeps a job alive while someone waits for it
//! - [`TaskQueue`]: at-least-once hand-off from callers to workers
//! - [`Dispatcher`]: runs a task with retry and exponential backoff
//! - [`WorkerPool`]: threads pulling from the queue into the dispatcher

pub mod dispatcher;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis_backend;
pub mod tracker;
pub mod types;
pub mod worker;

pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use queue::{Delivery, InMemoryTaskQueue, QueueError, TaskQueue};
#[cfg(feature = "redis")]
pub use redis_backend::{RedisJobTracker, RedisTaskQueue};
pub use tracker::{InMemoryJobTracker, JobTracker, TrackerError, TrackerTimings};
pub use types::{Jitter, Job, JobAttemptRecord, JobStatus, RetryPolicy, TaskDescriptor};
pub use worker::{WorkerConfig, WorkerPool, WorkerPoolHandle, WorkerStats};
