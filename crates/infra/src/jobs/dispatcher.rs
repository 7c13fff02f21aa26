//! Runs one task to completion: query, encode, store, with retries.
//!
//! The dispatcher owns a job for as long as the tracker record still names
//! it. Before every retry it re-reads the record; a record that expired
//! (nobody renewed the lease) or was replaced means the job is abandoned and
//! the dispatcher stops without writing anything.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use vizcache_events::{CompletionBus, JobEvent, JobOutcome};

use super::tracker::{JobTracker, TrackerError};
use super::types::{Job, RetryPolicy, TaskDescriptor};
use crate::codec::Codec;
use crate::source::QuerySource;
use crate::store::{PutOutcome, ResultStore};

/// How a task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The result is in the store. `stale` means a newer generation was
    /// already there, so this job's result was discarded.
    Succeeded { attempts: u32, stale: bool },
    Failed { attempts: u32, error: String },
    /// The lease lapsed between attempts.
    Abandoned { attempts: u32 },
    /// The task no longer matched the tracker record when it arrived
    /// (duplicate delivery, or the job was cleared).
    Skipped,
}

enum AttemptError {
    Retryable(String),
    Permanent(String),
}

pub struct Dispatcher {
    store: Arc<dyn ResultStore>,
    tracker: Arc<dyn JobTracker>,
    source: Arc<dyn QuerySource>,
    codec: Codec,
    retry: RetryPolicy,
    events: Option<Arc<dyn CompletionBus>>,
    sleep: fn(Duration),
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("codec", &self.codec)
            .field("retry", &self.retry)
            .field("events", &self.events.is_some())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ResultStore>,
        tracker: Arc<dyn JobTracker>,
        source: Arc<dyn QuerySource>,
        codec: Codec,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            tracker,
            source,
            codec,
            retry,
            events: None,
            sleep: thread::sleep,
        }
    }

    /// Announce completions on `bus` so waiting callers wake immediately.
    pub fn with_events(mut self, bus: Arc<dyn CompletionBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Execute `task`. Errors are tracker failures only; query and store
    /// failures are absorbed into retries and reported in the outcome.
    #[instrument(skip_all, fields(key = %task.key, job_id = %task.job_id, generation = task.generation))]
    pub fn run(&self, task: &TaskDescriptor) -> Result<DispatchOutcome, TrackerError> {
        let Some(mut job) = self.owned_job(task)? else {
            debug!("task does not match the current job record, skipping");
            return Ok(DispatchOutcome::Skipped);
        };

        let mut rng = rand::thread_rng();
        loop {
            job.mark_running();
            if !self.save(&job)? {
                return Ok(self.abandon(&job));
            }

            let started = Utc::now();
            match self.attempt(&job) {
                Ok(put) => {
                    job.mark_succeeded(started);
                    // The result is already stored; losing the record update
                    // only affects inspection.
                    if !self.save(&job)? {
                        debug!("record superseded after the result was written");
                    }
                    let stale = !put.is_written();
                    info!(attempts = job.attempt, stale, "job succeeded");
                    self.announce(&job, JobOutcome::Succeeded);
                    return Ok(DispatchOutcome::Succeeded {
                        attempts: job.attempt,
                        stale,
                    });
                }
                Err(AttemptError::Retryable(error)) if self.retry.should_retry(job.attempt) => {
                    let delay = self.retry.delay_for_retry(job.attempt, &mut rng);
                    warn!(
                        attempt = job.attempt,
                        max_attempts = self.retry.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "attempt failed, retrying"
                    );
                    job.mark_retrying(error, started);
                    if !self.save(&job)? {
                        return Ok(self.abandon(&job));
                    }

                    (self.sleep)(delay);

                    match self.owned_job(task)? {
                        Some(current) => job = current,
                        None => return Ok(self.abandon(&job)),
                    }
                }
                Err(AttemptError::Retryable(error)) | Err(AttemptError::Permanent(error)) => {
                    warn!(attempts = job.attempt, error = %error, "job failed");
                    job.mark_failed(error.clone(), started);
                    if !self.save(&job)? {
                        return Ok(self.abandon(&job));
                    }
                    self.announce(
                        &job,
                        JobOutcome::Failed {
                            error: error.clone(),
                            attempts: job.attempt,
                        },
                    );
                    return Ok(DispatchOutcome::Failed {
                        attempts: job.attempt,
                        error,
                    });
                }
            }
        }
    }

    fn attempt(&self, job: &Job) -> Result<PutOutcome, AttemptError> {
        let table = self
            .source
            .run(job.key.query_kind(), job.key.entity_id(), &job.config)
            .map_err(|e| {
                if e.is_retryable() {
                    AttemptError::Retryable(e.to_string())
                } else {
                    AttemptError::Permanent(e.to_string())
                }
            })?;

        let payload = self
            .codec
            .encode(&table)
            .map_err(|e| AttemptError::Permanent(e.to_string()))?;

        debug!(rows = table.row_count(), bytes = payload.len(), "storing result");
        self.store
            .put(&job.key, job.generation, &payload)
            .map_err(|e| AttemptError::Retryable(e.to_string()))
    }

    /// The tracker's record for the task's key, if it is still this task's
    /// job and still active.
    fn owned_job(&self, task: &TaskDescriptor) -> Result<Option<Job>, TrackerError> {
        Ok(self
            .tracker
            .get(&task.key)?
            .filter(|job| job.id == task.job_id && job.status.is_active()))
    }

    /// Persist `job`; `false` when the record no longer belongs to it.
    fn save(&self, job: &Job) -> Result<bool, TrackerError> {
        match self.tracker.update(job) {
            Ok(()) => Ok(true),
            Err(TrackerError::Superseded(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn abandon(&self, job: &Job) -> DispatchOutcome {
        info!(attempts = job.attempt, "lease lapsed, abandoning job");
        self.announce(job, JobOutcome::Abandoned);
        DispatchOutcome::Abandoned {
            attempts: job.attempt,
        }
    }

    fn announce(&self, job: &Job, outcome: JobOutcome) {
        if let Some(bus) = &self.events {
            bus.announce(JobEvent::new(job.key.clone(), job.id, job.generation, outcome));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use vizcache_core::{CacheKey, ColumnType, EntityId, QueryKind, Table, TableBuilder};
    use vizcache_events::InMemoryEventBus;

    use super::*;
    use crate::jobs::tracker::{InMemoryJobTracker, TrackerTimings};
    use crate::jobs::types::JobStatus;
    use crate::source::{ExecutionConfig, FnQuerySource, QuerySourceError};
    use crate::store::InMemoryResultStore;

    fn key() -> CacheKey {
        CacheKey::new(
            QueryKind::new("commits").unwrap(),
            EntityId::new("repoA").unwrap(),
        )
    }

    fn one_row() -> Table {
        let mut builder = TableBuilder::new().column("commit_hash", ColumnType::Text);
        builder.push_row(vec!["abc123".into()]).unwrap();
        builder.build().unwrap()
    }

    struct Fixture {
        store: Arc<InMemoryResultStore>,
        tracker: Arc<InMemoryJobTracker>,
        calls: Arc<AtomicU32>,
    }

    /// Source that fails `failures` times before returning a row.
    fn fixture(
        failures: u32,
        timings: TrackerTimings,
        retry: RetryPolicy,
        sleep: fn(Duration),
    ) -> (Fixture, Dispatcher) {
        let store = Arc::new(InMemoryResultStore::new());
        let tracker = Arc::new(InMemoryJobTracker::new(timings));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let source = FnQuerySource::new(move |_: &QueryKind, _: &EntityId, _: &ExecutionConfig| {
            if counter.fetch_add(1, Ordering::SeqCst) < failures {
                Err(QuerySourceError::Connectivity("connection refused".into()))
            } else {
                Ok(one_row())
            }
        });
        let mut dispatcher = Dispatcher::new(
            store.clone(),
            tracker.clone(),
            Arc::new(source),
            Codec::default(),
            retry,
        );
        dispatcher.sleep = sleep;
        (
            Fixture {
                store,
                tracker,
                calls,
            },
            dispatcher,
        )
    }

    fn register(tracker: &InMemoryJobTracker) -> TaskDescriptor {
        tracker
            .register(&key(), &ExecutionConfig::default())
            .unwrap()
            .unwrap()
            .task()
    }

    fn no_sleep(_: Duration) {}

    #[test]
    fn succeeds_after_transient_failures() {
        let (fx, dispatcher) = fixture(2, TrackerTimings::default(), RetryPolicy::immediate(5), no_sleep);
        let task = register(&fx.tracker);

        let outcome = dispatcher.run(&task).unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Succeeded {
                attempts: 3,
                stale: false
            }
        );
        assert_eq!(fx.calls.load(Ordering::SeqCst), 3);
        assert!(fx.store.exists(&key()).unwrap());

        let job = fx.tracker.get(&key()).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.history.len(), 3);
    }

    #[test]
    fn gives_up_after_max_retries() {
        let (fx, dispatcher) = fixture(u32::MAX, TrackerTimings::default(), RetryPolicy::immediate(3), no_sleep);
        let bus = Arc::new(InMemoryEventBus::<JobEvent>::new());
        let sub = bus.listen();
        let dispatcher = dispatcher.with_events(bus.clone());
        let task = register(&fx.tracker);

        let outcome = dispatcher.run(&task).unwrap();
        assert!(matches!(outcome, DispatchOutcome::Failed { attempts: 4, .. }));
        assert_eq!(fx.calls.load(Ordering::SeqCst), 4);
        assert!(!fx.store.exists(&key()).unwrap());
        assert!(matches!(
            fx.tracker.status(&key()).unwrap(),
            JobStatus::FailedTerminal { attempts: 4, .. }
        ));

        let events = sub.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].outcome, JobOutcome::Failed { attempts: 4, .. }));
    }

    #[test]
    fn unknown_query_kind_is_not_retried() {
        let store = Arc::new(InMemoryResultStore::new());
        let tracker = Arc::new(InMemoryJobTracker::default());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let source = FnQuerySource::new(move |kind: &QueryKind, _: &EntityId, _: &ExecutionConfig| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(QuerySourceError::UnknownQueryKind(kind.clone()))
        });
        let dispatcher = Dispatcher::new(
            store,
            tracker.clone(),
            Arc::new(source),
            Codec::default(),
            RetryPolicy::immediate(5),
        );

        let outcome = dispatcher.run(&register(&tracker)).unwrap();
        assert!(matches!(outcome, DispatchOutcome::Failed { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn abandons_when_lease_lapses_during_backoff() {
        fn slow_sleep(_: Duration) {
            thread::sleep(Duration::from_millis(80));
        }
        let timings = TrackerTimings {
            lease: Duration::from_millis(30),
            ..TrackerTimings::default()
        };
        let (fx, dispatcher) = fixture(u32::MAX, timings, RetryPolicy::immediate(5), slow_sleep);
        let task = register(&fx.tracker);

        let outcome = dispatcher.run(&task).unwrap();
        assert_eq!(outcome, DispatchOutcome::Abandoned { attempts: 1 });
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.tracker.status(&key()).unwrap(), JobStatus::Absent);
    }

    #[test]
    fn duplicate_delivery_is_skipped() {
        let (fx, dispatcher) = fixture(0, TrackerTimings::default(), RetryPolicy::immediate(0), no_sleep);
        let task = register(&fx.tracker);

        assert!(matches!(dispatcher.run(&task).unwrap(), DispatchOutcome::Succeeded { .. }));
        assert_eq!(dispatcher.run(&task).unwrap(), DispatchOutcome::Skipped);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn older_generation_never_overwrites() {
        let (fx, dispatcher) = fixture(0, TrackerTimings::default(), RetryPolicy::immediate(0), no_sleep);
        let task = register(&fx.tracker);
        fx.store.put(&key(), task.generation + 10, b"newer").unwrap();

        let outcome = dispatcher.run(&task).unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Succeeded {
                attempts: 1,
                stale: true
            }
        );
        assert_eq!(fx.store.get(&key()).unwrap().unwrap().payload, b"newer");
    }
}
