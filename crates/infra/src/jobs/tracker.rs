//! Job tracker: one job record per cache key.
//!
//! The tracker is the deduplication point. `register` is an atomic
//! check-and-set, so concurrent callers asking for the same missing key
//! produce exactly one job. Every record carries a time-to-live:
//!
//! - active records (queued, running, retrying) live for the *lease*, which
//!   waiting callers renew; a job nobody waits for expires and is abandoned
//! - terminal failures stay visible for `failure_retention`, then the key
//!   becomes eligible for a fresh attempt
//! - successful records are kept for `success_retention` for inspection

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vizcache_core::CacheKey;

use super::types::{Job, JobStatus};
use crate::source::ExecutionConfig;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TrackerError {
    /// The record changed hands (expired, cleared, or re-registered) since
    /// the caller read it.
    #[error("job record for {0} was superseded")]
    Superseded(CacheKey),
    #[error("job record is not valid: {0}")]
    Corrupt(String),
    #[error("tracker storage error: {0}")]
    Storage(String),
}

/// How long records of each kind are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerTimings {
    pub lease: Duration,
    pub failure_retention: Duration,
    pub success_retention: Duration,
}

impl Default for TrackerTimings {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(300),
            failure_retention: Duration::from_secs(600),
            success_retention: Duration::from_secs(600),
        }
    }
}

impl TrackerTimings {
    pub fn ttl_for(&self, status: &JobStatus) -> Duration {
        match status {
            JobStatus::FailedTerminal { .. } => self.failure_retention,
            JobStatus::Succeeded => self.success_retention,
            _ => self.lease,
        }
    }
}

pub trait JobTracker: Send + Sync {
    fn get(&self, key: &CacheKey) -> Result<Option<Job>, TrackerError>;

    fn status(&self, key: &CacheKey) -> Result<JobStatus, TrackerError> {
        Ok(self.get(key)?.map_or(JobStatus::Absent, |job| job.status))
    }

    /// Create a queued job for `key` unless one is active or a terminal
    /// failure is still being retained. Returns the new job, or `None` when
    /// another caller owns the key.
    fn register(&self, key: &CacheKey, config: &ExecutionConfig)
    -> Result<Option<Job>, TrackerError>;

    /// Overwrite the record with `job`, provided the stored record is still
    /// the same job. Refreshes the record's time-to-live for its new status.
    fn update(&self, job: &Job) -> Result<(), TrackerError>;

    /// Extend the lease of an active job. Returns `false` when there is no
    /// active job to extend.
    fn renew_lease(&self, key: &CacheKey) -> Result<bool, TrackerError>;

    /// Forget the record for `key` entirely.
    fn clear(&self, key: &CacheKey) -> Result<(), TrackerError>;
}

impl<T> JobTracker for Arc<T>
where
    T: JobTracker + ?Sized,
{
    fn get(&self, key: &CacheKey) -> Result<Option<Job>, TrackerError> {
        (**self).get(key)
    }

    fn status(&self, key: &CacheKey) -> Result<JobStatus, TrackerError> {
        (**self).status(key)
    }

    fn register(
        &self,
        key: &CacheKey,
        config: &ExecutionConfig,
    ) -> Result<Option<Job>, TrackerError> {
        (**self).register(key, config)
    }

    fn update(&self, job: &Job) -> Result<(), TrackerError> {
        (**self).update(job)
    }

    fn renew_lease(&self, key: &CacheKey) -> Result<bool, TrackerError> {
        (**self).renew_lease(key)
    }

    fn clear(&self, key: &CacheKey) -> Result<(), TrackerError> {
        (**self).clear(key)
    }
}

#[derive(Debug)]
struct Record {
    job: Job,
    expires_at: Instant,
}

/// Process-local tracker.
#[derive(Debug, Default)]
pub struct InMemoryJobTracker {
    records: Mutex<HashMap<CacheKey, Record>>,
    last_generation: AtomicU64,
    timings: TrackerTimings,
}

impl InMemoryJobTracker {
    pub fn new(timings: TrackerTimings) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            last_generation: AtomicU64::new(0),
            timings,
        }
    }

    pub fn timings(&self) -> &TrackerTimings {
        &self.timings
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<CacheKey, Record>>, TrackerError> {
        self.records
            .lock()
            .map_err(|_| TrackerError::Storage("lock poisoned".to_string()))
    }
}

fn live(records: &mut HashMap<CacheKey, Record>, key: &CacheKey, now: Instant) -> Option<Job> {
    if records.get(key).is_some_and(|r| r.expires_at <= now) {
        records.remove(key);
    }
    records.get(key).map(|r| r.job.clone())
}

impl JobTracker for InMemoryJobTracker {
    fn get(&self, key: &CacheKey) -> Result<Option<Job>, TrackerError> {
        let mut records = self.lock()?;
        Ok(live(&mut records, key, Instant::now()))
    }

    fn register(
        &self,
        key: &CacheKey,
        config: &ExecutionConfig,
    ) -> Result<Option<Job>, TrackerError> {
        let now = Instant::now();
        let mut records = self.lock()?;

        if let Some(existing) = live(&mut records, key, now) {
            if existing.status != JobStatus::Succeeded {
                return Ok(None);
            }
        }

        let generation = self.last_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let job = Job::new(key.clone(), config.clone(), generation);
        records.insert(
            key.clone(),
            Record {
                job: job.clone(),
                expires_at: now + self.timings.lease,
            },
        );
        Ok(Some(job))
    }

    fn update(&self, job: &Job) -> Result<(), TrackerError> {
        let now = Instant::now();
        let mut records = self.lock()?;

        match live(&mut records, &job.key, now) {
            Some(current) if current.id == job.id => {
                records.insert(
                    job.key.clone(),
                    Record {
                        job: job.clone(),
                        expires_at: now + self.timings.ttl_for(&job.status),
                    },
                );
                Ok(())
            }
            _ => Err(TrackerError::Superseded(job.key.clone())),
        }
    }

    fn renew_lease(&self, key: &CacheKey) -> Result<bool, TrackerError> {
        let now = Instant::now();
        let mut records = self.lock()?;
        live(&mut records, key, now);

        match records.get_mut(key) {
            Some(record) if record.job.status.is_active() => {
                record.expires_at = now + self.timings.lease;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn clear(&self, key: &CacheKey) -> Result<(), TrackerError> {
        self.lock()?.remove(key);
        Ok(())
    }
}
