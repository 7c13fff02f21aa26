//! Job records, task descriptors, and the retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use vizcache_core::{CacheKey, JobId};

use crate::source::ExecutionConfig;

/// Lifecycle of the job computing one cache key.
///
/// `Absent` is never stored; it is what the tracker reports when no record
/// exists (never registered, or the record expired).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Absent,
    /// Enqueued, not yet picked up by a worker.
    Queued,
    Running,
    /// The last attempt failed; another is scheduled after a backoff.
    FailedRetryable { error: String, attempt: u32 },
    Succeeded,
    /// Retries exhausted, or the failure cannot be retried.
    FailedTerminal { error: String, attempts: u32 },
}

impl JobStatus {
    /// A worker owns the job and may still write a result.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Queued | JobStatus::Running | JobStatus::FailedRetryable { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::FailedTerminal { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobStatus::Absent => "absent",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::FailedRetryable { .. } => "failed_retryable",
            JobStatus::Succeeded => "succeeded",
            JobStatus::FailedTerminal { .. } => "failed_terminal",
        }
    }
}

/// How the exponential backoff is randomized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// Use the computed delay as-is.
    None,
    /// Pick uniformly from `[0, delay]`.
    #[default]
    Full,
}

/// Retry policy for failed computations.
///
/// A job runs at most `max_retries + 1` times. Before retry `n` (1-indexed)
/// the worker waits `min(base_delay * 2^(n-1), max_delay)`, randomized by
/// `jitter`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Jitter,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(600),
            jitter: Jitter::Full,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Retries without waiting. Mostly useful in tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Jitter::None,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Un-jittered backoff before retry `retry` (1-indexed).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 2_u32.checked_pow(retry - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Backoff before retry `retry`, with jitter applied.
    pub fn delay_for_retry<R: Rng>(&self, retry: u32, rng: &mut R) -> Duration {
        let ceiling = self.backoff_for(retry);
        match self.jitter {
            Jitter::None => ceiling,
            Jitter::Full if ceiling.is_zero() => ceiling,
            Jitter::Full => {
                let millis = ceiling.as_millis().min(u128::from(u64::MAX)) as u64;
                Duration::from_millis(rng.gen_range(0..=millis))
            }
        }
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made <= self.max_retries
    }
}

/// The tracker's record of the job computing one cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub key: CacheKey,
    /// Orders results for the same key; a higher generation always wins.
    pub generation: u64,
    pub config: ExecutionConfig,
    pub status: JobStatus,
    /// Number of attempts started so far.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<JobAttemptRecord>,
}

/// Record of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl Job {
    pub fn new(key: CacheKey, config: ExecutionConfig, generation: u64) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            key,
            generation,
            config,
            status: JobStatus::Queued,
            attempt: 0,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    /// The message a worker receives for this job.
    pub fn task(&self) -> TaskDescriptor {
        TaskDescriptor {
            job_id: self.id,
            key: self.key.clone(),
            generation: self.generation,
            config: self.config.clone(),
            enqueued_at: Utc::now(),
        }
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.updated_at = Utc::now();
    }

    pub fn mark_succeeded(&mut self, started_at: DateTime<Utc>) {
        self.status = JobStatus::Succeeded;
        self.record_attempt(started_at, None);
    }

    /// The attempt failed and another one will follow.
    pub fn mark_retrying(&mut self, error: impl Into<String>, started_at: DateTime<Utc>) {
        let error = error.into();
        self.status = JobStatus::FailedRetryable {
            error: error.clone(),
            attempt: self.attempt,
        };
        self.record_attempt(started_at, Some(error));
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, started_at: DateTime<Utc>) {
        let error = error.into();
        self.status = JobStatus::FailedTerminal {
            error: error.clone(),
            attempts: self.attempt,
        };
        self.record_attempt(started_at, Some(error));
    }

    pub fn last_error(&self) -> Option<&str> {
        self.history.last().and_then(|r| r.error.as_deref())
    }

    fn record_attempt(&mut self, started_at: DateTime<Utc>, error: Option<String>) {
        let now = Utc::now();
        self.updated_at = now;
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: error.is_none(),
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }
}

/// Unit of work handed from the facade to a worker through the task queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub job_id: JobId,
    pub key: CacheKey,
    pub generation: u64,
    pub config: ExecutionConfig,
    pub enqueued_at: DateTime<Utc>,
}
