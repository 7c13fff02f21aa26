//! Caller-side wait loop on top of the [`CacheFacade`].
//!
//! The poller subscribes to completion events before its first readiness
//! check, then sleeps until an event for one of its pending entities arrives
//! or the poll interval elapses, whichever is first. Without a bus it falls
//! back to plain interval polling. Every wait is bounded by `max_wait`.

use std::sync::Arc;
use std::sync::mpsc::RecvTimeoutError;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, instrument};

use vizcache_core::{EntityId, Table};
use vizcache_events::{CompletionBus, JobEvent, Subscription};

use crate::facade::{CacheError, CacheFacade, PartialResult, QuerySpec};

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Upper bound on one sleep between readiness checks.
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_wait: Duration::from_secs(1800),
        }
    }
}

pub struct ReadinessPoller {
    facade: Arc<CacheFacade>,
    config: PollerConfig,
    events: Option<Arc<dyn CompletionBus>>,
}

struct Deadline {
    started: Instant,
    at: Instant,
}

impl ReadinessPoller {
    pub fn new(facade: Arc<CacheFacade>, config: PollerConfig) -> Self {
        Self {
            facade,
            config,
            events: None,
        }
    }

    /// Wake on completion events instead of sleeping the full interval.
    pub fn with_events(mut self, bus: Arc<dyn CompletionBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Block until every entity of `spec` is cached, then return the
    /// combined table. Fails fast on the first terminally failed entity.
    #[instrument(skip_all, fields(query_kind = %spec.query_kind(), entities = spec.entities().len()))]
    pub fn wait(&self, spec: &QuerySpec) -> Result<Table, CacheError> {
        let subscription = self.events.as_ref().map(|bus| bus.listen());
        let deadline = self.deadline();

        loop {
            let readiness = self.facade.status(spec)?;
            if let Some((entity, reason)) = readiness.failed.into_iter().next() {
                return Err(CacheError::ComputationFailed { entity, reason });
            }

            let pending = if readiness.pending.is_empty() {
                match self.facade.retrieve(spec) {
                    Ok(table) => {
                        debug!(waited_ms = deadline.started.elapsed().as_millis() as u64, "results ready");
                        return Ok(table);
                    }
                    // An entry was evicted between the check and the read.
                    Err(CacheError::NotReady { missing }) => missing,
                    Err(e) => return Err(e),
                }
            } else {
                readiness.pending
            };

            self.pause(spec, &pending, subscription.as_ref(), &deadline)?;
        }
    }

    /// Block until nothing is computing any more, then return whatever
    /// succeeded together with the failed entities.
    #[instrument(skip_all, fields(query_kind = %spec.query_kind(), entities = spec.entities().len()))]
    pub fn wait_settled(&self, spec: &QuerySpec) -> Result<PartialResult, CacheError> {
        let subscription = self.events.as_ref().map(|bus| bus.listen());
        let deadline = self.deadline();

        loop {
            let partial = self.facade.retrieve_available(spec)?;
            if partial.pending.is_empty() {
                return Ok(partial);
            }
            self.pause(spec, &partial.pending, subscription.as_ref(), &deadline)?;
        }
    }

    /// [`wait`](Self::wait) on the tokio blocking pool.
    pub async fn wait_async(self: Arc<Self>, spec: QuerySpec) -> Result<Table, CacheError> {
        tokio::task::spawn_blocking(move || self.wait(&spec))
            .await
            .map_err(|e| CacheError::Interrupted(e.to_string()))?
    }

    fn deadline(&self) -> Deadline {
        let started = Instant::now();
        Deadline {
            started,
            at: started + self.config.max_wait,
        }
    }

    fn pause(
        &self,
        spec: &QuerySpec,
        pending: &[EntityId],
        subscription: Option<&Subscription<JobEvent>>,
        deadline: &Deadline,
    ) -> Result<(), CacheError> {
        let now = Instant::now();
        if now >= deadline.at {
            return Err(CacheError::WaitTimedOut {
                pending: pending.to_vec(),
                waited: deadline.started.elapsed(),
            });
        }
        let until = now + self.config.poll_interval.min(deadline.at - now);

        let Some(subscription) = subscription else {
            thread::sleep(until - now);
            return Ok(());
        };

        loop {
            let left = until.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(());
            }
            match subscription.recv_timeout(left) {
                Ok(event) if concerns(spec, pending, &event) => {
                    debug!(key = %event.key, job_id = %event.job_id, "woken by job event");
                    return Ok(());
                }
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => return Ok(()),
                Err(RecvTimeoutError::Disconnected) => {
                    thread::sleep(left);
                    return Ok(());
                }
            }
        }
    }
}

fn concerns(spec: &QuerySpec, pending: &[EntityId], event: &JobEvent) -> bool {
    event.key.query_kind() == spec.query_kind() && pending.contains(event.key.entity_id())
}
