//! Job completion notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vizcache_core::{CacheKey, JobId};

use crate::bus::{EventBus, Subscription};

/// How a job settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    /// The result was written to the store.
    Succeeded,
    /// Retries were exhausted (or the failure was not retryable).
    Failed { error: String, attempts: u32 },
    /// The job's lease expired with nobody waiting; it stopped without writing.
    Abandoned,
}

/// Published by a worker when a job for `key` stops running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub key: CacheKey,
    pub job_id: JobId,
    pub generation: u64,
    #[serde(flatten)]
    pub outcome: JobOutcome,
    pub occurred_at: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(key: CacheKey, job_id: JobId, generation: u64, outcome: JobOutcome) -> Self {
        Self {
            key,
            job_id,
            generation,
            outcome,
            occurred_at: Utc::now(),
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, JobOutcome::Succeeded)
    }

    /// Serialize for transports that carry text (Redis pub/sub).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

/// Object-safe view of an [`EventBus`] carrying [`JobEvent`]s.
///
/// Workers and pollers hold `Arc<dyn CompletionBus>` so they do not need to
/// name the transport's error type. Publish failures are logged and dropped.
pub trait CompletionBus: Send + Sync {
    fn announce(&self, event: JobEvent);

    fn listen(&self) -> Subscription<JobEvent>;
}

impl<B> CompletionBus for B
where
    B: EventBus<JobEvent>,
{
    fn announce(&self, event: JobEvent) {
        if let Err(error) = self.publish(event.clone()) {
            tracing::warn!(
                key = %event.key,
                job_id = %event.job_id,
                error = ?error,
                "failed to publish job event"
            );
        }
    }

    fn listen(&self) -> Subscription<JobEvent> {
        self.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use vizcache_core::{EntityId, QueryKind};

    use crate::InMemoryEventBus;

    use super::*;

    #[test]
    fn json_carries_outcome_inline() {
        let key = CacheKey::new(
            QueryKind::new("commits").unwrap(),
            EntityId::new("repoA").unwrap(),
        );
        let event = JobEvent::new(
            key,
            JobId::new(),
            3,
            JobOutcome::Failed {
                error: "connection refused".into(),
                attempts: 6,
            },
        );

        let json = event.to_json().unwrap();
        assert!(json.contains("\"outcome\":\"failed\""));
        assert!(json.contains("\"attempts\":6"));

        let back = JobEvent::from_json(&json).unwrap();
        assert_eq!(back, event);
        assert!(!back.succeeded());
    }

    #[test]
    fn completion_bus_wraps_any_event_bus() {
        let bus: Arc<dyn CompletionBus> = Arc::new(InMemoryEventBus::<JobEvent>::new());
        let sub = bus.listen();
        let key = CacheKey::new(
            QueryKind::new("issues").unwrap(),
            EntityId::from(42_i64),
        );

        bus.announce(JobEvent::new(key.clone(), JobId::new(), 1, JobOutcome::Succeeded));

        let event = sub.recv_timeout(Duration::from_millis(50)).unwrap();
        assert_eq!(event.key, key);
        assert!(event.succeeded());
    }
}
