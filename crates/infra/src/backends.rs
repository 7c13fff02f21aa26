//! Wiring: the shared store, tracker, queue and event bus a deployment uses,
//! and the facade/poller/dispatcher built on top of them.

use std::sync::Arc;

use vizcache_events::{CompletionBus, InMemoryEventBus, JobEvent};

use crate::codec::Codec;
use crate::config::CacheConfig;
use crate::facade::CacheFacade;
use crate::jobs::{Dispatcher, InMemoryJobTracker, InMemoryTaskQueue, JobTracker, TaskQueue};
use crate::poller::ReadinessPoller;
use crate::source::QuerySource;
use crate::store::{InMemoryResultStore, ResultStore};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
    #[error(transparent)]
    Tracker(#[from] crate::jobs::TrackerError),
    #[error(transparent)]
    Queue(#[from] crate::jobs::QueueError),
    #[cfg(feature = "redis")]
    #[error(transparent)]
    Events(#[from] crate::event_bus::RedisBusError),
}

#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn ResultStore>,
    pub tracker: Arc<dyn JobTracker>,
    pub queue: Arc<dyn TaskQueue>,
    pub events: Arc<dyn CompletionBus>,
    pub codec: Codec,
    config: CacheConfig,
}

impl Backends {
    /// Single-process wiring for tests and local development.
    pub fn in_memory(config: &CacheConfig) -> Self {
        Self {
            store: Arc::new(InMemoryResultStore::with_ttl(config.result_ttl)),
            tracker: Arc::new(InMemoryJobTracker::new(config.timings.clone())),
            queue: Arc::new(InMemoryTaskQueue::new()),
            events: Arc::new(InMemoryEventBus::<JobEvent>::new()),
            codec: Codec::new(config.codec.clone()),
            config: config.clone(),
        }
    }

    /// Shared Redis wiring. The queue's processing list is named after
    /// `config.worker.name`.
    #[cfg(feature = "redis")]
    pub fn redis(config: &CacheConfig) -> Result<Self, BackendError> {
        use crate::event_bus::RedisCompletionBus;
        use crate::jobs::{RedisJobTracker, RedisTaskQueue};
        use crate::store::RedisResultStore;

        let url = &config.redis_url;
        let namespace = &config.namespace;
        tracing::info!(namespace = %namespace, consumer = %config.worker.name, "using redis backends");

        Ok(Self {
            store: Arc::new(RedisResultStore::new(url, namespace.clone(), config.result_ttl)?),
            tracker: Arc::new(RedisJobTracker::new(url, namespace.clone(), config.timings.clone())?),
            queue: Arc::new(RedisTaskQueue::new(url, namespace, &config.worker.name)?),
            events: Arc::new(RedisCompletionBus::new(url, namespace)?),
            codec: Codec::new(config.codec.clone()),
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn facade(&self) -> CacheFacade {
        CacheFacade::new(
            self.store.clone(),
            self.tracker.clone(),
            self.queue.clone(),
            self.codec.clone(),
        )
    }

    pub fn poller(&self) -> ReadinessPoller {
        ReadinessPoller::new(Arc::new(self.facade()), self.config.poller.clone())
            .with_events(self.events.clone())
    }

    /// Worker-side unit that computes results with `source`.
    pub fn dispatcher(&self, source: Arc<dyn QuerySource>) -> Dispatcher {
        Dispatcher::new(
            self.store.clone(),
            self.tracker.clone(),
            source,
            self.codec.clone(),
            self.config.retry.clone(),
        )
        .with_events(self.events.clone())
    }
}
