//! Cache facade: the only entry point chart code uses.
//!
//! Callers describe what they want as a [`QuerySpec`] (one query kind over a
//! set of entities). The facade answers per entity from the result store,
//! and for every entity with neither a result nor an active job it registers
//! a job and enqueues it. Registration goes through the tracker's atomic
//! check-and-set, so concurrent callers never dispatch the same key twice.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use vizcache_core::{CacheKey, CoreError, EntityId, QueryKind, Table};

use crate::codec::Codec;
use crate::jobs::{JobStatus, JobTracker, QueueError, TaskQueue, TrackerError};
use crate::source::ExecutionConfig;
use crate::store::{ResultStore, StoreError};

/// Column added to combined results to record which entity a row came from.
pub const DEFAULT_ORIGIN_COLUMN: &str = "entity_id";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("results not ready for {missing:?}")]
    NotReady { missing: Vec<EntityId> },

    #[error("computation failed for `{entity}`: {reason}")]
    ComputationFailed { entity: EntityId, reason: String },

    #[error("gave up after {waited:?} waiting for {pending:?}")]
    WaitTimedOut {
        pending: Vec<EntityId>,
        waited: Duration,
    },

    #[error("cached results cannot be combined: {0}")]
    Assembly(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("wait was interrupted: {0}")]
    Interrupted(String),
}

/// A query kind over an ordered, de-duplicated set of entities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpec {
    query_kind: QueryKind,
    entities: Vec<EntityId>,
    config: ExecutionConfig,
    origin_column: Option<String>,
}

impl QuerySpec {
    /// Entities keep their first-seen order; repeats are dropped.
    pub fn new(query_kind: QueryKind, entities: impl IntoIterator<Item = EntityId>) -> Self {
        let mut seen = BTreeSet::new();
        let entities = entities
            .into_iter()
            .filter(|e| seen.insert(e.clone()))
            .collect();
        Self {
            query_kind,
            entities,
            config: ExecutionConfig::default(),
            origin_column: Some(DEFAULT_ORIGIN_COLUMN.to_string()),
        }
    }

    pub fn with_config(mut self, config: ExecutionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_origin_column(mut self, column: impl Into<String>) -> Self {
        self.origin_column = Some(column.into());
        self
    }

    /// Combine per-entity tables without adding an origin column.
    pub fn without_origin_column(mut self) -> Self {
        self.origin_column = None;
        self
    }

    pub fn query_kind(&self) -> &QueryKind {
        &self.query_kind
    }

    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn origin_column(&self) -> Option<&str> {
        self.origin_column.as_deref()
    }

    pub fn key_for(&self, entity: &EntityId) -> CacheKey {
        CacheKey::new(self.query_kind.clone(), entity.clone())
    }
}

/// Per-entity state of a [`QuerySpec`], each list in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readiness {
    pub ready: Vec<EntityId>,
    pub pending: Vec<EntityId>,
    /// Entities whose job failed terminally, with the reason.
    pub failed: Vec<(EntityId, String)>,
}

impl Readiness {
    /// Every entity has a result.
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty() && self.failed.is_empty()
    }

    /// Nothing is still computing (some entities may have failed).
    pub fn is_settled(&self) -> bool {
        self.pending.is_empty()
    }

    /// Entities without a result, pending or failed.
    pub fn unsatisfied(&self) -> BTreeSet<EntityId> {
        self.pending
            .iter()
            .cloned()
            .chain(self.failed.iter().map(|(e, _)| e.clone()))
            .collect()
    }
}

/// Combined table of the entities that are ready, plus what is missing.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialResult {
    pub table: Table,
    pub pending: Vec<EntityId>,
    pub failed: Vec<(EntityId, String)>,
}

impl PartialResult {
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty() && self.failed.is_empty()
    }
}

enum EntityState {
    Ready,
    Pending,
    Failed(String),
}

fn describe_failure(error: &str, attempts: u32) -> String {
    format!("{error} (after {attempts} attempts)")
}

pub struct CacheFacade {
    store: Arc<dyn ResultStore>,
    tracker: Arc<dyn JobTracker>,
    queue: Arc<dyn TaskQueue>,
    codec: Codec,
}

impl std::fmt::Debug for CacheFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFacade")
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}

impl CacheFacade {
    pub fn new(
        store: Arc<dyn ResultStore>,
        tracker: Arc<dyn JobTracker>,
        queue: Arc<dyn TaskQueue>,
        codec: Codec,
    ) -> Self {
        Self {
            store,
            tracker,
            queue,
            codec,
        }
    }

    /// Entities of `spec` that do not have a result yet. Dispatches work for
    /// every one of them that has no active job. Empty means all ready.
    pub fn get_uncached(&self, spec: &QuerySpec) -> Result<BTreeSet<EntityId>, CacheError> {
        Ok(self.status(spec)?.unsatisfied())
    }

    /// Like [`get_uncached`](Self::get_uncached), but reports ready, pending
    /// and failed entities separately.
    #[instrument(skip_all, fields(query_kind = %spec.query_kind(), entities = spec.entities().len()))]
    pub fn status(&self, spec: &QuerySpec) -> Result<Readiness, CacheError> {
        let mut readiness = Readiness::default();
        for entity in spec.entities() {
            match self.ensure(&spec.key_for(entity), spec.config())? {
                EntityState::Ready => readiness.ready.push(entity.clone()),
                EntityState::Pending => readiness.pending.push(entity.clone()),
                EntityState::Failed(reason) => readiness.failed.push((entity.clone(), reason)),
            }
        }
        debug!(
            ready = readiness.ready.len(),
            pending = readiness.pending.len(),
            failed = readiness.failed.len(),
            "checked readiness"
        );
        Ok(readiness)
    }

    /// The combined table for every entity of `spec`, rows in entity order.
    ///
    /// Fails with `ComputationFailed` if a missing entity's job failed
    /// terminally and `NotReady` if any other entity has no result yet.
    #[instrument(skip_all, fields(query_kind = %spec.query_kind(), entities = spec.entities().len()))]
    pub fn retrieve(&self, spec: &QuerySpec) -> Result<Table, CacheError> {
        let mut tables = Vec::with_capacity(spec.entities().len());
        let mut missing = Vec::new();
        for entity in spec.entities() {
            match self.load(&spec.key_for(entity), spec.config())? {
                Some(table) => tables.push((entity.clone(), table)),
                None => missing.push(entity.clone()),
            }
        }

        if !missing.is_empty() {
            for entity in &missing {
                if let JobStatus::FailedTerminal { error, attempts } =
                    self.tracker.status(&spec.key_for(entity))?
                {
                    return Err(CacheError::ComputationFailed {
                        entity: entity.clone(),
                        reason: describe_failure(&error, attempts),
                    });
                }
            }
            return Err(CacheError::NotReady { missing });
        }

        assemble(spec, tables)
    }

    /// Combined table of whatever is ready now, with the pending and failed
    /// entities listed. Dispatches work for missing entities like
    /// [`status`](Self::status).
    pub fn retrieve_available(&self, spec: &QuerySpec) -> Result<PartialResult, CacheError> {
        let readiness = self.status(spec)?;
        let mut tables = Vec::with_capacity(readiness.ready.len());
        let mut pending = Vec::new();

        for entity in spec.entities() {
            if readiness.failed.iter().any(|(e, _)| e == entity) {
                continue;
            }
            if readiness.ready.contains(entity) {
                if let Some(table) = self.load(&spec.key_for(entity), spec.config())? {
                    tables.push((entity.clone(), table));
                    continue;
                }
            }
            pending.push(entity.clone());
        }

        Ok(PartialResult {
            table: assemble(spec, tables)?,
            pending,
            failed: readiness.failed,
        })
    }

    /// Drop cached results and job records for every entity of `spec`, so
    /// the next request recomputes them. Returns how many entries existed.
    pub fn invalidate(&self, spec: &QuerySpec) -> Result<usize, CacheError> {
        let mut removed = 0;
        for entity in spec.entities() {
            let key = spec.key_for(entity);
            if self.store.delete(&key)? {
                removed += 1;
            }
            self.tracker.clear(&key)?;
        }
        info!(query_kind = %spec.query_kind(), removed, "invalidated cached results");
        Ok(removed)
    }

    fn ensure(&self, key: &CacheKey, config: &ExecutionConfig) -> Result<EntityState, CacheError> {
        if self.store.exists(key)? {
            return Ok(EntityState::Ready);
        }

        match self.tracker.status(key)? {
            JobStatus::FailedTerminal { error, attempts } => {
                Ok(EntityState::Failed(describe_failure(&error, attempts)))
            }
            status if status.is_active() => {
                self.tracker.renew_lease(key)?;
                Ok(EntityState::Pending)
            }
            // The worker may have finished between the two checks.
            JobStatus::Succeeded if self.store.exists(key)? => Ok(EntityState::Ready),
            _ => self.dispatch(key, config),
        }
    }

    fn dispatch(&self, key: &CacheKey, config: &ExecutionConfig) -> Result<EntityState, CacheError> {
        let Some(job) = self.tracker.register(key, config)? else {
            debug!(%key, "job already registered by another caller");
            return Ok(match self.tracker.status(key)? {
                JobStatus::FailedTerminal { error, attempts } => {
                    EntityState::Failed(describe_failure(&error, attempts))
                }
                _ => EntityState::Pending,
            });
        };

        if let Err(e) = self.queue.enqueue(&job.task()) {
            // Release the key so a later request can dispatch again.
            if let Err(clear) = self.tracker.clear(key) {
                warn!(%key, error = %clear, "failed to release job record after enqueue failure");
            }
            return Err(e.into());
        }

        info!(%key, job_id = %job.id, generation = job.generation, "dispatched job");
        Ok(EntityState::Pending)
    }

    /// Read and decode one entry. An undecodable entry is evicted and its
    /// computation dispatched again; the caller sees a miss.
    fn load(&self, key: &CacheKey, config: &ExecutionConfig) -> Result<Option<Table>, CacheError> {
        let Some(entry) = self.store.get(key)? else {
            return Ok(None);
        };
        match self.codec.decode(&entry.payload) {
            Ok(table) => Ok(Some(table)),
            Err(e) => {
                warn!(%key, generation = entry.generation, error = %e, "evicting corrupt cache entry");
                self.store.delete(key)?;
                self.dispatch(key, config)?;
                Ok(None)
            }
        }
    }
}

fn assemble(spec: &QuerySpec, tables: Vec<(EntityId, Table)>) -> Result<Table, CacheError> {
    let tagged = tables
        .into_iter()
        .map(|(entity, table)| match spec.origin_column() {
            Some(column)
                if table.column(column).is_none()
                    && !(table.column_count() == 0 && table.row_count() == 0) =>
            {
                table.with_origin(column, entity.as_str())
            }
            _ => Ok(table),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Table::concat(tagged)?)
}

#[cfg(test)]
mod tests {
    use vizcache_core::{ColumnType, TableBuilder, Value};

    use super::*;
    use crate::jobs::{InMemoryJobTracker, InMemoryTaskQueue, TaskDescriptor};
    use crate::store::InMemoryResultStore;

    struct Harness {
        store: Arc<InMemoryResultStore>,
        tracker: Arc<InMemoryJobTracker>,
        queue: Arc<InMemoryTaskQueue>,
        facade: CacheFacade,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryResultStore::new());
        let tracker = Arc::new(InMemoryJobTracker::default());
        let queue = Arc::new(InMemoryTaskQueue::new());
        let facade = CacheFacade::new(store.clone(), tracker.clone(), queue.clone(), Codec::default());
        Harness {
            store,
            tracker,
            queue,
            facade,
        }
    }

    fn spec(entities: &[&str]) -> QuerySpec {
        QuerySpec::new(
            QueryKind::new("commits").unwrap(),
            entities.iter().map(|e| EntityId::new(*e).unwrap()),
        )
    }

    fn entity(name: &str) -> EntityId {
        EntityId::new(name).unwrap()
    }

    fn commits(hashes: &[&str]) -> Table {
        let mut builder = TableBuilder::new().column("commit_hash", ColumnType::Text);
        for h in hashes {
            builder.push_row(vec![(*h).into()]).unwrap();
        }
        builder.build().unwrap()
    }

    /// Store a result the way a worker would.
    fn complete(h: &Harness, spec: &QuerySpec, name: &str, table: &Table) {
        let key = spec.key_for(&entity(name));
        let generation = h.tracker.get(&key).unwrap().map_or(1, |j| j.generation);
        let bytes = Codec::default().encode(table).unwrap();
        h.store.put(&key, generation, &bytes).unwrap();
    }

    #[test]
    fn query_spec_dedupes_in_order() {
        let spec = spec(&["b", "a", "b", "c", "a"]);
        let names: Vec<_> = spec.entities().iter().map(EntityId::as_str).collect();
        assert_eq!(names, ["b", "a", "c"]);
        assert_eq!(spec.origin_column(), Some(DEFAULT_ORIGIN_COLUMN));
    }

    #[test]
    fn cold_keys_are_dispatched_once() {
        let h = harness();
        let spec = spec(&["repoA", "repoB"]);

        let uncached = h.facade.get_uncached(&spec).unwrap();
        assert_eq!(uncached, BTreeSet::from([entity("repoA"), entity("repoB")]));
        assert_eq!(h.queue.enqueued_total(), 2);

        h.facade.get_uncached(&spec).unwrap();
        h.facade.get_uncached(&spec).unwrap();
        assert_eq!(h.queue.enqueued_total(), 2);
    }

    #[test]
    fn partial_set_reports_only_the_missing_entity() {
        let h = harness();
        let spec = spec(&["A", "B"]);
        h.facade.get_uncached(&spec).unwrap();
        complete(&h, &spec, "A", &commits(&["a1"]));

        assert_eq!(h.facade.get_uncached(&spec).unwrap(), BTreeSet::from([entity("B")]));
        match h.facade.retrieve(&spec) {
            Err(CacheError::NotReady { missing }) => assert_eq!(missing, vec![entity("B")]),
            other => panic!("expected NotReady, got {other:?}"),
        }

        let partial = h.facade.retrieve_available(&spec).unwrap();
        assert_eq!(partial.table.row_count(), 1);
        assert_eq!(partial.pending, vec![entity("B")]);
        assert!(!partial.is_complete());
    }

    #[test]
    fn retrieve_tags_rows_with_their_origin() {
        let h = harness();
        let spec = spec(&["repoA", "repoB"]);
        h.facade.get_uncached(&spec).unwrap();
        complete(&h, &spec, "repoA", &commits(&["a1", "a2"]));
        complete(&h, &spec, "repoB", &commits(&["b1"]));

        assert!(h.facade.get_uncached(&spec).unwrap().is_empty());
        let table = h.facade.retrieve(&spec).unwrap();
        assert_eq!(table.row_count(), 3);
        assert_eq!(table.value(0, "entity_id"), Some(Value::from("repoA")));
        assert_eq!(table.value(2, "entity_id"), Some(Value::from("repoB")));
        assert_eq!(table.value(2, "commit_hash"), Some(Value::from("b1")));
    }

    #[test]
    fn existing_origin_column_is_left_alone() {
        let h = harness();
        let spec = spec(&["7"]).with_origin_column("commit_hash");
        h.facade.get_uncached(&spec).unwrap();
        complete(&h, &spec, "7", &commits(&["x"]));

        let table = h.facade.retrieve(&spec).unwrap();
        assert_eq!(table.column_count(), 1);
    }

    #[test]
    fn empty_results_do_not_break_assembly() {
        let h = harness();
        let spec = spec(&["quiet", "busy"]);
        h.facade.get_uncached(&spec).unwrap();
        complete(&h, &spec, "quiet", &Table::empty());
        complete(&h, &spec, "busy", &commits(&["b1"]));

        let table = h.facade.retrieve(&spec).unwrap();
        assert_eq!(table.row_count(), 1);
        assert_eq!(table.value(0, "entity_id"), Some(Value::from("busy")));
    }

    #[test]
    fn terminal_failure_is_named() {
        let h = harness();
        let spec = spec(&["ok", "broken"]);
        h.facade.get_uncached(&spec).unwrap();
        complete(&h, &spec, "ok", &commits(&["o1"]));

        let key = spec.key_for(&entity("broken"));
        let mut job = h.tracker.get(&key).unwrap().unwrap();
        job.mark_running();
        job.mark_failed("relation \"commits\" does not exist", chrono::Utc::now());
        h.tracker.update(&job).unwrap();

        let status = h.facade.status(&spec).unwrap();
        assert_eq!(status.ready, vec![entity("ok")]);
        assert_eq!(status.failed[0].0, entity("broken"));
        assert!(status.is_settled());
        assert_eq!(h.facade.get_uncached(&spec).unwrap(), BTreeSet::from([entity("broken")]));

        match h.facade.retrieve(&spec) {
            Err(CacheError::ComputationFailed { entity: e, reason }) => {
                assert_eq!(e, entity("broken"));
                assert!(reason.contains("after 1 attempts"));
            }
            other => panic!("expected ComputationFailed, got {other:?}"),
        }
        // Failed keys are not re-dispatched while the failure is retained.
        assert_eq!(h.queue.enqueued_total(), 2);
    }

    #[test]
    fn corrupt_entry_is_evicted_and_recomputed() {
        let h = harness();
        let spec = spec(&["repoA"]);
        let key = spec.key_for(&entity("repoA"));

        h.facade.get_uncached(&spec).unwrap();
        let mut job = h.tracker.get(&key).unwrap().unwrap();
        job.mark_running();
        job.mark_succeeded(chrono::Utc::now());
        h.tracker.update(&job).unwrap();
        h.store.put(&key, job.generation, b"VZCT\x01\x00garbage").unwrap();

        assert!(matches!(h.facade.retrieve(&spec), Err(CacheError::NotReady { .. })));
        assert!(!h.store.exists(&key).unwrap());
        assert_eq!(h.queue.enqueued_total(), 2);
        let fresh = h.tracker.get(&key).unwrap().unwrap();
        assert!(fresh.generation > job.generation);
    }

    #[test]
    fn invalidate_forces_recomputation() {
        let h = harness();
        let spec = spec(&["repoA"]);
        h.facade.get_uncached(&spec).unwrap();
        complete(&h, &spec, "repoA", &commits(&["a1"]));
        assert!(h.facade.get_uncached(&spec).unwrap().is_empty());

        assert_eq!(h.facade.invalidate(&spec).unwrap(), 1);
        assert_eq!(h.facade.get_uncached(&spec).unwrap().len(), 1);
        assert_eq!(h.queue.enqueued_total(), 2);
    }

    struct DownQueue;

    impl TaskQueue for DownQueue {
        fn enqueue(&self, _task: &TaskDescriptor) -> Result<(), QueueError> {
            Err(QueueError::Connection("connection refused".into()))
        }

        fn dequeue(&self, _timeout: Duration) -> Result<Option<crate::jobs::Delivery>, QueueError> {
            Ok(None)
        }

        fn ack(&self, _delivery: &crate::jobs::Delivery) -> Result<(), QueueError> {
            Ok(())
        }

        fn pending(&self) -> Result<usize, QueueError> {
            Ok(0)
        }
    }

    #[test]
    fn enqueue_failure_releases_the_key() {
        let tracker = Arc::new(InMemoryJobTracker::default());
        let facade = CacheFacade::new(
            Arc::new(InMemoryResultStore::new()),
            tracker.clone(),
            Arc::new(DownQueue),
            Codec::default(),
        );
        let spec = spec(&["repoA"]);

        assert!(matches!(facade.get_uncached(&spec), Err(CacheError::Queue(_))));
        assert_eq!(
            tracker.status(&spec.key_for(&entity("repoA"))).unwrap(),
            JobStatus::Absent
        );
    }
}
