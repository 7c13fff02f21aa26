//! Compute-and-cache layer for dashboard queries.
//!
//! Chart callbacks ask the [`CacheFacade`] for a query kind over a set of
//! entities. Anything not cached yet is dispatched once to a background
//! worker, which runs the query against the [`QuerySource`], encodes the
//! table with the [`Codec`] and writes it to the [`ResultStore`]. Callers
//! wait with the [`ReadinessPoller`] and read the combined table back.
//!
//! In-memory backends are always available; Redis backends need the `redis`
//! feature and the Postgres query source needs `postgres`.

pub mod backends;
pub mod codec;
pub mod config;
pub mod event_bus;
pub mod facade;
pub mod jobs;
pub mod poller;
pub mod source;
pub mod store;

pub use backends::{BackendError, Backends};
pub use codec::{Codec, CodecConfig, CodecError, Compression};
pub use config::{CacheConfig, ConfigError, DatabaseConfig};
pub use facade::{CacheError, CacheFacade, PartialResult, QuerySpec, Readiness};
pub use jobs::{
    DispatchOutcome, Dispatcher, JobStatus, JobTracker, RetryPolicy, TaskQueue, WorkerConfig,
    WorkerPool,
};
pub use poller::{PollerConfig, ReadinessPoller};
pub use source::{ExecutionConfig, QueryCatalog, QuerySource, QuerySourceError};
pub use store::{PutOutcome, ResultStore, StoreError};
