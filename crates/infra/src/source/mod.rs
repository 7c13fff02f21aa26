//! Query sources: the side of the system that actually computes results.
//!
//! A [`QuerySource`] runs one named query for one entity and returns a
//! [`Table`]. The dispatcher calls it from worker threads, so
//! implementations block and must be `Send + Sync`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use vizcache_core::{EntityId, QueryKind, Table};

mod catalog;
#[cfg(feature = "postgres")]
mod postgres;

pub use catalog::QueryCatalog;
#[cfg(feature = "postgres")]
pub use postgres::{PostgresOptions, PostgresQuerySource};

/// Opaque per-request parameters forwarded to the query source
/// (connection hints, date windows, ...). Not part of the cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionConfig {
    params: BTreeMap<String, String>,
}

impl ExecutionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuerySourceError {
    #[error("query source unreachable: {0}")]
    Connectivity(String),

    #[error("query timed out: {0}")]
    Timeout(String),

    #[error("malformed query: {0}")]
    MalformedQuery(String),

    #[error("no query registered for `{0}`")]
    UnknownQueryKind(QueryKind),
}

impl QuerySourceError {
    /// Whether running the same query again could succeed.
    ///
    /// Connectivity, timeout and malformed-query failures are retried; a
    /// query kind the source does not know is not.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, QuerySourceError::UnknownQueryKind(_))
    }
}

/// Runs a named query for a single entity.
pub trait QuerySource: Send + Sync {
    fn run(
        &self,
        query_kind: &QueryKind,
        entity: &EntityId,
        config: &ExecutionConfig,
    ) -> Result<Table, QuerySourceError>;
}

impl<S> QuerySource for Arc<S>
where
    S: QuerySource + ?Sized,
{
    fn run(
        &self,
        query_kind: &QueryKind,
        entity: &EntityId,
        config: &ExecutionConfig,
    ) -> Result<Table, QuerySourceError> {
        (**self).run(query_kind, entity, config)
    }
}

/// Adapts a closure into a [`QuerySource`].
pub struct FnQuerySource<F>(F);

impl<F> FnQuerySource<F>
where
    F: Fn(&QueryKind, &EntityId, &ExecutionConfig) -> Result<Table, QuerySourceError>
        + Send
        + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> QuerySource for FnQuerySource<F>
where
    F: Fn(&QueryKind, &EntityId, &ExecutionConfig) -> Result<Table, QuerySourceError>
        + Send
        + Sync,
{
    fn run(
        &self,
        query_kind: &QueryKind,
        entity: &EntityId,
        config: &ExecutionConfig,
    ) -> Result<Table, QuerySourceError> {
        (self.0)(query_kind, entity, config)
    }
}

impl<F> core::fmt::Debug for FnQuerySource<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("FnQuerySource")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_config_is_ordered_and_serializes_flat() {
        let config = ExecutionConfig::new()
            .with("window", "90d")
            .with("branch", "main");
        assert_eq!(config.get("window"), Some("90d"));
        assert_eq!(
            serde_json::to_string(&config).unwrap(),
            r#"{"branch":"main","window":"90d"}"#
        );
    }

    #[test]
    fn only_unknown_kinds_are_permanent() {
        assert!(QuerySourceError::Timeout("30s".into()).is_retryable());
        assert!(QuerySourceError::MalformedQuery("syntax".into()).is_retryable());
        assert!(
            !QuerySourceError::UnknownQueryKind(QueryKind::new("nope").unwrap()).is_retryable()
        );
    }

    #[test]
    fn closures_are_sources() {
        let source = FnQuerySource::new(|_: &QueryKind, entity: &EntityId, _: &ExecutionConfig| {
            Table::empty()
                .with_origin("entity_id", entity.as_str())
                .map_err(|e| QuerySourceError::MalformedQuery(e.to_string()))
        });
        let table = source
            .run(
                &QueryKind::new("commits").unwrap(),
                &EntityId::new("repoA").unwrap(),
                &ExecutionConfig::default(),
            )
            .unwrap();
        assert_eq!(table.column_count(), 1);
    }
}
