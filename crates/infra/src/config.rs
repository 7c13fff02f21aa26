//! Configuration loading and representation.
//!
//! Everything is read from environment variables. [`CacheConfig::from_lookup`]
//! takes the lookup as a function so tests can supply a map instead of
//! touching the process environment.

use std::str::FromStr;
use std::time::Duration;

use crate::codec::CodecConfig;
use crate::jobs::{Jitter, RetryPolicy, TrackerTimings, WorkerConfig};
use crate::poller::PollerConfig;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{var} must be set when {related} is set")]
    Missing {
        var: &'static str,
        related: &'static str,
    },
}

/// Connection settings for the Postgres query source.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    /// Applied as the connection's `search_path`.
    pub schema: Option<String>,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .field("schema", &self.schema)
            .finish()
    }
}

#[cfg(feature = "postgres")]
impl DatabaseConfig {
    pub fn postgres_options(&self) -> crate::source::PostgresOptions {
        let options = crate::source::PostgresOptions::new(self.url.clone());
        match &self.schema {
            Some(schema) => options.with_schema(schema.clone()),
            None => options,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Prefix of every Redis key this deployment owns.
    pub namespace: String,
    pub redis_url: String,
    pub retry: RetryPolicy,
    pub timings: TrackerTimings,
    pub result_ttl: Option<Duration>,
    pub poller: PollerConfig,
    pub worker: WorkerConfig,
    pub codec: CodecConfig,
    pub database: Option<DatabaseConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "vizcache".to_string(),
            redis_url: "redis://redis-cache:6379".to_string(),
            retry: RetryPolicy::default(),
            timings: TrackerTimings::default(),
            result_ttl: None,
            poller: PollerConfig::default(),
            worker: WorkerConfig::default(),
            codec: CodecConfig::default(),
            database: None,
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);
        let defaults = Self::default();

        let retry = RetryPolicy {
            max_retries: env.parse("VIZCACHE_MAX_RETRIES")?.unwrap_or(defaults.retry.max_retries),
            base_delay: env
                .millis("VIZCACHE_BACKOFF_BASE_MS")?
                .unwrap_or(defaults.retry.base_delay),
            max_delay: env
                .millis("VIZCACHE_BACKOFF_MAX_MS")?
                .unwrap_or(defaults.retry.max_delay),
            jitter: env.jitter("VIZCACHE_JITTER")?.unwrap_or(defaults.retry.jitter),
        };

        let timings = TrackerTimings {
            lease: env
                .positive_secs("VIZCACHE_LEASE_SECS")?
                .unwrap_or(defaults.timings.lease),
            failure_retention: env
                .positive_secs("VIZCACHE_FAILURE_RETENTION_SECS")?
                .unwrap_or(defaults.timings.failure_retention),
            ..defaults.timings
        };

        let poller = PollerConfig {
            poll_interval: env
                .millis("VIZCACHE_POLL_INTERVAL_MS")?
                .unwrap_or(defaults.poller.poll_interval),
            max_wait: env
                .secs("VIZCACHE_MAX_WAIT_SECS")?
                .unwrap_or(defaults.poller.max_wait),
        };

        let worker_name = env
            .get("VIZCACHE_WORKER_NAME")
            .or_else(|| env.get("HOSTNAME"))
            .unwrap_or_else(|| "worker".to_string());
        let concurrency: usize = env
            .parse("VIZCACHE_WORKER_CONCURRENCY")?
            .unwrap_or(defaults.worker.concurrency);
        if concurrency == 0 {
            return Err(ConfigError::Invalid {
                var: "VIZCACHE_WORKER_CONCURRENCY",
                value: "0".to_string(),
                reason: "at least one worker thread is required".to_string(),
            });
        }

        let codec = CodecConfig {
            compression_threshold: env
                .parse("VIZCACHE_COMPRESSION_THRESHOLD")?
                .unwrap_or(defaults.codec.compression_threshold),
            ..defaults.codec
        };

        Ok(Self {
            namespace: env.get("VIZCACHE_NAMESPACE").unwrap_or(defaults.namespace),
            redis_url: redis_url(&env),
            retry,
            timings,
            // 0 disables expiry, as it does for Redis.
            result_ttl: env
                .secs("VIZCACHE_RESULT_TTL_SECS")?
                .filter(|ttl| !ttl.is_zero()),
            poller,
            worker: WorkerConfig::default()
                .with_name(worker_name)
                .with_concurrency(concurrency),
            codec,
            database: database(&env)?,
        })
    }
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Set and non-blank.
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(var)
            .map(|value| {
                value.parse::<T>().map_err(|e| ConfigError::Invalid {
                    var,
                    reason: e.to_string(),
                    value,
                })
            })
            .transpose()
    }

    fn millis(&self, var: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse(var)?.map(Duration::from_millis))
    }

    fn secs(&self, var: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse(var)?.map(Duration::from_secs))
    }

    /// Like [`Self::secs`] but rejects `0`; a zero window expires records
    /// as soon as they are written.
    fn positive_secs(&self, var: &'static str) -> Result<Option<Duration>, ConfigError> {
        match self.secs(var)? {
            Some(d) if d.is_zero() => Err(ConfigError::Invalid {
                var,
                value: "0".to_string(),
                reason: "must be at least one second".to_string(),
            }),
            other => Ok(other),
        }
    }

    fn jitter(&self, var: &'static str) -> Result<Option<Jitter>, ConfigError> {
        self.get(var)
            .map(|value| match value.to_ascii_lowercase().as_str() {
                "full" => Ok(Jitter::Full),
                "none" => Ok(Jitter::None),
                _ => Err(ConfigError::Invalid {
                    var,
                    value,
                    reason: "expected `full` or `none`".to_string(),
                }),
            })
            .transpose()
    }
}

fn redis_url<F>(env: &Env<'_, F>) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = env.get("REDIS_URL") {
        return url;
    }
    let host = env
        .get("REDIS_SERVICE_HOST")
        .unwrap_or_else(|| "redis-cache".to_string());
    let port = env
        .get("REDIS_SERVICE_PORT")
        .unwrap_or_else(|| "6379".to_string());
    match env.get("REDIS_PASSWORD") {
        Some(password) => format!("redis://:{password}@{host}:{port}"),
        None => format!("redis://{host}:{port}"),
    }
}

/// `DATABASE_URL` wins; otherwise the `AUGUR_*` parts are assembled. No
/// database settings at all is not an error.
fn database<F>(env: &Env<'_, F>) -> Result<Option<DatabaseConfig>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let schema = env.get("AUGUR_SCHEMA");
    if let Some(url) = env.get("DATABASE_URL") {
        return Ok(Some(DatabaseConfig { url, schema }));
    }

    let Some(host) = env.get("AUGUR_HOST") else {
        return Ok(None);
    };
    let require = |var: &'static str| {
        env.get(var).ok_or(ConfigError::Missing {
            var,
            related: "AUGUR_HOST",
        })
    };
    let user = require("AUGUR_USERNAME")?;
    let password = require("AUGUR_PASSWORD")?;
    let database = require("AUGUR_DATABASE")?;
    let port: u16 = env.parse("AUGUR_PORT")?.unwrap_or(5432);

    Ok(Some(DatabaseConfig {
        url: format!("postgres://{user}:{password}@{host}:{port}/{database}"),
        schema,
    }))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<CacheConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        CacheConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = load(&[]).unwrap();
        assert_eq!(config.namespace, "vizcache");
        assert_eq!(config.redis_url, "redis://redis-cache:6379");
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.timings, TrackerTimings::default());
        assert_eq!(config.result_ttl, None);
        assert_eq!(config.poller.max_wait, Duration::from_secs(1800));
        assert_eq!(config.worker.name, "worker");
        assert_eq!(config.worker.concurrency, 4);
        assert!(config.database.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("VIZCACHE_NAMESPACE", "dash"),
            ("VIZCACHE_MAX_RETRIES", "2"),
            ("VIZCACHE_BACKOFF_BASE_MS", "100"),
            ("VIZCACHE_JITTER", "None"),
            ("VIZCACHE_LEASE_SECS", "30"),
            ("VIZCACHE_RESULT_TTL_SECS", "86400"),
            ("VIZCACHE_POLL_INTERVAL_MS", "250"),
            ("VIZCACHE_WORKER_CONCURRENCY", "8"),
            ("HOSTNAME", "worker-7f9c"),
            ("VIZCACHE_COMPRESSION_THRESHOLD", "0"),
        ])
        .unwrap();

        assert_eq!(config.namespace, "dash");
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.base_delay, Duration::from_millis(100));
        assert_eq!(config.retry.jitter, Jitter::None);
        assert_eq!(config.timings.lease, Duration::from_secs(30));
        assert_eq!(config.result_ttl, Some(Duration::from_secs(86400)));
        assert_eq!(config.poller.poll_interval, Duration::from_millis(250));
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.name, "worker-7f9c");
        assert_eq!(config.codec.compression_threshold, 0);
    }

    #[test]
    fn invalid_numbers_name_the_variable() {
        let err = load(&[("VIZCACHE_MAX_RETRIES", "lots")]).unwrap_err();
        match err {
            ConfigError::Invalid { var, value, .. } => {
                assert_eq!(var, "VIZCACHE_MAX_RETRIES");
                assert_eq!(value, "lots");
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(load(&[("VIZCACHE_JITTER", "some")]).is_err());
        assert!(load(&[("VIZCACHE_WORKER_CONCURRENCY", "0")]).is_err());
    }

    #[test]
    fn zero_lease_or_retention_is_rejected() {
        for var in ["VIZCACHE_LEASE_SECS", "VIZCACHE_FAILURE_RETENTION_SECS"] {
            match load(&[(var, "0")]).unwrap_err() {
                ConfigError::Invalid { var: named, value, .. } => {
                    assert_eq!(named, var);
                    assert_eq!(value, "0");
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn shortest_lease_still_dispatches_once() {
        use crate::backends::Backends;
        use crate::facade::QuerySpec;
        use crate::jobs::TaskQueue;
        use vizcache_core::{EntityId, QueryKind};

        // The smallest accepted lease keeps a cold key registered.
        let config = load(&[("VIZCACHE_LEASE_SECS", "1")]).unwrap();
        let backends = Backends::in_memory(&config);
        let facade = backends.facade();
        let spec = QuerySpec::new(QueryKind::new("commits").unwrap(), [EntityId::new("repoA").unwrap()]);

        for _ in 0..5 {
            facade.get_uncached(&spec).unwrap();
        }
        assert_eq!(backends.queue.pending().unwrap(), 1);
    }

    #[test]
    fn zero_result_ttl_means_no_expiry() {
        let config = load(&[("VIZCACHE_RESULT_TTL_SECS", "0")]).unwrap();
        assert_eq!(config.result_ttl, None);
    }

    #[test]
    fn redis_url_is_assembled_from_service_parts() {
        let config = load(&[
            ("REDIS_SERVICE_HOST", "cache.internal"),
            ("REDIS_SERVICE_PORT", "6380"),
            ("REDIS_PASSWORD", "s3cret"),
        ])
        .unwrap();
        assert_eq!(config.redis_url, "redis://:s3cret@cache.internal:6380");

        let config = load(&[
            ("REDIS_URL", "redis://localhost:6379/2"),
            ("REDIS_SERVICE_HOST", "ignored"),
        ])
        .unwrap();
        assert_eq!(config.redis_url, "redis://localhost:6379/2");
    }

    #[test]
    fn database_from_augur_parts() {
        let config = load(&[
            ("AUGUR_USERNAME", "augur"),
            ("AUGUR_PASSWORD", "pw"),
            ("AUGUR_HOST", "db.example.org"),
            ("AUGUR_DATABASE", "augur_data"),
            ("AUGUR_SCHEMA", "augur_data"),
        ])
        .unwrap();
        let database = config.database.unwrap();
        assert_eq!(database.url, "postgres://augur:pw@db.example.org:5432/augur_data");
        assert_eq!(database.schema.as_deref(), Some("augur_data"));
        assert!(!format!("{database:?}").contains("pw"));
    }

    #[test]
    fn partial_database_settings_are_rejected() {
        let err = load(&[("AUGUR_HOST", "db"), ("AUGUR_USERNAME", "augur")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Missing {
                var: "AUGUR_PASSWORD",
                related: "AUGUR_HOST",
            }
        );
    }
}
