//! Redis-backed result store.
//!
//! Each entry is a hash `{generation, payload}` under
//! `{namespace}:result:{query_kind}:{digest}`. The conditional write runs as
//! a Lua script so the generation check and the write are atomic.

use std::time::Duration;

use vizcache_core::{CacheKey, KeySpace};

use super::{PutOutcome, ResultStore, StoreError, StoredEntry};

const PUT_IF_NEWER: &str = r"
local current = redis.call('HGET', KEYS[1], 'generation')
if current and tonumber(current) > tonumber(ARGV[1]) then
  return tonumber(current)
end
redis.call('HSET', KEYS[1], 'generation', ARGV[1], 'payload', ARGV[2])
if tonumber(ARGV[3]) > 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[3])
else
  redis.call('PERSIST', KEYS[1])
end
return -1
";

#[derive(Debug, Clone)]
pub struct RedisResultStore {
    client: redis::Client,
    namespace: String,
    ttl: Option<Duration>,
    put_script: redis::Script,
}

impl RedisResultStore {
    pub fn new(
        redis_url: impl AsRef<str>,
        namespace: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(map_redis_error)?;
        Ok(Self {
            client,
            namespace: namespace.into(),
            ttl,
            put_script: redis::Script::new(PUT_IF_NEWER),
        })
    }

    fn key(&self, key: &CacheKey) -> String {
        key.storage_key(&self.namespace, KeySpace::Result)
    }

    fn connection(&self) -> Result<redis::Connection, StoreError> {
        self.client.get_connection().map_err(map_redis_error)
    }
}

impl ResultStore for RedisResultStore {
    fn put(
        &self,
        key: &CacheKey,
        generation: u64,
        payload: &[u8],
    ) -> Result<PutOutcome, StoreError> {
        let mut conn = self.connection()?;
        let ttl_ms = self.ttl.map_or(0, |t| t.as_millis() as u64);

        let current: i64 = self
            .put_script
            .key(self.key(key))
            .arg(generation)
            .arg(payload)
            .arg(ttl_ms)
            .invoke(&mut conn)
            .map_err(map_redis_error)?;

        if current < 0 {
            Ok(PutOutcome::Written)
        } else {
            tracing::debug!(%key, generation, current, "skipped stale result write");
            Ok(PutOutcome::Stale {
                current: current as u64,
            })
        }
    }

    fn get(&self, key: &CacheKey) -> Result<Option<StoredEntry>, StoreError> {
        let mut conn = self.connection()?;
        let (generation, payload): (Option<u64>, Option<Vec<u8>>) = redis::cmd("HMGET")
            .arg(self.key(key))
            .arg("generation")
            .arg("payload")
            .query(&mut conn)
            .map_err(map_redis_error)?;

        Ok(match (generation, payload) {
            (Some(generation), Some(payload)) => Some(StoredEntry {
                generation,
                payload,
            }),
            _ => None,
        })
    }

    fn exists(&self, key: &CacheKey) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        redis::cmd("EXISTS")
            .arg(self.key(key))
            .query(&mut conn)
            .map_err(map_redis_error)
    }

    fn delete(&self, key: &CacheKey) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        let removed: i64 = redis::cmd("DEL")
            .arg(self.key(key))
            .query(&mut conn)
            .map_err(map_redis_error)?;
        Ok(removed > 0)
    }
}

fn map_redis_error(e: redis::RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Command(e.to_string())
    }
}
