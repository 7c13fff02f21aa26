//! Result store: encoded tables keyed by [`CacheKey`], guarded by a
//! generation number so a stale computation can never overwrite a newer one.

use std::sync::Arc;

use vizcache_core::CacheKey;

mod in_memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use in_memory::InMemoryResultStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisResultStore;

/// An encoded result together with the generation of the job that wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub generation: u64,
    pub payload: Vec<u8>,
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    /// A newer generation already holds the key; nothing was written.
    Stale { current: u64 },
}

impl PutOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, PutOutcome::Written)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("store connection failed: {0}")]
    Connection(String),
    /// The backend rejected or failed a command.
    #[error("store command failed: {0}")]
    Command(String),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Key-value store for encoded results.
///
/// Writes are conditional: `put` succeeds when the key is empty or holds a
/// generation `<=` the one being written. Readers see either the previous
/// value or the new one, never a mix.
pub trait ResultStore: Send + Sync {
    fn put(&self, key: &CacheKey, generation: u64, payload: &[u8])
    -> Result<PutOutcome, StoreError>;

    fn get(&self, key: &CacheKey) -> Result<Option<StoredEntry>, StoreError>;

    fn exists(&self, key: &CacheKey) -> Result<bool, StoreError>;

    /// Remove the entry. Returns whether anything was removed.
    fn delete(&self, key: &CacheKey) -> Result<bool, StoreError>;
}

impl<S> ResultStore for Arc<S>
where
    S: ResultStore + ?Sized,
{
    fn put(
        &self,
        key: &CacheKey,
        generation: u64,
        payload: &[u8],
    ) -> Result<PutOutcome, StoreError> {
        (**self).put(key, generation, payload)
    }

    fn get(&self, key: &CacheKey) -> Result<Option<StoredEntry>, StoreError> {
        (**self).get(key)
    }

    fn exists(&self, key: &CacheKey) -> Result<bool, StoreError> {
        (**self).exists(key)
    }

    fn delete(&self, key: &CacheKey) -> Result<bool, StoreError> {
        (**self).delete(key)
    }
}
