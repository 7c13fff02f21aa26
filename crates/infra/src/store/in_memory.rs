use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use vizcache_core::CacheKey;

use super::{PutOutcome, ResultStore, StoreError, StoredEntry};

#[derive(Debug)]
struct Slot {
    entry: StoredEntry,
    expires_at: Option<Instant>,
}

impl Slot {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Process-local result store. Expired entries are dropped lazily.
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    entries: RwLock<HashMap<CacheKey, Slot>>,
    ttl: Option<Duration>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries expire `ttl` after their last write. A zero `ttl` means no
    /// expiry, matching the Redis store.
    pub fn with_ttl(ttl: Option<Duration>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: ttl.filter(|t| !t.is_zero()),
        }
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .map(|m| m.values().filter(|s| s.live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResultStore for InMemoryResultStore {
    fn put(
        &self,
        key: &CacheKey,
        generation: u64,
        payload: &[u8],
    ) -> Result<PutOutcome, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.write().map_err(|_| StoreError::Poisoned)?;

        if let Some(slot) = entries.get(key).filter(|s| s.live(now)) {
            if slot.entry.generation > generation {
                return Ok(PutOutcome::Stale {
                    current: slot.entry.generation,
                });
            }
        }

        entries.insert(
            key.clone(),
            Slot {
                entry: StoredEntry {
                    generation,
                    payload: payload.to_vec(),
                },
                expires_at: self.ttl.map(|ttl| now + ttl),
            },
        );
        Ok(PutOutcome::Written)
    }

    fn get(&self, key: &CacheKey) -> Result<Option<StoredEntry>, StoreError> {
        let now = Instant::now();
        let entries = self.entries.read().map_err(|_| StoreError::Poisoned)?;
        Ok(entries
            .get(key)
            .filter(|s| s.live(now))
            .map(|s| s.entry.clone()))
    }

    fn exists(&self, key: &CacheKey) -> Result<bool, StoreError> {
        let now = Instant::now();
        let entries = self.entries.read().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).is_some_and(|s| s.live(now)))
    }

    fn delete(&self, key: &CacheKey) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.write().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.remove(key).is_some_and(|s| s.live(now)))
    }
}
