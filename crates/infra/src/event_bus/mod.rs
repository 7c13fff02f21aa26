//! Cross-process carriers for job completion events.
//!
//! The bus abstraction and the in-process implementation live in
//! `vizcache-events`. This module adds the Redis-backed carrier.

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::{RedisBusError, RedisCompletionBus};
