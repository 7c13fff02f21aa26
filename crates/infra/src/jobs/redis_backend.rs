//! Redis-backed job tracker and task queue (optional).
//!
//! Job records are JSON strings under `{namespace}:job:{query_kind}:{digest}`
//! whose `PX` expiry is the lease or retention window. Every
//! read-check-write runs as a Lua script so concurrent processes see one
//! consistent answer.
//!
//! The queue is a reliable list: `BLMOVE` takes a task from
//! `{namespace}:queue:pending` into a per-consumer processing list, `LREM`
//! acknowledges it, and `recover` pushes leftovers back after a crash.

use std::time::Duration;

use vizcache_core::{CacheKey, KeySpace};

use super::queue::{Delivery, QueueError, TaskQueue};
use super::tracker::{JobTracker, TrackerError, TrackerTimings};
use super::types::{Job, TaskDescriptor};
use crate::source::ExecutionConfig;

const REGISTER: &str = r"
local current = redis.call('GET', KEYS[1])
if current then
  local ok, job = pcall(cjson.decode, current)
  if ok and type(job.status) == 'table' and job.status.state ~= 'succeeded' then
    return current
  end
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
return false
";

const UPDATE_IF_OWNER: &str = r"
local current = redis.call('GET', KEYS[1])
if not current then
  return 0
end
local ok, job = pcall(cjson.decode, current)
if not ok or job.id ~= ARGV[1] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
return 1
";

const RENEW_IF_ACTIVE: &str = r"
local current = redis.call('GET', KEYS[1])
if not current then
  return 0
end
local ok, job = pcall(cjson.decode, current)
if not ok or type(job.status) ~= 'table' then
  return 0
end
local state = job.status.state
if state == 'queued' or state == 'running' or state == 'failed_retryable' then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  return 1
end
return 0
";

fn millis(d: Duration) -> u64 {
    d.as_millis().clamp(1, u128::from(u64::MAX)) as u64
}

fn is_connection_error(e: &redis::RedisError) -> bool {
    e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
}

#[derive(Debug, Clone)]
pub struct RedisJobTracker {
    client: redis::Client,
    namespace: String,
    timings: TrackerTimings,
    register_script: redis::Script,
    update_script: redis::Script,
    renew_script: redis::Script,
}

impl RedisJobTracker {
    pub fn new(
        redis_url: impl AsRef<str>,
        namespace: impl Into<String>,
        timings: TrackerTimings,
    ) -> Result<Self, TrackerError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(tracker_error)?;
        Ok(Self {
            client,
            namespace: namespace.into(),
            timings,
            register_script: redis::Script::new(REGISTER),
            update_script: redis::Script::new(UPDATE_IF_OWNER),
            renew_script: redis::Script::new(RENEW_IF_ACTIVE),
        })
    }

    fn key(&self, key: &CacheKey) -> String {
        key.storage_key(&self.namespace, KeySpace::Job)
    }

    fn generation_key(&self) -> String {
        format!("{}:generation", self.namespace)
    }

    fn connection(&self) -> Result<redis::Connection, TrackerError> {
        self.client.get_connection().map_err(tracker_error)
    }
}

fn tracker_error(e: redis::RedisError) -> TrackerError {
    TrackerError::Storage(e.to_string())
}

fn encode_job(job: &Job) -> Result<String, TrackerError> {
    serde_json::to_string(job).map_err(|e| TrackerError::Corrupt(e.to_string()))
}

impl JobTracker for RedisJobTracker {
    fn get(&self, key: &CacheKey) -> Result<Option<Job>, TrackerError> {
        let mut conn = self.connection()?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.key(key))
            .query(&mut conn)
            .map_err(tracker_error)?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(|e| TrackerError::Corrupt(e.to_string())))
            .transpose()
    }

    fn register(
        &self,
        key: &CacheKey,
        config: &ExecutionConfig,
    ) -> Result<Option<Job>, TrackerError> {
        let mut conn = self.connection()?;
        let generation: u64 = redis::cmd("INCR")
            .arg(self.generation_key())
            .query(&mut conn)
            .map_err(tracker_error)?;

        let job = Job::new(key.clone(), config.clone(), generation);
        let existing: Option<String> = self
            .register_script
            .key(self.key(key))
            .arg(encode_job(&job)?)
            .arg(millis(self.timings.lease))
            .invoke(&mut conn)
            .map_err(tracker_error)?;

        Ok(match existing {
            Some(_) => None,
            None => Some(job),
        })
    }

    fn update(&self, job: &Job) -> Result<(), TrackerError> {
        let mut conn = self.connection()?;
        let updated: i64 = self
            .update_script
            .key(self.key(&job.key))
            .arg(job.id.to_string())
            .arg(encode_job(job)?)
            .arg(millis(self.timings.ttl_for(&job.status)))
            .invoke(&mut conn)
            .map_err(tracker_error)?;

        if updated == 1 {
            Ok(())
        } else {
            Err(TrackerError::Superseded(job.key.clone()))
        }
    }

    fn renew_lease(&self, key: &CacheKey) -> Result<bool, TrackerError> {
        let mut conn = self.connection()?;
        let renewed: i64 = self
            .renew_script
            .key(self.key(key))
            .arg(millis(self.timings.lease))
            .invoke(&mut conn)
            .map_err(tracker_error)?;
        Ok(renewed == 1)
    }

    fn clear(&self, key: &CacheKey) -> Result<(), TrackerError> {
        let mut conn = self.connection()?;
        let _: i64 = redis::cmd("DEL")
            .arg(self.key(key))
            .query(&mut conn)
            .map_err(tracker_error)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RedisTaskQueue {
    client: redis::Client,
    pending_key: String,
    processing_key: String,
}

impl RedisTaskQueue {
    /// `consumer` names this worker's processing list; reuse the same name
    /// across restarts so `recover` finds what a crashed run left behind.
    pub fn new(
        redis_url: impl AsRef<str>,
        namespace: &str,
        consumer: &str,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(queue_error)?;
        Ok(Self {
            client,
            pending_key: format!("{namespace}:queue:pending"),
            processing_key: format!("{namespace}:queue:processing:{consumer}"),
        })
    }

    fn connection(&self) -> Result<redis::Connection, QueueError> {
        self.client.get_connection().map_err(queue_error)
    }
}

fn queue_error(e: redis::RedisError) -> QueueError {
    if is_connection_error(&e) {
        QueueError::Connection(e.to_string())
    } else {
        QueueError::Command(e.to_string())
    }
}

impl TaskQueue for RedisTaskQueue {
    fn enqueue(&self, task: &TaskDescriptor) -> Result<(), QueueError> {
        let payload =
            serde_json::to_string(task).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let mut conn = self.connection()?;
        let _: i64 = redis::cmd("LPUSH")
            .arg(&self.pending_key)
            .arg(payload)
            .query(&mut conn)
            .map_err(queue_error)?;
        Ok(())
    }

    fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connection()?;
        let raw: Option<String> = if timeout.is_zero() {
            redis::cmd("LMOVE")
                .arg(&self.pending_key)
                .arg(&self.processing_key)
                .arg("RIGHT")
                .arg("LEFT")
                .query(&mut conn)
        } else {
            redis::cmd("BLMOVE")
                .arg(&self.pending_key)
                .arg(&self.processing_key)
                .arg("RIGHT")
                .arg("LEFT")
                .arg(timeout.as_secs_f64())
                .query(&mut conn)
        }
        .map_err(queue_error)?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<TaskDescriptor>(&raw) {
            Ok(task) => Ok(Some(Delivery {
                task,
                receipt: Some(raw),
            })),
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable task");
                let _: i64 = redis::cmd("LREM")
                    .arg(&self.processing_key)
                    .arg(1)
                    .arg(&raw)
                    .query(&mut conn)
                    .map_err(queue_error)?;
                Err(QueueError::Serialization(e.to_string()))
            }
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let Some(receipt) = &delivery.receipt else {
            return Ok(());
        };
        let mut conn = self.connection()?;
        let _: i64 = redis::cmd("LREM")
            .arg(&self.processing_key)
            .arg(1)
            .arg(receipt)
            .query(&mut conn)
            .map_err(queue_error)?;
        Ok(())
    }

    fn pending(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection()?;
        redis::cmd("LLEN")
            .arg(&self.pending_key)
            .query(&mut conn)
            .map_err(queue_error)
    }

    fn recover(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection()?;
        let mut moved = 0;
        loop {
            let raw: Option<String> = redis::cmd("LMOVE")
                .arg(&self.processing_key)
                .arg(&self.pending_key)
                .arg("RIGHT")
                .arg("RIGHT")
                .query(&mut conn)
                .map_err(queue_error)?;
            if raw.is_none() {
                break;
            }
            moved += 1;
        }
        if moved > 0 {
            tracing::info!(moved, queue = %self.pending_key, "recovered unacknowledged tasks");
        }
        Ok(moved)
    }
}
