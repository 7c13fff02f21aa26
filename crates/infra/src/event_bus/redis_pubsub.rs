//! Redis pub/sub carrier for job completion events (optional).
//!
//! Pub/sub is not durable: an event published while a process is
//! disconnected is lost. Waiters tolerate that because they also re-check on
//! their poll interval.
//!
//! One listener thread per bus holds the Redis subscription and fans events
//! out to local subscribers, so a waiting request costs a channel rather than
//! a connection.

use std::sync::{Arc, Once, Weak};
use std::thread;
use std::time::Duration;

use redis::Commands;
use tracing::{debug, warn};

use vizcache_events::{EventBus, InMemoryEventBus, JobEvent, Subscription};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const READ_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum RedisBusError {
    #[error("redis error: {0}")]
    Redis(String),
    #[error("failed to serialize job event: {0}")]
    Serialize(String),
}

#[derive(Debug)]
pub struct RedisCompletionBus {
    client: redis::Client,
    channel: String,
    local: Arc<InMemoryEventBus<JobEvent>>,
    listener: Once,
}

impl RedisCompletionBus {
    /// Events travel on `{namespace}:events`. No connection is made until the
    /// first publish or subscribe.
    pub fn new(redis_url: impl AsRef<str>, namespace: &str) -> Result<Self, RedisBusError> {
        let client =
            redis::Client::open(redis_url.as_ref()).map_err(|e| RedisBusError::Redis(e.to_string()))?;
        Ok(Self {
            client,
            channel: format!("{namespace}:events"),
            local: Arc::new(InMemoryEventBus::new()),
            listener: Once::new(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn start_listener(&self) {
        self.listener.call_once(|| {
            let client = self.client.clone();
            let channel = self.channel.clone();
            let local = Arc::downgrade(&self.local);
            let spawned = thread::Builder::new()
                .name("vizcache-events".to_string())
                .spawn(move || listen(&client, &channel, &local));
            if let Err(e) = spawned {
                warn!(error = %e, "failed to start event listener; waiters fall back to polling");
            }
        });
    }
}

impl EventBus<JobEvent> for RedisCompletionBus {
    type Error = RedisBusError;

    fn publish(&self, message: JobEvent) -> Result<(), Self::Error> {
        let payload = message
            .to_json()
            .map_err(|e| RedisBusError::Serialize(e.to_string()))?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        let _: i64 = conn
            .publish(&self.channel, payload)
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        Ok(())
    }

    fn subscribe(&self) -> Subscription<JobEvent> {
        self.start_listener();
        self.local.subscribe()
    }
}

/// Forward events until the bus is dropped, reconnecting on errors.
fn listen(client: &redis::Client, channel: &str, local: &Weak<InMemoryEventBus<JobEvent>>) {
    while local.strong_count() > 0 {
        if let Err(e) = forward(client, channel, local) {
            warn!(channel, error = %e, "event subscription lost, reconnecting");
            thread::sleep(RECONNECT_DELAY);
        }
    }
    debug!(channel, "event listener stopped");
}

fn forward(
    client: &redis::Client,
    channel: &str,
    local: &Weak<InMemoryEventBus<JobEvent>>,
) -> redis::RedisResult<()> {
    let mut conn = client.get_connection()?;
    let mut pubsub = conn.as_pubsub();
    pubsub.set_read_timeout(Some(READ_TIMEOUT))?;
    pubsub.subscribe(channel)?;
    debug!(channel, "subscribed to job events");

    loop {
        let message = match pubsub.get_message() {
            Ok(message) => message,
            Err(e) if e.is_timeout() => {
                if local.strong_count() == 0 {
                    return Ok(());
                }
                continue;
            }
            Err(e) => return Err(e),
        };

        let Some(event) = decode_event(&message.get_payload::<String>()?) else {
            continue;
        };
        let Some(local) = local.upgrade() else {
            return Ok(());
        };
        if let Err(e) = local.publish(event) {
            warn!(error = ?e, "failed to hand job event to local subscribers");
        }
    }
}

fn decode_event(payload: &str) -> Option<JobEvent> {
    match JobEvent::from_json(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, "ignoring undecodable job event");
            None
        }
    }
}
