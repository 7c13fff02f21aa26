//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus distributes [`JobEvent`](crate::JobEvent)s from workers to every
//! process that is waiting on a result. It makes few promises:
//!
//! - **Transport-agnostic**: in-memory channels, Redis pub/sub, ...
//! - **Best-effort**: a missed event only delays a waiter until its next
//!   fallback check; the result store remains the source of truth.
//! - **No ordering guarantees** between publishers.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// A subscription to an event stream.
///
/// Each subscription receives a copy of every event published after it was
/// created (broadcast semantics). Subscribe *before* checking state you are
/// about to wait on, otherwise the wake-up can be missed.
///
/// ```ignore
/// let sub = bus.subscribe();
/// loop {
///     if ready()? { break; }
///     match sub.recv_timeout(Duration::from_millis(500)) {
///         Ok(_) | Err(RecvTimeoutError::Timeout) => continue,
///         Err(RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Take every message that is already queued, without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Domain-agnostic pub/sub bus.
///
/// `publish` may fail (lock poisoning, network). Publishers treat failure as
/// non-fatal: the state they announce is already persisted.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
