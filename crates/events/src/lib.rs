//! Completion events and the pub/sub mechanics that carry them.
//!
//! Workers publish a [`JobEvent`] whenever a job settles; waiting callers
//! subscribe so they are woken instead of sleeping through a fixed interval.

pub mod bus;
pub mod in_memory_bus;
pub mod job_event;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use job_event::{CompletionBus, JobEvent, JobOutcome};
