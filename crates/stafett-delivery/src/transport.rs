//! Broker transport abstraction for the consumption engine.
//!
//! Provides trait-based abstractions over the broker's consume and produce
//! paths so the engine can be driven against in-memory doubles in tests.
//! Production implementations wrap the real broker client; each internal
//! queue of a shard gets its own source and producer.

use std::{future::Future, pin::Pin, sync::Arc};

use stafett_core::models::{InternalQueueType, MessageTracker, Offset};

use crate::error::Result;

/// Consume-side handle on one internal queue.
///
/// Implementations hand out [`MessageTracker`]s rather than bare messages:
/// the tracker owns the broker-side acknowledgement state and is retired
/// exactly once when delivery reaches a terminal outcome.
pub trait MessageSource: Send + Sync + 'static {
    /// Fetches up to `batch_size` messages in queue order.
    ///
    /// An empty vec means the queue has nothing ready right now; the loop
    /// decides when to poll again. Errors are transient broker faults and
    /// get retried with a backoff.
    fn fetch_messages(
        &self,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Box<dyn MessageTracker>>>> + Send + '_>>;
}

/// Produce-side handle on one internal queue.
///
/// Used for escalation writes: failed messages are re-produced into the
/// next queue in the retry ladder, or into the dead letter queue once the
/// ladder is exhausted.
pub trait Producer: Send + Sync + 'static {
    /// Appends `message` to the queue and resolves with its offset.
    fn produce(
        &self,
        message: stafett_core::models::Message,
    ) -> Pin<Box<dyn Future<Output = Result<Offset>> + Send + '_>>;
}

/// Builds sources and producers for a shard's internal queues.
///
/// Creation is async because implementations typically establish broker
/// connections here; the engine calls this once per queue while
/// connecting, before any loop starts.
pub trait TransportFactory: Send + Sync + 'static {
    /// Opens a consume handle on `queue_type`.
    fn create_source(
        &self,
        queue_type: InternalQueueType,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn MessageSource>>> + Send + '_>>;

    /// Opens a produce handle on `queue_type`.
    fn create_producer(
        &self,
        queue_type: InternalQueueType,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn Producer>>> + Send + '_>>;
}
