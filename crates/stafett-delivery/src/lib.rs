//! Consumer-side delivery engine for one subscription shard.
//!
//! This crate implements the consumption half of a subscription: it fetches
//! messages from the shard's internal queues, pushes them to the
//! subscriber's endpoint, and escalates failures down the retry chain until
//! they land in the dead-letter queue.
//!
//! # Architecture
//!
//! The engine runs one consumption loop per consumable queue (main plus
//! each retry tier) on a shared single-threaded event context. Each loop
//! drives the complete message lifecycle:
//!
//! 1. **Fetch** - Pull a batch from the queue, bounded by the in-flight cap
//! 2. **Push** - Deliver to the endpoint through the priority-aware
//!    concurrency limiter
//! 3. **Escalate** - Produce failures into the next retry tier, throttled
//!    by the observed error rate
//! 4. **Retire** - Record the terminal status on the message's tracker
//!
//! # Key Features
//!
//! - **Bounded Concurrency** - One limiter caps simultaneous pushes across
//!   all queues, draining deeper retry tiers first
//! - **Adaptive Failure Throttling** - A sliding-window error-rate
//!   estimator feeds the failure throttler, so error handling slows down
//!   when the endpoint degrades
//! - **Ordered Groups** - Grouped subscriptions pin a failed group to its
//!   failure queue; siblings follow it without a push attempt
//! - **Delayed Redelivery** - Retry tiers hold messages back until their
//!   redelivery delay elapses
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stafett_core::time::RealClock;
//! use stafett_delivery::{
//!     testkit::{InMemoryGroupState, InMemoryTransport, ScriptedPushClient},
//!     ConsumerConfig, ConsumerEngine,
//! };
//!
//! # async fn example() -> stafett_delivery::Result<()> {
//! let mut engine = ConsumerEngine::new(
//!     ConsumerConfig::default(),
//!     Arc::new(RealClock::new()),
//!     Arc::new(InMemoryTransport::new(3)),
//!     Arc::new(ScriptedPushClient::new()),
//!     Arc::new(InMemoryGroupState::new()),
//! );
//!
//! engine.connect().await?;
//! engine.start()?;
//! // ... messages flow until ...
//! engine.close().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod consumption;
pub mod context;
pub mod delayed;
pub mod engine;
pub mod error;
pub mod estimator;
pub mod limiter;
pub mod ordering;
pub mod testkit;
pub mod throttler;
pub mod transport;
pub mod window;

// Re-export main public API
pub use config::ConsumerConfig;
pub use engine::{ConsumerEngine, EngineState, EngineStats};
pub use error::{DeliveryError, Result};

/// Default cap on simultaneous push executions.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Default cap on fetched-but-unretired messages per queue.
pub const DEFAULT_MAX_IN_FLIGHT_MESSAGES: usize = 64;

/// Default number of retry tiers before the dead-letter queue.
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u8 = 3;

/// Default batch size for fetching from a queue.
pub const DEFAULT_BATCH_SIZE: usize = 16;
