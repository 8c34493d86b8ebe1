//! Engine configuration.
//!
//! One `ConsumerConfig` describes a subscription shard: scheduling limits,
//! the retry-tier count, and the window geometry of the error-rate estimator
//! and the throttler. Defaults carry the engine's standard wiring: a 2s/1s
//! estimator window, a 1s/10ms throttler window, and a 5s redelivery delay
//! on retry tiers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, Result};

/// Configuration for one subscription shard's delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Maximum concurrently running push tasks.
    pub max_concurrency: usize,

    /// Backpressure cap: fetched-but-unretired messages across all queues.
    pub max_in_flight_messages: usize,

    /// Number of retry tiers; the escalation chain is
    /// `Main → Retry(1) → … → Retry(max_retry_attempts) → DeadLetter`.
    pub max_retry_attempts: u8,

    /// Messages requested per fetch.
    pub batch_size: usize,

    /// Sliding-window span of the error-rate estimator.
    pub estimator_window: Duration,

    /// Tick granularity of the estimator window.
    pub estimator_tick: Duration,

    /// Percentage of window throughput the estimator publishes as the
    /// failure-handling rate cap.
    pub pct_error_threshold: f32,

    /// Sliding-window span of the failure throttler.
    pub throttler_window: Duration,

    /// Tick granularity of the throttler window.
    pub throttler_tick: Duration,

    /// Permits per second the throttler starts with before the estimator
    /// publishes its first threshold.
    pub initial_threshold_per_sec: f32,

    /// Lower bound applied to every threshold the estimator publishes to the
    /// throttler, so a quiet window never stalls failure handling entirely.
    pub threshold_floor: f32,

    /// Redelivery delay applied by retry-tier sources, measured from each
    /// message's produce time.
    pub retry_delivery_delay: Duration,

    /// Pause before polling a queue again after an empty fetch.
    pub poll_interval: Duration,

    /// Produce attempts (including the first) when moving a failed message
    /// into its escalation queue.
    pub produce_retry_attempts: u32,

    /// Base backoff between produce attempts; doubles per attempt with
    /// jitter.
    pub produce_retry_base_delay: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: crate::DEFAULT_MAX_CONCURRENCY,
            max_in_flight_messages: crate::DEFAULT_MAX_IN_FLIGHT_MESSAGES,
            max_retry_attempts: crate::DEFAULT_MAX_RETRY_ATTEMPTS,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            estimator_window: Duration::from_millis(2000),
            estimator_tick: Duration::from_millis(1000),
            pct_error_threshold: 10.0,
            throttler_window: Duration::from_millis(1000),
            throttler_tick: Duration::from_millis(10),
            initial_threshold_per_sec: 1.0,
            threshold_floor: 1.0,
            retry_delivery_delay: Duration::from_millis(5000),
            poll_interval: Duration::from_millis(100),
            produce_retry_attempts: 3,
            produce_retry_base_delay: Duration::from_millis(100),
        }
    }
}

impl ConsumerConfig {
    /// Rejects values the engine cannot run with.
    ///
    /// Window/tick divisibility is checked by the components that own the
    /// windows; this covers the scheduler limits.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(DeliveryError::invalid_config("max_concurrency must be positive"));
        }
        if self.max_in_flight_messages == 0 {
            return Err(DeliveryError::invalid_config("max_in_flight_messages must be positive"));
        }
        if self.batch_size == 0 {
            return Err(DeliveryError::invalid_config("batch_size must be positive"));
        }
        if self.max_retry_attempts == 0 {
            return Err(DeliveryError::invalid_config("max_retry_attempts must be at least 1"));
        }
        if !(self.pct_error_threshold > 0.0 && self.pct_error_threshold <= 100.0) {
            return Err(DeliveryError::invalid_config(
                "pct_error_threshold must be within (0, 100]",
            ));
        }
        if self.produce_retry_attempts == 0 {
            return Err(DeliveryError::invalid_config("produce_retry_attempts must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ConsumerConfig::default();
        config.validate().expect("default config validates");
        assert_eq!(config.max_in_flight_messages, 64);
        assert_eq!(config.estimator_window, Duration::from_millis(2000));
        assert_eq!(config.throttler_tick, Duration::from_millis(10));
        assert_eq!(config.retry_delivery_delay, Duration::from_millis(5000));
    }

    #[test]
    fn zero_limits_rejected() {
        let config = ConsumerConfig { max_concurrency: 0, ..ConsumerConfig::default() };
        assert!(config.validate().is_err());

        let config = ConsumerConfig { batch_size: 0, ..ConsumerConfig::default() };
        assert!(config.validate().is_err());

        let config = ConsumerConfig { max_retry_attempts: 0, ..ConsumerConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn error_threshold_bounds_enforced() {
        let config = ConsumerConfig { pct_error_threshold: 0.0, ..ConsumerConfig::default() };
        assert!(config.validate().is_err());

        let config = ConsumerConfig { pct_error_threshold: 140.0, ..ConsumerConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config = ConsumerConfig::default();
        let json = serde_json::to_string(&config).expect("serialize");
        let back: ConsumerConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.max_concurrency, config.max_concurrency);
        assert_eq!(back.throttler_window, config.throttler_window);
    }
}
