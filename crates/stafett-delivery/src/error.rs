//! Error types for the delivery engine.
//!
//! Covers configuration faults rejected at construction, lifecycle misuse,
//! and the collaborator failures (fetch, produce) that survive the engine's
//! own retry handling. Push failures are deliberately absent: a destination
//! rejecting a message is the expected failure path and travels as a
//! [`crate::client::PushResponse`], not an error.

use std::fmt;

use stafett_core::models::{InternalQueueType, MessageId};
use thiserror::Error;

/// Result type alias for delivery-engine operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error conditions raised by the delivery engine.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Window size is not an integer multiple of the tick size.
    #[error("window of {window_ms}ms is not a multiple of the {tick_ms}ms tick")]
    InvalidWindow {
        /// Configured window duration in milliseconds
        window_ms: u64,
        /// Configured tick duration in milliseconds
        tick_ms: u64,
    },

    /// A configuration value is out of range.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the rejected value
        message: String,
    },

    /// A lifecycle operation was called in a state that does not allow it.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// The operation that was attempted
        operation: String,
        /// The engine state at the time
        state: String,
    },

    /// Fetching from a queue's message source failed.
    #[error("fetch from {queue} failed: {message}")]
    FetchFailed {
        /// Queue whose source failed
        queue: InternalQueueType,
        /// Source error message
        message: String,
    },

    /// Producing a message into its escalation queue failed after every
    /// retry attempt.
    #[error("produce of {message_id} to {queue} failed after {attempts} attempts: {message}")]
    ProduceFailed {
        /// Identity of the message that could not be moved
        message_id: MessageId,
        /// Escalation queue that rejected the produce
        queue: InternalQueueType,
        /// Produce attempts made, including the first
        attempts: u32,
        /// Last producer error message
        message: String,
    },

    /// A single produce attempt failed; raised by producers and retried by
    /// the engine up to its configured attempt budget.
    #[error("produce rejected: {message}")]
    ProduceRejected {
        /// Producer error message
        message: String,
    },

    /// The engine is shutting down and no longer accepts work.
    #[error("engine shutdown requested")]
    ShutdownRequested,

    /// Invariant violation inside the engine.
    #[error("internal delivery error: {message}")]
    Internal {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a window misconfiguration error.
    pub fn invalid_window(window_ms: u64, tick_ms: u64) -> Self {
        Self::InvalidWindow { window_ms, tick_ms }
    }

    /// Creates a configuration error from a message.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig { message: message.into() }
    }

    /// Creates an invalid lifecycle-transition error.
    pub fn invalid_state(operation: impl Into<String>, state: impl Into<String>) -> Self {
        Self::InvalidState { operation: operation.into(), state: state.into() }
    }

    /// Creates a fetch failure from a source error.
    pub fn fetch_failed(queue: InternalQueueType, message: impl Into<String>) -> Self {
        Self::FetchFailed { queue, message: message.into() }
    }

    /// Creates an exhausted-produce error.
    pub fn produce_failed(
        message_id: MessageId,
        queue: InternalQueueType,
        attempts: u32,
        message: impl Into<String>,
    ) -> Self {
        Self::ProduceFailed { message_id, queue, attempts, message: message.into() }
    }

    /// Creates a single-attempt produce rejection.
    pub fn produce_rejected(message: impl Into<String>) -> Self {
        Self::ProduceRejected { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether the condition is temporary and worth retrying.
    ///
    /// Fetch failures and individual produce rejections are transient
    /// collaborator trouble; configuration and lifecycle faults, exhausted
    /// produces, and internal invariant violations are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::FetchFailed { .. } | Self::ProduceRejected { .. } => true,

            Self::InvalidWindow { .. }
            | Self::InvalidConfig { .. }
            | Self::InvalidState { .. }
            | Self::ProduceFailed { .. }
            | Self::ShutdownRequested
            | Self::Internal { .. } => false,
        }
    }
}

/// Coarse error grouping for logs and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rejected configuration.
    Configuration,
    /// Lifecycle misuse.
    Lifecycle,
    /// Storage-layer collaborator failure.
    Transport,
    /// Internal engine fault.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::InvalidWindow { .. } | DeliveryError::InvalidConfig { .. } => {
                Self::Configuration
            },
            DeliveryError::InvalidState { .. } | DeliveryError::ShutdownRequested => {
                Self::Lifecycle
            },
            DeliveryError::FetchFailed { .. }
            | DeliveryError::ProduceFailed { .. }
            | DeliveryError::ProduceRejected { .. } => Self::Transport,
            DeliveryError::Internal { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Lifecycle => write!(f, "lifecycle"),
            Self::Transport => write!(f, "transport"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
