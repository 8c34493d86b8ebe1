//! Push client abstraction for delivering messages to subscribers.
//!
//! The consumption loop treats a push as infallible at the type level:
//! implementations map transport failures into a non-success
//! [`PushResponse`] so that retry and escalation decisions flow through one
//! status check instead of two error channels.

use std::{future::Future, pin::Pin};

use bytes::Bytes;
use stafett_core::models::Message;

/// Outcome of pushing one message to the subscriber endpoint.
#[derive(Debug, Clone)]
pub struct PushResponse {
    /// HTTP-style status code. Implementations report transport failures
    /// as a non-success code rather than panicking or erroring.
    pub status_code: u16,
    /// Response body, kept for diagnostics on failures.
    pub body: Bytes,
}

impl PushResponse {
    /// A bare success with an empty body.
    pub fn ok() -> Self {
        Self { status_code: 200, body: Bytes::new() }
    }

    /// A response with an explicit status and body.
    pub fn with_status(status_code: u16, body: impl Into<Bytes>) -> Self {
        Self { status_code, body: body.into() }
    }

    /// A transport-level failure surfaced as an unavailable status.
    pub fn unreachable(detail: impl Into<Bytes>) -> Self {
        Self { status_code: 503, body: detail.into() }
    }

    /// Whether the subscriber accepted the message.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Delivers messages to the subscriber endpoint.
///
/// One client instance serves a whole shard; pushes for different messages
/// may run concurrently up to the limiter's cap.
pub trait PushClient: Send + Sync + 'static {
    /// Pushes a single message and resolves with the subscriber's verdict.
    ///
    /// Never errors: connection resets, timeouts, and demarshalling
    /// problems all come back as a non-success response.
    fn push(&self, message: &Message) -> Pin<Box<dyn Future<Output = PushResponse> + Send + '_>>;
}
