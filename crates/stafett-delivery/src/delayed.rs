//! Delayed message source for retry queues.
//!
//! Retry queues must not redeliver immediately: each message only becomes
//! ripe once `produced_at + delay` has passed. [`DelayedSource`] wraps the
//! queue's real source, buffers fetched messages, and holds a fetch open
//! until the head ripens. Ripeness is checked against [`Clock::now_system`]
//! so the wait is deterministic under a test clock.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use stafett_core::{models::MessageTracker, time::Clock};
use tracing::trace;

use crate::{error::Result, transport::MessageSource};

/// Wraps a [`MessageSource`] and withholds messages younger than `delay`.
///
/// Assumes the delegate yields messages in produced order; only the ripe
/// prefix of the buffer is released, so a younger head never unblocks an
/// older message behind it.
pub struct DelayedSource {
    delegate: Arc<dyn MessageSource>,
    clock: Arc<dyn Clock>,
    delay: Duration,
    buffer: Mutex<VecDeque<Box<dyn MessageTracker>>>,
}

impl DelayedSource {
    /// Creates a delayed view over `delegate` with the given ripening
    /// `delay`.
    pub fn new(delegate: Arc<dyn MessageSource>, clock: Arc<dyn Clock>, delay: Duration) -> Self {
        Self { delegate, clock, delay, buffer: Mutex::new(VecDeque::new()) }
    }

    fn ripe_at(&self, tracker: &dyn MessageTracker) -> SystemTime {
        SystemTime::from(tracker.message().produced_at) + self.delay
    }

    /// Time until the buffer head ripens. `None` when the buffer is empty
    /// or the head is already ripe.
    fn head_wait(&self) -> Option<Duration> {
        let buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        let head = buffer.front()?;
        let wait = self.ripe_at(head.as_ref()).duration_since(self.clock.now_system()).ok()?;
        if wait.is_zero() {
            None
        } else {
            Some(wait)
        }
    }

    fn drain_ripe(&self, batch_size: usize) -> Vec<Box<dyn MessageTracker>> {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now_system();
        let mut ripe = Vec::new();

        while ripe.len() < batch_size {
            let head_is_ripe = match buffer.front() {
                Some(head) => self.ripe_at(head.as_ref()) <= now,
                None => false,
            };
            if !head_is_ripe {
                break;
            }
            if let Some(head) = buffer.pop_front() {
                ripe.push(head);
            }
        }
        ripe
    }
}

impl MessageSource for DelayedSource {
    fn fetch_messages(
        &self,
        batch_size: usize,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<Box<dyn MessageTracker>>>> + Send + '_>>
    {
        Box::pin(async move {
            let buffered = {
                let buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
                buffer.len()
            };
            if buffered == 0 {
                let fetched = self.delegate.fetch_messages(batch_size).await?;
                if fetched.is_empty() {
                    return Ok(Vec::new());
                }
                trace!(count = fetched.len(), "buffered messages for ripening");
                self.buffer.lock().unwrap_or_else(|e| e.into_inner()).extend(fetched);
            }

            while let Some(wait) = self.head_wait() {
                trace!(wait_ms = wait.as_millis() as u64, "waiting for head to ripen");
                self.clock.sleep(wait).await;
            }

            Ok(self.drain_ripe(batch_size))
        })
    }
}
