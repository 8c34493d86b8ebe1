//! Domain types for one subscription shard of the delivery engine.
//!
//! A shard consumes from a hierarchy of internal queues: the main queue, an
//! ordered sequence of retry queues, and a dead-letter queue. Messages move
//! strictly down that chain on failure. The types here model the queues, the
//! messages flowing through them, and the tracker handle through which the
//! storage layer learns each message's fate.

use std::{collections::HashMap, fmt};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Generates a new random message ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a message within one internal queue's topic.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Offset(pub u64);

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stage in the failure-escalation chain of a subscription shard.
///
/// `Retry(n)` is 1-based and bounded by the shard's configured maximum retry
/// attempts. `DeadLetter` is terminal: it is produced into but never consumed,
/// so it appears in no priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InternalQueueType {
    /// The subscription's primary queue.
    Main,
    /// The n-th retry tier, `1 ≤ n ≤ max_retry`.
    Retry(u8),
    /// Terminal queue for messages that exhausted every retry tier.
    DeadLetter,
}

impl InternalQueueType {
    /// Builds the scheduling priority order for a shard with `max_retry`
    /// retry tiers.
    ///
    /// Deeper retry tiers hold the oldest, most-delayed messages, so they
    /// drain first: `[Retry(max_retry), …, Retry(1), Main]`. The order is
    /// computed once per shard and shared by the concurrency limiter and the
    /// throttler.
    pub fn priority_order(max_retry: u8) -> Vec<InternalQueueType> {
        let mut order = Vec::with_capacity(1 + usize::from(max_retry));
        order.push(InternalQueueType::Main);
        for attempt in 1..=max_retry {
            order.push(InternalQueueType::Retry(attempt));
        }
        order.reverse();
        order
    }

    /// Returns the queue a message failing in `self` escalates into.
    ///
    /// `Main` escalates to the first retry tier, `Retry(r)` to `Retry(r + 1)`
    /// until `max_retry` is reached, then to `DeadLetter`. Returns `None` for
    /// `DeadLetter` itself: nothing escalates out of the terminal queue, and
    /// reaching it here is a caller bug.
    pub fn escalation_target(self, max_retry: u8) -> Option<InternalQueueType> {
        match self {
            InternalQueueType::Main => Some(InternalQueueType::Retry(1)),
            InternalQueueType::Retry(attempt) if attempt < max_retry => {
                Some(InternalQueueType::Retry(attempt + 1))
            },
            InternalQueueType::Retry(_) => Some(InternalQueueType::DeadLetter),
            InternalQueueType::DeadLetter => None,
        }
    }

    /// True for retry tiers.
    pub fn is_retry(self) -> bool {
        matches!(self, InternalQueueType::Retry(_))
    }
}

impl fmt::Display for InternalQueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InternalQueueType::Main => write!(f, "main"),
            InternalQueueType::Retry(attempt) => write!(f, "retry-{attempt}"),
            InternalQueueType::DeadLetter => write!(f, "dead-letter"),
        }
    }
}

/// Final status recorded on a tracker when its message retires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumptionStatus {
    /// The destination accepted the message.
    Sent,
    /// The push failed and the message was escalated to the next queue.
    Failed,
    /// A sibling in the message's ordered group had already failed, so the
    /// message skipped its push and followed the group into its failure
    /// queue.
    GroupFailed,
}

impl ConsumptionStatus {
    /// String form used in logs and serialized records.
    pub fn as_str(self) -> &'static str {
        match self {
            ConsumptionStatus::Sent => "sent",
            ConsumptionStatus::Failed => "failed",
            ConsumptionStatus::GroupFailed => "group_failed",
        }
    }
}

impl fmt::Display for ConsumptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of one message occurrence, as reported to the ordering
/// collaborator: the queue it sits in and its offset there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePointer {
    /// Queue the occurrence belongs to.
    pub queue: InternalQueueType,
    /// Offset within that queue's topic.
    pub offset: Offset,
}

impl MessagePointer {
    /// Creates a pointer into `queue` at `offset`.
    pub fn new(queue: InternalQueueType, offset: Offset) -> Self {
        Self { queue, offset }
    }
}

/// A message pulled from an internal queue.
///
/// `produced_at` is the wall-clock time the current occurrence was produced
/// into its queue; retry tiers use it to hold messages back for their
/// redelivery delay.
#[derive(Debug, Clone)]
pub struct Message {
    /// Stable identity across escalations.
    pub id: MessageId,
    /// Ordering group, when the subscription is grouped.
    pub group_id: Option<String>,
    /// Opaque payload forwarded to the destination.
    pub payload: Bytes,
    /// Headers forwarded to the destination.
    pub headers: HashMap<String, String>,
    /// Produce time of this occurrence.
    pub produced_at: DateTime<Utc>,
}

impl Message {
    /// Creates an ungrouped message with a fresh ID and empty headers.
    pub fn new(payload: impl Into<Bytes>, produced_at: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::new(),
            group_id: None,
            payload: payload.into(),
            headers: HashMap::new(),
            produced_at,
        }
    }

    /// Assigns the message to an ordering group.
    #[must_use]
    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Handle through which the engine reports a fetched message's lifecycle back
/// to the storage layer.
///
/// A tracker is created per fetched occurrence and retired exactly once via
/// [`MessageTracker::on_consumed`]; it is never reused. Implementations
/// typically acknowledge or commit the underlying consumer position there.
pub trait MessageTracker: Send + 'static {
    /// The tracked message.
    fn message(&self) -> &Message;

    /// Offset of this occurrence in the queue it was fetched from.
    fn offset(&self) -> Offset;

    /// Called when the engine begins pushing the message from `queue`.
    fn on_consume_start(&mut self, queue: InternalQueueType);

    /// Retires the tracker with the message's final status.
    fn on_consumed(self: Box<Self>, status: ConsumptionStatus);
}

/// Per-message verdict from the ordering collaborator.
///
/// Populated for each fetched message before pushing; a failed verdict names
/// the queue the message's group previously failed into, and the message must
/// follow it there without a push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupPointer {
    failed_into: Option<InternalQueueType>,
}

impl GroupPointer {
    /// Verdict for a group with no recorded failure.
    pub fn healthy() -> Self {
        Self { failed_into: None }
    }

    /// Verdict for a group that already failed into `queue`.
    pub fn failed(queue: InternalQueueType) -> Self {
        Self { failed_into: Some(queue) }
    }

    /// The queue this message's group already failed into, if any.
    pub fn failed_into(&self) -> Option<InternalQueueType> {
        self.failed_into
    }
}
