//! Group ordering state shared across a shard's consumption loops.
//!
//! Grouped messages must not overtake an earlier failed message from the
//! same group. The first failure pins the group to the queue the message
//! escalated into; later messages from that group skip their push and
//! follow it there directly, preserving order. A success from the pinned
//! queue releases the group.

use std::{future::Future, pin::Pin};

use stafett_core::models::{GroupPointer, InternalQueueType, MessagePointer};

use crate::error::Result;

/// Lookup and update surface for per-group failure pointers.
///
/// One instance is shared by every loop in the shard, so an update for one
/// queue is visible to fetches from another. Lookups are synchronous
/// against local state because they sit on the hot partitioning path;
/// updates may replicate and are async.
pub trait GroupOrderingState: Send + Sync + 'static {
    /// Resolves the pointer for `group_id`. Unknown groups are healthy by
    /// definition.
    fn pointer_for(&self, group_id: &str) -> GroupPointer;

    /// Records a successful delivery of a message from `group_id`.
    ///
    /// `consumed_from` names the occurrence that was delivered. When it
    /// comes from the queue the group is pinned to, the pin is released
    /// and the group is healthy again.
    fn message_consumed(
        &self,
        group_id: &str,
        consumed_from: MessagePointer,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Records that a message from `group_id` moved queues on failure.
    ///
    /// The occurrence at `consumed_from` was re-produced at `produced_to`
    /// inside `failed_into`; the group is pinned to `failed_into` until a
    /// success from there releases it.
    fn message_transitioned(
        &self,
        group_id: &str,
        consumed_from: MessagePointer,
        failed_into: InternalQueueType,
        produced_to: MessagePointer,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}
