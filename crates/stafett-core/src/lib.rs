//! Core domain model for the stafett delivery engine.
//!
//! Provides the internal queue hierarchy, message and tracker types, ordering
//! pointers, and the clock abstraction used by every time-driven component.
//! The delivery crate builds on these primitives; collaborator processes
//! implement the traits against them.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod models;
pub mod time;

pub use models::{
    ConsumptionStatus, GroupPointer, InternalQueueType, Message, MessageId, MessagePointer,
    MessageTracker, Offset,
};
pub use time::{Clock, RealClock, TestClock};
