//! `taskrelay-events` — the task event payload and its wire encoding.
//!
//! One durable queue carries every task event; producer and consumer
//! agree on the JSON shape defined here and on nothing else.

pub mod event;
pub mod wire;

pub use event::{TaskEvent, TaskEventKind};
pub use wire::{TASK_EVENTS_QUEUE, WireError, decode, encode};
