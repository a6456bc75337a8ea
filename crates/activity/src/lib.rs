//! `taskrelay-activity` — the consuming side of the pipeline.
//!
//! Subscribes to the task-events queue, turns each event into a
//! human-readable activity record, and persists it. Acknowledgment is
//! explicit: a message leaves the queue only after the record is
//! stored (or recognized as a duplicate), so redeliveries from the
//! at-least-once producer are absorbed instead of dropped.

pub mod consumer;
pub mod record;
pub mod store;

pub use consumer::{ActivityConsumer, ConsumerConfig};
pub use record::ActivityRecord;
pub use store::{ActivityStore, ActivityStoreError, InMemoryActivityStore};
