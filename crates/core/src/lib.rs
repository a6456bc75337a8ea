//! `taskrelay-core` — shared building blocks for the delivery pipeline.
//!
//! This crate contains the pieces every process (producer and consumer)
//! needs: strongly-typed identifiers, the error classification used to
//! decide retry vs. propagation, and the retry/backoff policy.

pub mod error;
pub mod id;
pub mod retry;

pub use error::{Classify, ErrorClass};
pub use id::{EventId, TaskId, UserId};
pub use retry::RetryPolicy;
