//! Outbox store seam.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use taskrelay_core::{Classify, ErrorClass, EventId};

use crate::event::OutboxEvent;

/// Outbox store failure.
#[derive(Debug, Error)]
pub enum OutboxStoreError {
    #[error("outbox event {0} not found")]
    NotFound(EventId),

    /// The event was not in the status the operation requires (e.g.
    /// releasing an event that is not `Processing`).
    #[error("illegal status transition for outbox event {id}: {detail}")]
    IllegalTransition { id: EventId, detail: String },

    #[error("outbox storage failure: {0}")]
    Storage(String),
}

impl Classify for OutboxStoreError {
    fn class(&self) -> ErrorClass {
        match self {
            // The event stays claimed or pending; a later tick or the
            // staleness sweep picks it up again.
            OutboxStoreError::Storage(_) => ErrorClass::Retryable,
            OutboxStoreError::NotFound(_) | OutboxStoreError::IllegalTransition { .. } => {
                ErrorClass::Ignorable
            }
        }
    }
}

/// Durable collection of outbox events.
///
/// The claim operation is the only cross-instance shared mutation and
/// relies solely on the store's single-document atomicity — safe only
/// under the stated single-active-poller assumption.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Atomically claim the oldest `Pending` event, moving it to
    /// `Processing` and stamping `claimed_at`. `None` when the outbox
    /// has no pending events.
    async fn claim_pending(&self) -> Result<Option<OutboxEvent>, OutboxStoreError>;

    /// `Processing → Sent` after a successful publish.
    async fn mark_sent(&self, id: EventId) -> Result<(), OutboxStoreError>;

    /// `Processing → Pending` after a failed publish; a later tick
    /// retries the event.
    async fn release(&self, id: EventId) -> Result<(), OutboxStoreError>;

    /// Reset events claimed longer than `older_than` ago back to
    /// `Pending`. Returns how many were reset.
    async fn reset_stale(&self, older_than: Duration) -> Result<usize, OutboxStoreError>;
}
