//! Outbox event entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taskrelay_core::EventId;
use taskrelay_events::TaskEvent;

/// Relay status of an outbox event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    /// Recorded, waiting for the poller.
    Pending,
    /// Claimed by the poller; publish in flight.
    Processing,
    /// Published to the broker.
    Sent,
}

/// A durably recorded intent to publish one task event.
///
/// Created inside the same transaction as the domain mutation it
/// describes; mutated only by the poller; never deleted here (retention
/// is an external concern).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: EventId,
    pub payload: TaskEvent,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    /// When the poller last claimed this event. Drives the staleness
    /// sweep that rescues events orphaned in `Processing`.
    pub claimed_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    pub fn new(payload: TaskEvent) -> Self {
        Self {
            id: EventId::new(),
            payload,
            status: OutboxStatus::Pending,
            created_at: Utc::now(),
            claimed_at: None,
        }
    }
}
