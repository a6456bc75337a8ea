//! In-memory outbox store.
//!
//! Intended for tests/dev. Mirrors the semantics the pipeline expects
//! from the document store: atomic single-document status updates and a
//! multi-document transaction for the write path.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use taskrelay_core::EventId;
use taskrelay_events::TaskEvent;

use crate::event::{OutboxEvent, OutboxStatus};
use crate::store::{OutboxStore, OutboxStoreError};

#[derive(Default)]
struct OutboxState {
    events: HashMap<EventId, OutboxEvent>,
    /// Insertion order, so claims go oldest-first.
    order: Vec<EventId>,
}

/// In-memory outbox collection.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    state: RwLock<OutboxState>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a write-path transaction. Staged events become visible
    /// atomically on [`OutboxTransaction::commit`]; dropping the
    /// transaction (or an abort of the surrounding domain transaction)
    /// leaves no trace.
    pub fn begin(&self) -> OutboxTransaction<'_> {
        OutboxTransaction {
            store: self,
            staged: Vec::new(),
        }
    }

    /// Insert one event directly (already-committed write path).
    pub fn insert(&self, payload: TaskEvent) -> EventId {
        let event = OutboxEvent::new(payload);
        let id = event.id;
        let mut state = self.state.write().unwrap();
        state.order.push(id);
        state.events.insert(id, event);
        id
    }

    pub fn get(&self, id: EventId) -> Option<OutboxEvent> {
        self.state.read().unwrap().events.get(&id).cloned()
    }

    pub fn count_with_status(&self, status: OutboxStatus) -> usize {
        self.state
            .read()
            .unwrap()
            .events
            .values()
            .filter(|e| e.status == status)
            .count()
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Test hook: shift an event's claim timestamp into the past.
    #[cfg(test)]
    pub(crate) fn backdate_claim(&self, id: EventId, by: chrono::Duration) {
        let mut state = self.state.write().unwrap();
        if let Some(event) = state.events.get_mut(&id) {
            event.claimed_at = Some(Utc::now() - by);
        }
    }

    fn transition(
        &self,
        id: EventId,
        from: OutboxStatus,
        to: OutboxStatus,
    ) -> Result<(), OutboxStoreError> {
        let mut state = self.state.write().unwrap();
        let event = state
            .events
            .get_mut(&id)
            .ok_or(OutboxStoreError::NotFound(id))?;
        if event.status != from {
            return Err(OutboxStoreError::IllegalTransition {
                id,
                detail: format!("expected {from:?}, found {:?}", event.status),
            });
        }
        event.status = to;
        if to == OutboxStatus::Pending {
            event.claimed_at = None;
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn claim_pending(&self) -> Result<Option<OutboxEvent>, OutboxStoreError> {
        let mut state = self.state.write().unwrap();
        let order = state.order.clone();
        for id in order {
            if let Some(event) = state.events.get_mut(&id) {
                if event.status == OutboxStatus::Pending {
                    event.status = OutboxStatus::Processing;
                    event.claimed_at = Some(Utc::now());
                    return Ok(Some(event.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn mark_sent(&self, id: EventId) -> Result<(), OutboxStoreError> {
        self.transition(id, OutboxStatus::Processing, OutboxStatus::Sent)
    }

    async fn release(&self, id: EventId) -> Result<(), OutboxStoreError> {
        self.transition(id, OutboxStatus::Processing, OutboxStatus::Pending)
    }

    async fn reset_stale(&self, older_than: Duration) -> Result<usize, OutboxStoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| OutboxStoreError::Storage(e.to_string()))?;
        let mut state = self.state.write().unwrap();
        let mut reset = 0;
        for event in state.events.values_mut() {
            if event.status == OutboxStatus::Processing
                && event.claimed_at.is_some_and(|at| at < cutoff)
            {
                event.status = OutboxStatus::Pending;
                event.claimed_at = None;
                reset += 1;
            }
        }
        if reset > 0 {
            debug!(count = reset, "reset stale processing events");
        }
        Ok(reset)
    }
}

/// Staged outbox writes, committed together with the domain mutation.
pub struct OutboxTransaction<'a> {
    store: &'a InMemoryOutboxStore,
    staged: Vec<OutboxEvent>,
}

impl OutboxTransaction<'_> {
    /// Stage one event for insertion on commit.
    pub fn stage(&mut self, payload: TaskEvent) -> EventId {
        let event = OutboxEvent::new(payload);
        let id = event.id;
        self.staged.push(event);
        id
    }

    /// Make every staged event visible atomically.
    pub fn commit(self) {
        let mut state = self.store.state.write().unwrap();
        for event in self.staged {
            state.order.push(event.id);
            state.events.insert(event.id, event);
        }
    }

    /// Discard staged events. Equivalent to dropping the transaction.
    pub fn rollback(self) {}
}
