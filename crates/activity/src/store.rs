//! Activity store seam and in-memory implementation.

use std::collections::HashSet;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use taskrelay_core::{Classify, ErrorClass, TaskId};
use taskrelay_events::TaskEventKind;

use crate::record::ActivityRecord;

#[derive(Debug, Error)]
pub enum ActivityStoreError {
    /// A creation record for this task already exists. Raised by the
    /// uniqueness constraint on (task, `TaskCreated`); the redelivered
    /// event was already processed and must be acknowledged, not
    /// retried.
    #[error("activity for creation of task {0} already recorded")]
    DuplicateCreation(TaskId),

    #[error("activity storage failure: {0}")]
    Storage(String),
}

impl Classify for ActivityStoreError {
    fn class(&self) -> ErrorClass {
        match self {
            ActivityStoreError::DuplicateCreation(_) => ErrorClass::Ignorable,
            ActivityStoreError::Storage(_) => ErrorClass::Retryable,
        }
    }
}

/// Durable collection of activity records.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Insert one record. Fails with
    /// [`ActivityStoreError::DuplicateCreation`] when a `TaskCreated`
    /// record for the same task already exists.
    async fn insert(&self, record: ActivityRecord) -> Result<(), ActivityStoreError>;
}

#[derive(Default)]
struct ActivityState {
    records: Vec<ActivityRecord>,
    /// Tasks with a `TaskCreated` record, mirroring the partial unique
    /// index the document store enforces.
    created: HashSet<TaskId>,
}

/// In-memory activity collection for tests/dev.
#[derive(Default)]
pub struct InMemoryActivityStore {
    state: RwLock<ActivityState>,
    fail_inserts: AtomicU32,
}

impl InMemoryActivityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` inserts fail with a storage error.
    pub fn fail_next_inserts(&self, n: u32) {
        self.fail_inserts.store(n, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<ActivityRecord> {
        self.state.read().unwrap().records.clone()
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ActivityStore for InMemoryActivityStore {
    async fn insert(&self, record: ActivityRecord) -> Result<(), ActivityStoreError> {
        let remaining = self.fail_inserts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_inserts.store(remaining - 1, Ordering::SeqCst);
            return Err(ActivityStoreError::Storage(
                "storage unavailable".to_string(),
            ));
        }
        let mut state = self.state.write().unwrap();
        if record.event_type == TaskEventKind::TaskCreated
            && !state.created.insert(record.task_id.clone())
        {
            return Err(ActivityStoreError::DuplicateCreation(record.task_id));
        }
        debug!(task = %record.task_id, kind = %record.event_type, "activity recorded");
        state.records.push(record);
        Ok(())
    }
}
