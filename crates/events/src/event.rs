//! Task event payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taskrelay_core::{TaskId, UserId};

/// The event type tag.
///
/// Unknown tags deserialize into `Other` instead of failing: a consumer
/// must keep processing when a newer producer ships event types it does
/// not know yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskEventKind {
    TaskCreated,
    TaskUpdated,
    TaskCompleted,
    TaskAssigned,
    /// Forward compatibility: an unrecognized tag, carried verbatim.
    Other(String),
}

impl TaskEventKind {
    pub fn as_str(&self) -> &str {
        match self {
            TaskEventKind::TaskCreated => "TaskCreated",
            TaskEventKind::TaskUpdated => "TaskUpdated",
            TaskEventKind::TaskCompleted => "TaskCompleted",
            TaskEventKind::TaskAssigned => "TaskAssigned",
            TaskEventKind::Other(tag) => tag,
        }
    }
}

impl From<String> for TaskEventKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "TaskCreated" => TaskEventKind::TaskCreated,
            "TaskUpdated" => TaskEventKind::TaskUpdated,
            "TaskCompleted" => TaskEventKind::TaskCompleted,
            "TaskAssigned" => TaskEventKind::TaskAssigned,
            _ => TaskEventKind::Other(tag),
        }
    }
}

impl From<TaskEventKind> for String {
    fn from(kind: TaskEventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl core::fmt::Display for TaskEventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A domain event describing one task mutation.
///
/// Field names follow the wire contract: `type`, `taskId`, `userId`,
/// `taskTitle`, `assigneeId` (assignment events only), `timestamp`
/// (RFC 3339).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    #[serde(rename = "type")]
    pub kind: TaskEventKind,
    pub task_id: TaskId,
    pub user_id: UserId,
    pub task_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<UserId>,
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    pub fn new(
        kind: TaskEventKind,
        task_id: TaskId,
        user_id: UserId,
        task_title: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            task_id,
            user_id,
            task_title: task_title.into(),
            assignee_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn created(task_id: TaskId, user_id: UserId, task_title: impl Into<String>) -> Self {
        Self::new(TaskEventKind::TaskCreated, task_id, user_id, task_title)
    }

    pub fn updated(task_id: TaskId, user_id: UserId, task_title: impl Into<String>) -> Self {
        Self::new(TaskEventKind::TaskUpdated, task_id, user_id, task_title)
    }

    pub fn completed(task_id: TaskId, user_id: UserId, task_title: impl Into<String>) -> Self {
        Self::new(TaskEventKind::TaskCompleted, task_id, user_id, task_title)
    }

    pub fn assigned(
        task_id: TaskId,
        user_id: UserId,
        task_title: impl Into<String>,
        assignee_id: UserId,
    ) -> Self {
        let mut event = Self::new(TaskEventKind::TaskAssigned, task_id, user_id, task_title);
        event.assignee_id = Some(assignee_id);
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tags_round_trip_through_other() {
        let kind = TaskEventKind::from("TaskArchived".to_string());
        assert_eq!(kind, TaskEventKind::Other("TaskArchived".to_string()));
        assert_eq!(String::from(kind), "TaskArchived");
    }

    #[test]
    fn known_tags_parse_to_their_variant() {
        assert_eq!(
            TaskEventKind::from("TaskCreated".to_string()),
            TaskEventKind::TaskCreated
        );
        assert_eq!(
            TaskEventKind::from("TaskAssigned".to_string()),
            TaskEventKind::TaskAssigned
        );
    }
}
