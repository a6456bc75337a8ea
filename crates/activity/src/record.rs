//! Activity record derived from a task event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use taskrelay_core::{TaskId, UserId};
use taskrelay_events::{TaskEvent, TaskEventKind};

/// One row of the activity feed.
///
/// Carries both the rendered description and the raw event as `details`
/// so later consumers can re-render without replaying the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    pub event_type: TaskEventKind,
    pub user_id: UserId,
    pub task_id: TaskId,
    pub task_title: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub details: Value,
}

impl ActivityRecord {
    pub fn from_event(event: &TaskEvent) -> Self {
        Self {
            event_type: event.kind.clone(),
            user_id: event.user_id.clone(),
            task_id: event.task_id.clone(),
            task_title: event.task_title.clone(),
            description: describe(event),
            timestamp: event.timestamp,
            details: serde_json::to_value(event).unwrap_or(Value::Null),
        }
    }
}

/// Human-readable description of an event.
///
/// Unknown event types still produce a record; skipping them would
/// silently drop history whenever the producer learns a new event type
/// before the consumer does.
pub fn describe(event: &TaskEvent) -> String {
    match &event.kind {
        TaskEventKind::TaskCreated => {
            format!("Task \"{}\" was created.", event.task_title)
        }
        TaskEventKind::TaskUpdated => {
            format!("Task \"{}\" was updated.", event.task_title)
        }
        TaskEventKind::TaskCompleted => {
            format!("Task \"{}\" was completed.", event.task_title)
        }
        TaskEventKind::TaskAssigned => match &event.assignee_id {
            Some(assignee) => format!(
                "Task \"{}\" was assigned to {}.",
                event.task_title, assignee
            ),
            None => format!("Task \"{}\" was assigned.", event.task_title),
        },
        TaskEventKind::Other(_) => {
            format!("An unknown action occurred for task {}.", event.task_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_events_render_the_title() {
        let event = TaskEvent::created(TaskId::new("t1"), UserId::new("u1"), "Ship it");
        assert_eq!(describe(&event), "Task \"Ship it\" was created.");
    }

    #[test]
    fn assignment_names_the_assignee() {
        let event = TaskEvent::assigned(
            TaskId::new("t1"),
            UserId::new("u1"),
            "Ship it",
            UserId::new("u2"),
        );
        assert_eq!(describe(&event), "Task \"Ship it\" was assigned to u2.");
    }

    #[test]
    fn unknown_kinds_fall_back_to_a_generic_description() {
        let mut event = TaskEvent::created(TaskId::new("t9"), UserId::new("u1"), "x");
        event.kind = TaskEventKind::Other("TaskArchived".to_string());
        assert_eq!(
            describe(&event),
            "An unknown action occurred for task t9."
        );
    }

    #[test]
    fn from_event_embeds_the_raw_payload() {
        let event = TaskEvent::completed(TaskId::new("t1"), UserId::new("u1"), "done");
        let record = ActivityRecord::from_event(&event);
        assert_eq!(record.event_type, TaskEventKind::TaskCompleted);
        assert_eq!(record.details["type"], "TaskCompleted");
        assert_eq!(record.details["taskId"], "t1");
    }
}
