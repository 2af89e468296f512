use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::task::model::Task;

/// How long after its deadline a task still counts as due.
pub const GRACE_WINDOW: chrono::Duration = chrono::Duration::minutes(5);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TaskStatus {
    Upcoming,
    Due,
    Dismissed,
    Missed,
}

impl TaskStatus {
    pub fn key(self) -> &'static str {
        match self {
            TaskStatus::Upcoming => "upcoming",
            TaskStatus::Due => "due",
            TaskStatus::Dismissed => "dismissed",
            TaskStatus::Missed => "missed",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskStatus::Upcoming => "Upcoming",
            TaskStatus::Due => "Due now",
            TaskStatus::Dismissed => "Dismissed",
            TaskStatus::Missed => "Missed",
        }
    }
}

impl Serialize for TaskStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.key())
    }
}

pub fn classify(task: &Task, now: DateTime<Utc>) -> TaskStatus {
    let Some(deadline) = task.deadline else {
        return TaskStatus::Upcoming;
    };
    if deadline > now {
        return TaskStatus::Upcoming;
    }
    if now - deadline <= GRACE_WINDOW {
        TaskStatus::Due
    } else if task.alarm_acknowledged {
        TaskStatus::Dismissed
    } else {
        TaskStatus::Missed
    }
}
