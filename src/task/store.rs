use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::storage::{Storage, TASKS_KEY, decode_list, encode_list};
use crate::task::TaskError;
use crate::task::model::{Task, TaskDraft, TaskId};

/// The persisted task list. Every mutation rewrites the whole list.
pub struct TaskStore<S: Storage> {
    storage: S,
    tasks: Vec<Task>,
}

impl<S: Storage> TaskStore<S> {
    #[tracing::instrument(skip(storage))]
    pub fn load(storage: S) -> Result<Self> {
        let tasks = match storage.read(TASKS_KEY)? {
            Some(text) => decode_list::<Task>(TASKS_KEY, &text)
                .with_context(|| format!("failed to load '{TASKS_KEY}'"))?,
            None => Vec::new(),
        };
        debug!(count = tasks.len(), "loaded tasks");
        Ok(Self { storage, tasks })
    }

    pub fn create(&mut self, draft: TaskDraft, now: DateTime<Utc>) -> Result<TaskId, TaskError> {
        let draft = draft.normalized();
        if draft.title.is_empty() {
            return Err(TaskError::EmptyTitle);
        }

        let id = self.next_id(now);
        self.tasks.push(Task::from_draft(id, draft));
        info!(task_id = %id, "created task");
        self.persist();
        Ok(id)
    }

    /// Returns `Ok(false)` when no task has this id.
    pub fn update(&mut self, id: TaskId, draft: TaskDraft) -> Result<bool, TaskError> {
        let draft = draft.normalized();
        if draft.title.is_empty() {
            return Err(TaskError::EmptyTitle);
        }

        let Some(task) = self.tasks.iter_mut().find(|task| task.id == id) else {
            return Ok(false);
        };
        task.apply_draft(draft);
        info!(task_id = %id, "updated task");
        self.persist();
        Ok(true)
    }

    pub fn delete(&mut self, id: TaskId) -> bool {
        let before = self.tasks.len();
        self.tasks.retain(|task| task.id != id);
        if self.tasks.len() == before {
            return false;
        }
        info!(task_id = %id, "deleted task");
        self.persist();
        true
    }

    pub fn list(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Deadline ascending, undated tasks last. Ties keep insertion order.
    pub fn sorted_by_deadline(&self) -> Vec<&Task> {
        let mut sorted = self.tasks.iter().collect::<Vec<_>>();
        sorted.sort_by(|a, b| match (a.deadline, b.deadline) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        sorted
    }

    /// Tasks whose deadline has been reached.
    pub fn overdue(&self, now: DateTime<Utc>) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|task| task.deadline.is_some_and(|deadline| deadline <= now))
            .collect()
    }

    pub fn set_alarm_active(&mut self, id: TaskId, active: bool) -> bool {
        let Some(task) = self.tasks.iter_mut().find(|task| task.id == id) else {
            return false;
        };
        if task.alarm_active == active {
            return false;
        }
        task.alarm_active = active;
        self.persist();
        true
    }

    /// Marks the current deadline as handled. Returns `false` for unknown ids.
    pub fn acknowledge(&mut self, id: TaskId) -> bool {
        let Some(task) = self.tasks.iter_mut().find(|task| task.id == id) else {
            return false;
        };
        if task.alarm_acknowledged && !task.alarm_active {
            return true;
        }
        task.alarm_acknowledged = true;
        task.alarm_active = false;
        self.persist();
        true
    }

    fn next_id(&self, now: DateTime<Utc>) -> TaskId {
        let stamp = now.timestamp_millis();
        let newest = self.tasks.iter().map(|task| task.id.0).max();
        match newest {
            Some(newest) if newest >= stamp => TaskId(newest + 1),
            _ => TaskId(stamp),
        }
    }

    fn persist(&self) {
        let result = encode_list(&self.tasks).and_then(|text| self.storage.write(TASKS_KEY, &text));
        if let Err(err) = result {
            warn!(key = TASKS_KEY, error = %err, "failed to persist tasks");
        }
    }
}
