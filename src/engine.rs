use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::alarm::effects::AlarmEffects;
use crate::alarm::scheduler::{AlarmScheduler, TickOutcome};
use crate::storage::Storage;
use crate::task::TaskError;
use crate::task::history::MissedHistory;
use crate::task::model::{MissedEntry, Task, TaskDraft, TaskId};
use crate::task::status::{TaskStatus, classify};
use crate::task::store::TaskStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub status: TaskStatus,
    pub status_label: &'static str,
}

impl TaskView {
    fn new(task: &Task, now: DateTime<Utc>) -> Self {
        let status = classify(task, now);
        Self {
            task: task.clone(),
            status,
            status_label: status.label(),
        }
    }
}

/// Everything a renderer needs to draw one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub generated_at: DateTime<Utc>,
    pub tasks: Vec<TaskView>,
    pub announcements: Vec<TaskView>,
    pub missed: Vec<MissedEntry>,
    pub active_alarms: Vec<TaskId>,
    pub focused_task: Option<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    Create(TaskDraft),
    Update(TaskId, TaskDraft),
    BeginEdit(TaskId),
    Delete(TaskId),
    Acknowledge(TaskId),
    ActivateNotification(TaskId),
    ClearMissed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandReply {
    pub changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandReply {
    fn changed(changed: bool) -> Self {
        Self {
            changed,
            ..Self::default()
        }
    }

    fn rejected(err: TaskError) -> Self {
        Self {
            error: Some(err.to_string()),
            ..Self::default()
        }
    }
}

/// Sole owner of tasks, missed history and alarm state.
pub struct ReminderEngine<S: Storage, E: AlarmEffects> {
    tasks: TaskStore<S>,
    missed: MissedHistory<S>,
    scheduler: AlarmScheduler<E>,
    focused: Option<TaskId>,
}

impl<S: Storage + Clone, E: AlarmEffects> ReminderEngine<S, E> {
    pub fn load(storage: S, effects: E) -> Result<Self> {
        let tasks = TaskStore::load(storage.clone())?;
        let missed = MissedHistory::load(storage)?;
        info!(
            tasks = tasks.len(),
            missed = missed.len(),
            "reminder engine ready"
        );
        Ok(Self {
            tasks,
            missed,
            scheduler: AlarmScheduler::new(effects),
            focused: None,
        })
    }
}

impl<S: Storage, E: AlarmEffects> ReminderEngine<S, E> {
    pub fn create_task(&mut self, draft: TaskDraft, now: DateTime<Utc>) -> Result<TaskId, TaskError> {
        self.tasks.create(draft, now)
    }

    /// Silences a ringing alarm, then rewrites the task. The new deadline
    /// starts unacknowledged.
    pub fn update_task(&mut self, id: TaskId, draft: TaskDraft) -> Result<bool, TaskError> {
        if draft.title.trim().is_empty() {
            return Err(TaskError::EmptyTitle);
        }
        self.scheduler.silence(&mut self.tasks, id);
        self.tasks.update(id, draft)
    }

    pub fn begin_edit(&mut self, id: TaskId) -> bool {
        self.scheduler.silence(&mut self.tasks, id)
    }

    pub fn delete_task(&mut self, id: TaskId) -> bool {
        self.scheduler.forget(id);
        if self.focused == Some(id) {
            self.focused = None;
        }
        self.tasks.delete(id)
    }

    /// Dismisses a reached deadline's alarm. Future deadlines are left armed.
    pub fn acknowledge(&mut self, id: TaskId, now: DateTime<Utc>) -> bool {
        self.scheduler.acknowledge(&mut self.tasks, id, now)
    }

    pub fn clear_missed(&mut self) {
        self.missed.clear();
    }

    /// Brings the task behind a clicked notification into focus.
    pub fn activate_notification(&mut self, id: TaskId) -> bool {
        if self.tasks.get(id).is_none() {
            return false;
        }
        let shown = self.scheduler.activate(id);
        self.focused = Some(id);
        shown
    }

    pub fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        self.scheduler.tick(&mut self.tasks, &mut self.missed, now)
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> EngineSnapshot {
        EngineSnapshot {
            generated_at: now,
            tasks: self
                .tasks
                .sorted_by_deadline()
                .into_iter()
                .map(|task| TaskView::new(task, now))
                .collect(),
            announcements: self
                .tasks
                .overdue(now)
                .into_iter()
                .map(|task| TaskView::new(task, now))
                .collect(),
            missed: self.missed.entries().to_vec(),
            active_alarms: self.scheduler.active_alarms(),
            focused_task: self.focused,
        }
    }

    pub fn handle(&mut self, command: EngineCommand, now: DateTime<Utc>) -> CommandReply {
        match command {
            EngineCommand::Create(draft) => match self.create_task(draft, now) {
                Ok(id) => CommandReply {
                    changed: true,
                    task_id: Some(id),
                    error: None,
                },
                Err(err) => CommandReply::rejected(err),
            },
            EngineCommand::Update(id, draft) => match self.update_task(id, draft) {
                Ok(changed) => CommandReply {
                    changed,
                    task_id: Some(id),
                    error: None,
                },
                Err(err) => CommandReply::rejected(err),
            },
            EngineCommand::BeginEdit(id) => CommandReply::changed(self.begin_edit(id)),
            EngineCommand::Delete(id) => CommandReply::changed(self.delete_task(id)),
            EngineCommand::Acknowledge(id) => CommandReply::changed(self.acknowledge(id, now)),
            EngineCommand::ActivateNotification(id) => {
                CommandReply::changed(self.activate_notification(id))
            }
            EngineCommand::ClearMissed => {
                let had_entries = !self.missed.is_empty();
                self.clear_missed();
                CommandReply::changed(had_entries)
            }
        }
    }

    pub fn tasks(&self) -> &TaskStore<S> {
        &self.tasks
    }

    pub fn missed(&self) -> &MissedHistory<S> {
        &self.missed
    }

    pub fn effects(&self) -> &E {
        self.scheduler.effects()
    }
}
