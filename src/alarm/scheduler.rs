use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::alarm::effects::AlarmEffects;
use crate::storage::Storage;
use crate::task::history::MissedHistory;
use crate::task::model::{MissedEntry, Task, TaskId};
use crate::task::status::GRACE_WINDOW;
use crate::task::store::TaskStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickOutcome {
    pub triggered: usize,
    pub expired: usize,
    pub missed_logged: usize,
}

impl TickOutcome {
    pub fn is_quiet(&self) -> bool {
        self.triggered == 0 && self.expired == 0 && self.missed_logged == 0
    }
}

enum TickAction {
    Trigger(TaskId),
    Expire(TaskId),
}

/// Drives alarm effects from task deadlines. Holds only task ids; the
/// effect provider owns whatever keeps an alarm audible.
pub struct AlarmScheduler<E: AlarmEffects> {
    effects: E,
    ringing: BTreeSet<TaskId>,
}

impl<E: AlarmEffects> AlarmScheduler<E> {
    pub fn new(effects: E) -> Self {
        Self {
            effects,
            ringing: BTreeSet::new(),
        }
    }

    pub fn tick<S: Storage>(
        &mut self,
        tasks: &mut TaskStore<S>,
        missed: &mut MissedHistory<S>,
        now: DateTime<Utc>,
    ) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        // Ringing ids whose task went away or stopped participating, plus
        // stored flags that no longer hold (loaded from disk or edited
        // outside this process).
        let mut stale = self
            .ringing
            .iter()
            .copied()
            .filter(|id| !tasks.get(*id).is_some_and(participates))
            .collect::<Vec<_>>();
        stale.extend(
            tasks
                .list()
                .iter()
                .filter(|task| task.alarm_active && !active_flag_holds(task, now))
                .map(|task| task.id),
        );
        for id in stale {
            self.release(id);
            tasks.set_alarm_active(id, false);
        }

        let mut actions = Vec::new();
        for task in tasks.list() {
            if !participates(task) {
                continue;
            }
            let Some(deadline) = task.deadline else {
                continue;
            };
            if now < deadline {
                continue;
            }
            if now - deadline <= GRACE_WINDOW {
                // Also re-arms a flag left active by a previous process.
                if !self.ringing.contains(&task.id) {
                    actions.push(TickAction::Trigger(task.id));
                }
            } else {
                actions.push(TickAction::Expire(task.id));
            }
        }

        for action in actions {
            match action {
                TickAction::Trigger(id) => {
                    tasks.set_alarm_active(id, true);
                    if let Some(task) = tasks.get(id) {
                        self.effects.start(task);
                    }
                    self.ringing.insert(id);
                    outcome.triggered += 1;
                }
                TickAction::Expire(id) => {
                    let was_ringing = self.release(id);
                    let flag_cleared = tasks.set_alarm_active(id, false);
                    if was_ringing || flag_cleared {
                        outcome.expired += 1;
                    }
                    if missed.contains(id) {
                        continue;
                    }
                    let Some(task) = tasks.get(id) else {
                        continue;
                    };
                    if missed.record(MissedEntry::snapshot(task, now)) {
                        outcome.missed_logged += 1;
                    }
                }
            }
        }

        outcome
    }

    /// Dismisses the alarm for the current deadline. Idempotent. A deadline
    /// that has not been reached yet cannot be dismissed.
    pub fn acknowledge<S: Storage>(
        &mut self,
        tasks: &mut TaskStore<S>,
        id: TaskId,
        now: DateTime<Utc>,
    ) -> bool {
        let reached = tasks
            .get(id)
            .and_then(|task| task.deadline)
            .is_some_and(|deadline| deadline <= now);
        if !reached {
            return false;
        }
        self.release(id);
        tasks.acknowledge(id)
    }

    /// Stops the alarm without acknowledging it, ahead of an edit.
    pub fn silence<S: Storage>(&mut self, tasks: &mut TaskStore<S>, id: TaskId) -> bool {
        self.release(id);
        tasks.set_alarm_active(id, false);
        tasks.get(id).is_some()
    }

    /// Tears down effects for a task that is going away.
    pub fn forget(&mut self, id: TaskId) {
        self.release(id);
    }

    pub fn activate(&mut self, id: TaskId) -> bool {
        self.effects.activate(id)
    }

    pub fn active_alarms(&self) -> Vec<TaskId> {
        self.ringing.iter().copied().collect()
    }

    #[cfg(test)]
    pub fn is_ringing(&self, id: TaskId) -> bool {
        self.ringing.contains(&id)
    }

    pub fn effects(&self) -> &E {
        &self.effects
    }

    fn release(&mut self, id: TaskId) -> bool {
        if !self.ringing.remove(&id) {
            return false;
        }
        debug!(task_id = %id, "stopping alarm effects");
        self.effects.stop(id);
        true
    }
}

fn participates(task: &Task) -> bool {
    task.deadline.is_some() && task.alarm_enabled && !task.alarm_acknowledged
}

/// `alarmActive` is only valid on a participating task whose deadline passed.
fn active_flag_holds(task: &Task, now: DateTime<Utc>) -> bool {
    participates(task) && task.deadline.is_some_and(|deadline| deadline <= now)
}
