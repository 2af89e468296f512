use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::task::model::{Task, TaskId, TimeDisplayMode, format_deadline};

const BELL_INTERVAL: Duration = Duration::from_millis(1_500);
const BELL_POLL: Duration = Duration::from_millis(100);

/// Audible and visual alarm output. The scheduler only ever hands over task
/// ids; whatever keeps an alarm alive stays inside the implementation.
pub trait AlarmEffects {
    fn start(&mut self, task: &Task);
    fn stop(&mut self, id: TaskId);
    /// The user clicked the notification for `id`. Closes it, jumps to the
    /// task and reports whether one was showing.
    fn activate(&mut self, id: TaskId) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub tag: String,
    pub task_id: TaskId,
    pub title: String,
    pub body: String,
}

impl Notification {
    pub fn for_task(task: &Task) -> Self {
        let due = match task.deadline {
            Some(_) => format_deadline(task.deadline, TimeDisplayMode::Hour24),
            None => "due now".to_string(),
        };
        Self {
            tag: notification_tag(task.id),
            task_id: task.id,
            title: "StudyHub Reminder".to_string(),
            body: format!("{} — {}", task.title, due),
        }
    }
}

pub fn notification_tag(id: TaskId) -> String {
    format!("studyhub-reminder-{id}")
}

/// Invoked with the task id when its notification is clicked.
pub type FocusCallback = Box<dyn FnMut(TaskId) + Send>;

struct BellHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl BellHandle {
    fn spawn(id: TaskId) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let join = thread::Builder::new()
            .name(format!("bell-{id}"))
            .spawn(move || run_bell_loop(stop_for_thread))
            .map_err(|err| warn!(task_id = %id, error = %err, "could not start alarm bell"))
            .ok();
        Self { stop, join }
    }
}

impl Drop for BellHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn run_bell_loop(stop: Arc<AtomicBool>) {
    let mut next_ring = Instant::now();
    while !stop.load(Ordering::Relaxed) {
        if Instant::now() >= next_ring {
            let mut stderr = std::io::stderr();
            let _ = stderr.write_all(b"\x07");
            let _ = stderr.flush();
            next_ring += BELL_INTERVAL;
        }
        thread::sleep(BELL_POLL);
    }
}

/// Terminal bell that repeats until stopped, plus a log-line notification.
pub struct BellEffects {
    silent: bool,
    bells: HashMap<TaskId, BellHandle>,
    notifications: HashMap<String, Notification>,
    on_focus: Option<FocusCallback>,
}

impl BellEffects {
    pub fn new(silent: bool) -> Self {
        Self {
            silent,
            bells: HashMap::new(),
            notifications: HashMap::new(),
            on_focus: None,
        }
    }

    pub fn with_focus_callback(mut self, callback: FocusCallback) -> Self {
        self.on_focus = Some(callback);
        self
    }

    pub fn notifications(&self) -> impl Iterator<Item = &Notification> {
        self.notifications.values()
    }

    #[cfg(test)]
    pub fn is_ringing(&self, id: TaskId) -> bool {
        self.bells.contains_key(&id)
    }
}

impl AlarmEffects for BellEffects {
    fn start(&mut self, task: &Task) {
        if !self.silent && !self.bells.contains_key(&task.id) {
            self.bells.insert(task.id, BellHandle::spawn(task.id));
        }

        let notification = Notification::for_task(task);
        info!(
            tag = %notification.tag,
            task_id = %task.id,
            "{}: {}",
            notification.title,
            notification.body
        );
        // Same tag replaces the previous notification.
        self.notifications
            .insert(notification.tag.clone(), notification);
    }

    fn stop(&mut self, id: TaskId) {
        if self.bells.remove(&id).is_some() {
            debug!(task_id = %id, "alarm bell stopped");
        }
        self.notifications.remove(&notification_tag(id));
    }

    fn activate(&mut self, id: TaskId) -> bool {
        if self.notifications.remove(&notification_tag(id)).is_none() {
            return false;
        }
        info!(task_id = %id, "notification activated");
        if let Some(callback) = self.on_focus.as_mut() {
            callback(id);
        }
        true
    }
}

#[cfg(test)]
pub mod recording {
    use super::AlarmEffects;
    use crate::task::model::{Task, TaskId};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum EffectCall {
        Start(TaskId),
        Stop(TaskId),
        Activate(TaskId),
    }

    /// Records calls instead of producing output.
    #[derive(Debug, Default)]
    pub struct RecordingEffects {
        pub calls: Vec<EffectCall>,
        live: Vec<TaskId>,
    }

    impl RecordingEffects {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn started(&self) -> Vec<TaskId> {
            self.calls
                .iter()
                .filter_map(|call| match call {
                    EffectCall::Start(id) => Some(*id),
                    _ => None,
                })
                .collect()
        }

        pub fn stopped(&self) -> Vec<TaskId> {
            self.calls
                .iter()
                .filter_map(|call| match call {
                    EffectCall::Stop(id) => Some(*id),
                    _ => None,
                })
                .collect()
        }

        pub fn is_live(&self, id: TaskId) -> bool {
            self.live.contains(&id)
        }
    }

    impl AlarmEffects for RecordingEffects {
        fn start(&mut self, task: &Task) {
            self.calls.push(EffectCall::Start(task.id));
            if !self.live.contains(&task.id) {
                self.live.push(task.id);
            }
        }

        fn stop(&mut self, id: TaskId) {
            self.calls.push(EffectCall::Stop(id));
            self.live.retain(|live| *live != id);
        }

        fn activate(&mut self, id: TaskId) -> bool {
            self.calls.push(EffectCall::Activate(id));
            self.live.contains(&id)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::task::model::TaskDraft;

    fn task(id: i64) -> Task {
        let deadline = Utc
            .with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
            .single()
            .expect("valid");
        Task::from_draft(
            TaskId(id),
            TaskDraft::new("Essay").with_deadline(deadline).with_alarm(true),
        )
    }

    #[test]
    fn repeat_start_replaces_notification() {
        let mut effects = BellEffects::new(true);
        effects.start(&task(1));
        effects.start(&task(1));
        assert_eq!(effects.notifications().count(), 1);
        assert!(!effects.is_ringing(TaskId(1)));
    }

    #[test]
    fn notification_is_tagged_per_task() {
        let notification = Notification::for_task(&task(9));
        assert_eq!(notification.tag, "studyhub-reminder-9");
        assert!(notification.body.starts_with("Essay — "));
    }

    #[test]
    fn bell_rings_until_stopped() {
        let mut effects = BellEffects::new(false);
        effects.start(&task(1));
        assert!(effects.is_ringing(TaskId(1)));
        effects.stop(TaskId(1));
        assert!(!effects.is_ringing(TaskId(1)));
        assert_eq!(effects.notifications().count(), 0);
    }

    #[test]
    fn activation_invokes_focus_callback_once() {
        let focused = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&focused);
        let mut effects = BellEffects::new(true).with_focus_callback(Box::new(move |id: TaskId| {
            if let Ok(mut guard) = sink.lock() {
                guard.push(id);
            }
        }));

        assert!(!effects.activate(TaskId(1)));
        effects.start(&task(1));
        assert!(effects.activate(TaskId(1)));
        assert!(!effects.activate(TaskId(1)));
        assert_eq!(*focused.lock().expect("lock"), vec![TaskId(1)]);
        assert_eq!(effects.notifications().count(), 0);
    }

    #[test]
    fn stop_without_start_is_harmless() {
        let mut effects = BellEffects::new(false);
        effects.stop(TaskId(3));
        assert!(!effects.is_ringing(TaskId(3)));
    }
}
