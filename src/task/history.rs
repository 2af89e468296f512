use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::storage::{MISSED_KEY, Storage, decode_list, encode_list};
use crate::task::model::{MissedEntry, TaskId};

pub const MISSED_HISTORY_CAP: usize = 200;

/// Newest-first log of tasks that went past their grace window unanswered.
/// Eviction drops the oldest insertion, regardless of deadline.
pub struct MissedHistory<S: Storage> {
    storage: S,
    entries: Vec<MissedEntry>,
}

impl<S: Storage> MissedHistory<S> {
    #[tracing::instrument(skip(storage))]
    pub fn load(storage: S) -> Result<Self> {
        let entries = match storage.read(MISSED_KEY)? {
            Some(text) => decode_list::<MissedEntry>(MISSED_KEY, &text)
                .with_context(|| format!("failed to load '{MISSED_KEY}'"))?,
            None => Vec::new(),
        };
        debug!(count = entries.len(), "loaded missed history");
        Ok(Self { storage, entries })
    }

    /// Returns `false` when the task already has an entry.
    pub fn record(&mut self, entry: MissedEntry) -> bool {
        if self.contains(entry.id) {
            return false;
        }
        info!(task_id = %entry.id, title = %entry.title, "task missed");
        self.entries.insert(0, entry);
        self.entries.truncate(MISSED_HISTORY_CAP);
        self.persist();
        true
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    pub fn entries(&self) -> &[MissedEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        info!(count = self.entries.len(), "cleared missed history");
        self.entries.clear();
        self.persist();
    }

    fn persist(&self) {
        let result =
            encode_list(&self.entries).and_then(|text| self.storage.write(MISSED_KEY, &text));
        if let Err(err) = result {
            warn!(key = MISSED_KEY, error = %err, "failed to persist missed history");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};

    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn entry(id: i64) -> MissedEntry {
        let missed_at: DateTime<Utc> = Utc
            .with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
            .single()
            .expect("valid");
        MissedEntry {
            id: TaskId(id),
            title: format!("task {id}"),
            deadline: Some(missed_at - chrono::Duration::minutes(10)),
            missed_at,
        }
    }

    #[test]
    fn record_inserts_newest_first() {
        let mut history = MissedHistory::load(MemoryStorage::new()).expect("load");
        assert!(history.record(entry(1)));
        assert!(history.record(entry(2)));
        let ids = history.entries().iter().map(|e| e.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![TaskId(2), TaskId(1)]);
    }

    #[test]
    fn duplicate_ids_are_ignored() {
        let storage = MemoryStorage::new();
        let mut history = MissedHistory::load(storage.clone()).expect("load");
        assert!(history.record(entry(1)));
        assert!(!history.record(entry(1)));
        assert_eq!(history.len(), 1);
        assert_eq!(storage.write_count(), 1);
    }

    #[test]
    fn cap_evicts_first_inserted_entry() {
        let mut history = MissedHistory::load(MemoryStorage::new()).expect("load");
        for id in 1..=MISSED_HISTORY_CAP as i64 {
            history.record(entry(id));
        }
        assert_eq!(history.len(), MISSED_HISTORY_CAP);
        assert!(history.contains(TaskId(1)));

        history.record(entry(MISSED_HISTORY_CAP as i64 + 1));
        assert_eq!(history.len(), MISSED_HISTORY_CAP);
        assert!(!history.contains(TaskId(1)));
        assert!(history.contains(TaskId(2)));
        assert_eq!(history.entries()[0].id, TaskId(MISSED_HISTORY_CAP as i64 + 1));
    }

    #[test]
    fn eviction_follows_insertion_not_deadline() {
        let mut history = MissedHistory::load(MemoryStorage::new()).expect("load");
        let mut oldest_deadline = entry(1);
        oldest_deadline.deadline = oldest_deadline.deadline.map(|d| d + chrono::Duration::days(1));
        history.record(oldest_deadline);
        for id in 2..=(MISSED_HISTORY_CAP as i64 + 1) {
            history.record(entry(id));
        }
        assert!(!history.contains(TaskId(1)));
    }

    #[test]
    fn clear_empties_and_persists() {
        let storage = MemoryStorage::new();
        let mut history = MissedHistory::load(storage.clone()).expect("load");
        history.record(entry(1));
        history.clear();
        assert!(history.is_empty());

        let reloaded = MissedHistory::load(storage).expect("reload");
        assert!(reloaded.is_empty());
    }

    #[test]
    fn loads_entries_in_stored_shape() {
        let json = r#"[
  {"id": 5, "title": "Essay", "deadline": "2026-03-02T08:50:00.000Z", "missedAt": "2026-03-02T08:56:00.000Z"}
]"#;
        let history =
            MissedHistory::load(MemoryStorage::with_value(MISSED_KEY, json)).expect("load");
        assert!(history.contains(TaskId(5)));
        assert_eq!(history.entries()[0].title, "Essay");
    }
}
