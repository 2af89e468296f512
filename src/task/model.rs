use std::fmt;

use chrono::{DateTime, Datelike, Local, LocalResult, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Creation timestamp in Unix milliseconds. Never reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(TaskId)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub alarm_enabled: bool,
    #[serde(default)]
    pub alarm_acknowledged: bool,
    #[serde(default)]
    pub alarm_active: bool,
}

impl Task {
    pub fn from_draft(id: TaskId, draft: TaskDraft) -> Self {
        Self {
            id,
            title: draft.title,
            content: draft.content,
            deadline: draft.deadline,
            alarm_enabled: draft.alarm_enabled,
            alarm_acknowledged: false,
            alarm_active: false,
        }
    }

    /// Replaces the user-editable fields and re-arms the alarm.
    pub fn apply_draft(&mut self, draft: TaskDraft) {
        self.title = draft.title;
        self.content = draft.content;
        self.deadline = draft.deadline;
        self.alarm_enabled = draft.alarm_enabled;
        self.alarm_acknowledged = false;
        self.alarm_active = false;
    }
}

/// Form payload shared by create and update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskDraft {
    pub title: String,
    pub content: String,
    pub deadline: Option<DateTime<Utc>>,
    pub alarm_enabled: bool,
}

impl TaskDraft {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_alarm(mut self, enabled: bool) -> Self {
        self.alarm_enabled = enabled;
        self
    }

    pub(crate) fn normalized(mut self) -> Self {
        self.title = self.title.trim().to_string();
        self.content = self.content.trim().to_string();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissedEntry {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    pub missed_at: DateTime<Utc>,
}

impl MissedEntry {
    pub fn snapshot(task: &Task, missed_at: DateTime<Utc>) -> Self {
        Self {
            id: task.id,
            title: task.title.clone(),
            deadline: task.deadline,
            missed_at,
        }
    }
}

/// Accepts RFC 3339 instants or local wall time in `datetime-local` shape.
pub fn parse_deadline(input: &str) -> anyhow::Result<DateTime<Utc>> {
    parse_deadline_in_tz(input, &Local)
}

pub(crate) fn parse_deadline_in_tz<Tz>(input: &str, timezone: &Tz) -> anyhow::Result<DateTime<Utc>>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    let trimmed = input.trim();
    if let Ok(instant) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(instant.with_timezone(&Utc));
    }

    let naive = parse_local_datetime(trimmed)?;
    resolve_local_datetime(timezone, naive)
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| anyhow::anyhow!("local time '{trimmed}' does not exist in this time zone"))
}

fn parse_local_datetime(input: &str) -> anyhow::Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M:%S%.f"))
        .or_else(|_| NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M"))
        .or_else(|_| NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M"))
        .map_err(|_| anyhow::anyhow!("invalid deadline '{input}', expected ISO datetime"))
}

fn resolve_local_datetime<Tz>(timezone: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    match timezone.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(first, _second) => Some(first),
        LocalResult::None => None,
    }
}

/// Parses `500ms`, `30s`, `10m`, `2h` or bare seconds.
pub fn parse_duration_token(token: &str) -> anyhow::Result<chrono::Duration> {
    let token = token.trim();
    let (raw, unit_ms) = if let Some(raw) = token.strip_suffix("ms") {
        (raw, 1_i64)
    } else if let Some(raw) = token.strip_suffix('s') {
        (raw, 1_000)
    } else if let Some(raw) = token.strip_suffix('m') {
        (raw, 60_000)
    } else if let Some(raw) = token.strip_suffix('h') {
        (raw, 3_600_000)
    } else {
        (token, 1_000)
    };

    let value: i64 = raw
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid duration '{token}'"))?;
    if value <= 0 {
        anyhow::bail!("duration must be > 0");
    }
    Ok(chrono::Duration::milliseconds(value.saturating_mul(unit_ms)))
}

/// Deadline `token` after `now`; rejects offsets past the representable range.
pub fn deadline_after(now: DateTime<Utc>, token: &str) -> anyhow::Result<DateTime<Utc>> {
    let offset = parse_duration_token(token)?;
    now.checked_add_signed(offset)
        .ok_or_else(|| anyhow::anyhow!("deadline '{}' from now is out of range", token.trim()))
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TimeDisplayMode {
    Hour24,
    Hour12,
}

pub fn format_deadline(deadline: Option<DateTime<Utc>>, mode: TimeDisplayMode) -> String {
    let Some(deadline) = deadline else {
        return "-".to_string();
    };
    let dt = deadline.with_timezone(&Local);
    match mode {
        TimeDisplayMode::Hour24 => format!(
            "{:04}-{:02}-{:02} {:02}:{:02}",
            dt.year(),
            dt.month(),
            dt.day(),
            dt.hour(),
            dt.minute()
        ),
        TimeDisplayMode::Hour12 => {
            let (is_pm, hour12) = dt.hour12();
            let meridiem = if is_pm { "PM" } else { "AM" };
            format!(
                "{:04}-{:02}-{:02} {:02}:{:02} {}",
                dt.year(),
                dt.month(),
                dt.day(),
                hour12,
                dt.minute(),
                meridiem
            )
        }
    }
}
