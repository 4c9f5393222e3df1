/// Schedule events and the providers that store them.
///
/// The pipeline's bookkeeping for an event (which file recorded it, whether
/// it was uploaded, whether retention purged it) lives in the event's
/// description as a small JSON object, so any calendar that can hold free text
/// can carry it.
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::event::DaemonEvent;

#[derive(Debug, Error)]
pub enum CalendarError {
    #[error("calendar IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse calendar {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize calendar: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("no event with id '{0}'")]
    UnknownEvent(String),

    #[error("events cannot be looked up by '{0}'")]
    UnknownKey(String),
}

// ── Event model ───────────────────────────────────────────────────────────────

/// Pipeline bookkeeping for one event, stored as JSON in its description.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default)]
    pub uploaded: bool,
    #[serde(default)]
    pub purged: bool,
}

impl EventStatus {
    /// Parses a description. Blank or foreign text yields the default status.
    pub fn from_description(text: &str) -> Self {
        let text = text.trim();
        if text.is_empty() {
            return Self::default();
        }
        serde_json::from_str(text).unwrap_or_else(|e| {
            debug!("event description is not a status map ({e}); ignoring it");
            Self::default()
        })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn merge(&mut self, update: &StatusUpdate) {
        if let Some(filename) = &update.filename {
            self.filename = Some(filename.clone());
        }
        if let Some(uploaded) = update.uploaded {
            self.uploaded = uploaded;
        }
        if let Some(purged) = update.purged {
            self.purged = purged;
        }
    }
}

/// A partial [`EventStatus`]: only the `Some` fields are written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    pub filename: Option<String>,
    pub uploaded: Option<bool>,
    pub purged: Option<bool>,
}

impl StatusUpdate {
    pub fn filename(name: impl Into<String>) -> Self {
        Self {
            filename: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn uploaded() -> Self {
        Self {
            uploaded: Some(true),
            ..Self::default()
        }
    }

    pub fn purged() -> Self {
        Self {
            purged: Some(true),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleEvent {
    /// Empty for the blank event.
    pub id: String,
    pub summary: String,
    pub start: Option<DateTime<Local>>,
    pub duration_secs: u64,
    pub status: EventStatus,
}

impl ScheduleEvent {
    pub fn blank() -> Self {
        Self::default()
    }

    pub fn is_blank(&self) -> bool {
        self.id.is_empty()
    }

    pub fn end(&self) -> Option<DateTime<Local>> {
        let duration = chrono::Duration::seconds(i64::try_from(self.duration_secs).ok()?);
        self.start.map(|start| start + duration)
    }

    /// Whether `now` falls inside the event's window.
    pub fn in_progress_at(&self, now: DateTime<Local>) -> bool {
        match (self.start, self.end()) {
            (Some(start), Some(end)) => start <= now && now < end,
            _ => false,
        }
    }
}

/// Where schedule events come from and where their status is written back.
pub trait ScheduleProvider: Send + 'static {
    fn connect(&mut self) -> Result<(), CalendarError>;

    /// Earliest event that has not ended by `from` and starts no later than
    /// `from + look_ahead`, or the blank event.
    fn get_next(
        &mut self,
        from: DateTime<Local>,
        look_ahead: Duration,
    ) -> Result<ScheduleEvent, CalendarError>;

    /// First event whose `key` (`id`, `summary` or `filename`) equals `value`,
    /// or the blank event.
    fn get_by(&mut self, key: &str, value: &str) -> Result<ScheduleEvent, CalendarError>;

    /// Replaces the stored status of event `id`.
    fn patch(&mut self, id: &str, status_json: &str) -> Result<(), CalendarError>;
}

/// Picks the event `get_next` should return out of `events`.
pub fn next_event(
    events: impl IntoIterator<Item = ScheduleEvent>,
    from: DateTime<Local>,
    look_ahead: Duration,
) -> ScheduleEvent {
    let horizon = chrono::Duration::from_std(look_ahead)
        .map(|d| from + d)
        .unwrap_or(from);
    events
        .into_iter()
        .filter(|e| match (e.start, e.end()) {
            (Some(start), Some(end)) => end > from && start <= horizon,
            _ => false,
        })
        .min_by_key(|e| e.start)
        .unwrap_or_default()
}

/// Lookup shared by providers: `id`, `summary` or the status `filename`.
pub fn find_by(
    events: impl IntoIterator<Item = ScheduleEvent>,
    key: &str,
    value: &str,
) -> Result<ScheduleEvent, CalendarError> {
    let matches: fn(&ScheduleEvent, &str) -> bool = match key {
        "id" => |e, v| e.id == v,
        "summary" => |e, v| e.summary == v,
        "filename" => |e, v| e.status.filename.as_deref() == Some(v),
        other => return Err(CalendarError::UnknownKey(other.to_string())),
    };
    Ok(events
        .into_iter()
        .find(|e| matches(e, value))
        .unwrap_or_default())
}

// ── File-backed calendar ──────────────────────────────────────────────────────

/// On-disk form: one `[[events]]` table per event.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CalendarFile {
    #[serde(default)]
    events: Vec<EventRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventRecord {
    id: String,
    #[serde(default)]
    summary: String,
    /// RFC 3339.
    start: String,
    #[serde(default)]
    duration_secs: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    description: String,
}

impl EventRecord {
    fn to_event(&self) -> Option<ScheduleEvent> {
        let start = match DateTime::parse_from_rfc3339(&self.start) {
            Ok(start) => start.with_timezone(&Local),
            Err(e) => {
                warn!("calendar event '{}' has an invalid start '{}': {e}", self.id, self.start);
                return None;
            }
        };
        Some(ScheduleEvent {
            id: self.id.clone(),
            summary: self.summary.clone(),
            start: Some(start),
            duration_secs: self.duration_secs,
            status: EventStatus::from_description(&self.description),
        })
    }
}

/// A calendar kept in a TOML file, re-read on every query so hand edits
/// take effect without a restart.
#[derive(Debug, Clone)]
pub struct FileCalendar {
    path: PathBuf,
}

impl FileCalendar {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<CalendarFile, CalendarError> {
        if !self.path.exists() {
            return Ok(CalendarFile::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        toml::from_str(&content).map_err(|source| CalendarError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn events(&self) -> Result<Vec<ScheduleEvent>, CalendarError> {
        Ok(self
            .load()?
            .events
            .iter()
            .filter_map(EventRecord::to_event)
            .collect())
    }

    /// Writes through a temporary file and a rename, so readers (and the
    /// watcher) never see a half-written calendar.
    fn store(&self, file: &CalendarFile) -> Result<(), CalendarError> {
        let content = toml::to_string_pretty(file)?;
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl ScheduleProvider for FileCalendar {
    fn connect(&mut self) -> Result<(), CalendarError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !self.path.exists() {
            self.store(&CalendarFile::default())?;
        }
        // Surface a malformed file at startup rather than on the first tick.
        self.load().map(|_| ())
    }

    fn get_next(
        &mut self,
        from: DateTime<Local>,
        look_ahead: Duration,
    ) -> Result<ScheduleEvent, CalendarError> {
        Ok(next_event(self.events()?, from, look_ahead))
    }

    fn get_by(&mut self, key: &str, value: &str) -> Result<ScheduleEvent, CalendarError> {
        find_by(self.events()?, key, value)
    }

    fn patch(&mut self, id: &str, status_json: &str) -> Result<(), CalendarError> {
        let mut file = self.load()?;
        let record = file
            .events
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| CalendarError::UnknownEvent(id.to_string()))?;
        record.description = status_json.to_string();
        self.store(&file)
    }
}

/// Quiet period after a file event before the calendar is re-read; editors
/// and [`FileCalendar::store`] touch the file several times per save.
const SETTLE: Duration = Duration::from_millis(300);

/// The part of the calendar a refresh depends on: each event's id, summary,
/// start and duration, without its status. Status patches leave it unchanged.
#[derive(Debug, PartialEq, Eq)]
struct Timetable(Vec<(String, String, String, u64)>);

impl FileCalendar {
    fn timetable(&self) -> Result<Timetable, CalendarError> {
        let mut slots: Vec<_> = self
            .load()?
            .events
            .into_iter()
            .map(|r| (r.id, r.summary, r.start, r.duration_secs))
            .collect();
        slots.sort();
        Ok(Timetable(slots))
    }
}

/// Watches the calendar file and sends [`DaemonEvent::CalendarChanged`] when
/// its timetable changes. A burst of writes is handled once it settles; an
/// edit that does not parse is reported and ignored until it is fixed, and
/// the scheduler's own status writes never trigger a refresh.
///
/// Should be spawned as a tokio task; runs until the channel closes.
pub async fn watch_calendar(calendar: FileCalendar, tx: mpsc::Sender<DaemonEvent>) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);
    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            error!("failed to create calendar watcher: {e}");
            return;
        }
    };

    // The directory, not the file: `store` replaces the file by rename.
    let Some(watch_dir) = calendar.path().parent().map(Path::to_path_buf) else {
        error!("calendar path {} has no parent directory", calendar.path().display());
        return;
    };
    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        error!("failed to watch calendar directory {}: {e}", watch_dir.display());
        return;
    }

    let mut known = calendar.timetable().ok();
    while let Some(event) = watch_rx.recv().await {
        if !event.paths.iter().any(|p| p == calendar.path()) {
            continue;
        }
        while let Ok(Some(_)) = tokio::time::timeout(SETTLE, watch_rx.recv()).await {}

        match calendar.timetable() {
            Ok(table) if known.as_ref() == Some(&table) => {
                debug!("calendar rewritten, timetable unchanged");
            }
            Ok(table) => {
                info!(events = table.0.len(), "calendar changed");
                known = Some(table);
                if tx.send(DaemonEvent::CalendarChanged).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!("calendar edit ignored: {e}"),
        }
    }
}
