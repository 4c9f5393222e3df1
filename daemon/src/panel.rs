/// Front panel: what the controller shows and the actions it accepts.
///
/// The daemon's panel is a status file (`status.toml` in the app dir) that any
/// display process can read, plus text actions arriving on stdin.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::controller::{ControllerState, RecordRequest};
use crate::event::DaemonEvent;

/// One frame of panel content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelView {
    pub state: ControllerState,
    pub status: String,
    pub progress: String,
    pub last_recording: Option<String>,
}

pub trait FrontPanel: Send + 'static {
    /// Called every controller tick.
    fn show(&mut self, view: &PanelView);

    /// Persistent fail screen after a fatal stop.
    fn fail(&mut self, message: &str);
}

/// Runtime status written to `status.toml`. Display processes read this file
/// (read-only) to render the panel.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PanelStatus {
    /// Daemon binary version (set from Cargo.toml at compile time).
    pub version: String,
    pub state: ControllerState,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    /// File name of the most recent take, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_recording: Option<String>,
    /// Fatal error text once the controller has stopped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PanelStatus {
    /// Initial idle status on daemon startup.
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: ControllerState::Idle,
            status: "starting".to_string(),
            progress: None,
            last_recording: None,
            error: None,
        }
    }

    fn from_view(view: &PanelView) -> Self {
        Self {
            state: view.state,
            status: view.status.clone(),
            progress: (!view.progress.is_empty()).then(|| view.progress.clone()),
            last_recording: view.last_recording.clone(),
            ..Self::new()
        }
    }
}

impl Default for PanelStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// Failures are logged; a status write never stops the daemon.
pub fn write_status(path: &Path, status: &PanelStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            error!("failed to create directory {}: {e}", parent.display());
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                error!("failed to write status file: {e}");
            }
        }
        Err(e) => error!("failed to serialize status: {e}"),
    }
}

/// Front panel backed by the status file. Writes only when the view changes.
#[derive(Debug)]
pub struct StatusFilePanel {
    path: PathBuf,
    last: Option<PanelView>,
}

impl StatusFilePanel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        write_status(&path, &PanelStatus::new());
        Self { path, last: None }
    }
}

impl FrontPanel for StatusFilePanel {
    fn show(&mut self, view: &PanelView) {
        if self.last.as_ref() == Some(view) {
            return;
        }
        write_status(&self.path, &PanelStatus::from_view(view));
        self.last = Some(view.clone());
    }

    fn fail(&mut self, message: &str) {
        let status = PanelStatus {
            state: ControllerState::Stopped,
            status: "failed".to_string(),
            error: Some(message.to_string()),
            last_recording: self.last.as_ref().and_then(|v| v.last_recording.clone()),
            ..PanelStatus::new()
        };
        write_status(&self.path, &status);
    }
}

// ── Actions ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelAction {
    Record(RecordRequest),
    Cancel,
    Copy,
    Purge,
    Update,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseActionError {
    #[error("empty action")]
    Empty,
    #[error("unknown action '{0}'")]
    Unknown(String),
    #[error("unexpected argument '{0}'")]
    Argument(String),
}

impl FromStr for PanelAction {
    type Err = ParseActionError;

    /// `record [secs] [filename]`, `cancel`, `copy`, `purge`, `update`, `quit`.
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or(ParseActionError::Empty)?;
        let action = match verb.to_ascii_lowercase().as_str() {
            "record" => {
                let mut request = RecordRequest::default();
                for word in words.by_ref() {
                    match word.parse::<u64>() {
                        Ok(secs) if request.duration.is_none() && request.filename.is_none() => {
                            request.duration = Some(Duration::from_secs(secs));
                        }
                        _ if request.filename.is_none() => request.filename = Some(word.to_string()),
                        _ => return Err(ParseActionError::Argument(word.to_string())),
                    }
                }
                PanelAction::Record(request)
            }
            "cancel" => PanelAction::Cancel,
            "copy" => PanelAction::Copy,
            "purge" => PanelAction::Purge,
            "update" => PanelAction::Update,
            "quit" => PanelAction::Quit,
            other => return Err(ParseActionError::Unknown(other.to_string())),
        };
        match words.next() {
            Some(extra) => Err(ParseActionError::Argument(extra.to_string())),
            None => Ok(action),
        }
    }
}

/// Reads one action per line from `reader` until end of input.
///
/// Should be spawned as a tokio task.
pub async fn read_actions<R: AsyncBufRead + Unpin>(reader: R, tx: mpsc::Sender<DaemonEvent>) {
    let mut lines = reader.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("failed to read panel input: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<PanelAction>() {
            Ok(action) => {
                if tx.send(DaemonEvent::Panel(action)).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!("ignoring panel input '{}': {e}", line.trim()),
        }
    }
    debug!("panel input closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(state: ControllerState, status: &str) -> PanelView {
        PanelView {
            state,
            status: status.to_string(),
            progress: String::new(),
            last_recording: None,
        }
    }

    // ── PanelStatus::new ──────────────────────────────────────────────────────

    #[test]
    fn new_starts_idle() {
        let s = PanelStatus::new();
        assert_eq!(s.state, ControllerState::Idle);
    }

    #[test]
    fn new_has_no_optional_fields() {
        let s = PanelStatus::new();
        assert!(s.progress.is_none());
        assert!(s.last_recording.is_none());
        assert!(s.error.is_none());
    }

    #[test]
    fn new_version_matches_cargo_pkg() {
        let s = PanelStatus::new();
        assert_eq!(s.version, env!("CARGO_PKG_VERSION"));
    }

    // ── ControllerState serialization ─────────────────────────────────────────

    #[test]
    fn state_serializes_to_lowercase() {
        // TOML requires a root table, so verify the value via PanelStatus.
        let mut s = PanelStatus::new();
        for (state, text) in [
            (ControllerState::Idle, "idle"),
            (ControllerState::Recording, "recording"),
            (ControllerState::Converting, "converting"),
            (ControllerState::Uploading, "uploading"),
            (ControllerState::Copying, "copying"),
            (ControllerState::Stopped, "stopped"),
        ] {
            s.state = state;
            let serialized = toml::to_string_pretty(&s).unwrap();
            assert!(serialized.contains(&format!("state = \"{text}\"")), "{serialized}");
        }
    }

    // ── write_status ──────────────────────────────────────────────────────────

    #[test]
    fn write_status_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dir").join("status.toml");
        write_status(&path, &PanelStatus::new());
        assert!(path.exists());
    }

    #[test]
    fn write_status_omits_none_optional_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");
        write_status(&path, &PanelStatus::new());

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("progress"));
        assert!(!content.contains("last_recording"));
        assert!(!content.contains("error"));
    }

    // ── StatusFilePanel ───────────────────────────────────────────────────────

    fn read(path: &Path) -> PanelStatus {
        toml::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn show_writes_view() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");
        let mut panel = StatusFilePanel::new(&path);

        let mut v = view(ControllerState::Converting, "converting STELC_1.wav");
        v.progress = "42%".to_string();
        v.last_recording = Some("STELC_1.wav".to_string());
        panel.show(&v);

        let status = read(&path);
        assert_eq!(status.state, ControllerState::Converting);
        assert_eq!(status.status, "converting STELC_1.wav");
        assert_eq!(status.progress.as_deref(), Some("42%"));
        assert_eq!(status.last_recording.as_deref(), Some("STELC_1.wav"));
    }

    #[test]
    fn show_skips_unchanged_view() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");
        let mut panel = StatusFilePanel::new(&path);
        let v = view(ControllerState::Idle, "ready");
        panel.show(&v);

        // Clobber the file; an identical view must not rewrite it.
        std::fs::write(&path, "sentinel").unwrap();
        panel.show(&v);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "sentinel");

        panel.show(&view(ControllerState::Recording, "recording"));
        assert_eq!(read(&path).state, ControllerState::Recording);
    }

    #[test]
    fn fail_writes_stopped_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");
        let mut panel = StatusFilePanel::new(&path);
        panel.fail("scheduler: not enough disk space");

        let status = read(&path);
        assert_eq!(status.state, ControllerState::Stopped);
        assert_eq!(status.error.as_deref(), Some("scheduler: not enough disk space"));
    }

    // ── PanelAction ───────────────────────────────────────────────────────────

    #[test]
    fn parses_simple_actions() {
        assert_eq!("cancel".parse(), Ok(PanelAction::Cancel));
        assert_eq!(" COPY ".parse(), Ok(PanelAction::Copy));
        assert_eq!("purge".parse(), Ok(PanelAction::Purge));
        assert_eq!("update".parse(), Ok(PanelAction::Update));
        assert_eq!("quit".parse(), Ok(PanelAction::Quit));
    }

    #[test]
    fn parses_record_arguments() {
        assert_eq!("record".parse(), Ok(PanelAction::Record(RecordRequest::default())));
        assert_eq!(
            "record 60".parse(),
            Ok(PanelAction::Record(RecordRequest {
                duration: Some(Duration::from_secs(60)),
                filename: None,
            }))
        );
        assert_eq!(
            "record 60 gig.wav".parse(),
            Ok(PanelAction::Record(RecordRequest {
                duration: Some(Duration::from_secs(60)),
                filename: Some("gig.wav".to_string()),
            }))
        );
        assert_eq!(
            "record gig.wav".parse(),
            Ok(PanelAction::Record(RecordRequest {
                duration: None,
                filename: Some("gig.wav".to_string()),
            }))
        );
    }

    #[test]
    fn rejects_bad_actions() {
        assert_eq!("".parse::<PanelAction>(), Err(ParseActionError::Empty));
        assert_eq!(
            "dance".parse::<PanelAction>(),
            Err(ParseActionError::Unknown("dance".to_string()))
        );
        assert_eq!(
            "cancel now".parse::<PanelAction>(),
            Err(ParseActionError::Argument("now".to_string()))
        );
        assert_eq!(
            "record 60 a.wav b.wav".parse::<PanelAction>(),
            Err(ParseActionError::Argument("b.wav".to_string()))
        );
    }

    #[tokio::test]
    async fn read_actions_forwards_parsed_lines() {
        let input: &[u8] = b"record 30\n\nbogus\ncancel\nquit\n";
        let (tx, mut rx) = mpsc::channel(8);
        read_actions(input, tx).await;

        let mut actions = Vec::new();
        while let Ok(DaemonEvent::Panel(action)) = rx.try_recv() {
            actions.push(action);
        }
        assert_eq!(
            actions,
            vec![
                PanelAction::Record(RecordRequest {
                    duration: Some(Duration::from_secs(30)),
                    filename: None,
                }),
                PanelAction::Cancel,
                PanelAction::Quit,
            ]
        );
    }
}
