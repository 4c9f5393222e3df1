//! Top-level state machine driving record → convert → upload, and copy.
//!
//! The controller thread ticks at a fixed period. Each tick it checks, in
//! order: its own stop request, a fatal scheduler failure, a cancel request,
//! forwarded schedule requests, and then the handler of the current state. At
//! most one transition happens per tick. A stage is considered done when its
//! worker is no longer busy; the next stage is only started after that, so at
//! most one worker is ever running.
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::calendar::{ScheduleEvent, StatusUpdate};
use crate::command::rotate_log;
use crate::config::Config;
use crate::panel::{FrontPanel, PanelAction, PanelView};
use crate::recorder::Recorder;
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::signal::{Signal, Slot};
use crate::worker::{Job, Worker, WorkerMonitor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerState {
    Idle,
    Recording,
    Converting,
    Uploading,
    Copying,
    /// Terminal. Reached only through a fatal failure.
    Stopped,
}

impl ControllerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Recording => "recording",
            Self::Converting => "converting",
            Self::Uploading => "uploading",
            Self::Copying => "copying",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why [`Controller::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerExit {
    Quit,
    Fatal(String),
}

/// A manual record request. Unset fields fall back to the configured
/// duration and a timestamp-derived file name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordRequest {
    pub duration: Option<Duration>,
    pub filename: Option<String>,
}

#[derive(Debug)]
struct ControllerSignals {
    record: Signal,
    cancel: Signal,
    copy: Signal,
    purge: Signal,
    update: Signal,
    stop: Signal,
    request: Slot<RecordRequest>,
}

/// Requests into the controller, usable from any thread.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    signals: Arc<ControllerSignals>,
}

impl ControllerHandle {
    pub fn record(&self, request: RecordRequest) {
        self.signals.request.publish(request);
        self.signals.record.set();
    }

    pub fn cancel(&self) {
        self.signals.cancel.set();
    }

    pub fn copy(&self) {
        self.signals.copy.set();
    }

    pub fn purge(&self) {
        self.signals.purge.set();
    }

    pub fn update_schedule(&self) {
        self.signals.update.set();
    }

    pub fn stop(&self) {
        self.signals.stop.set();
    }

    pub fn dispatch(&self, action: PanelAction) {
        match action {
            PanelAction::Record(request) => self.record(request),
            PanelAction::Cancel => self.cancel(),
            PanelAction::Copy => self.copy(),
            PanelAction::Purge => self.purge(),
            PanelAction::Update => self.update_schedule(),
            PanelAction::Quit => self.stop(),
        }
    }
}

/// The pipeline's workers, created once at startup.
pub struct Stages {
    pub recorder: Recorder,
    pub converter: Worker,
    pub uploader: Worker,
    pub copier: Worker,
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub tick: Duration,
    pub default_record_secs: u64,
    /// Bound on the wait for the recorder to report running.
    pub start_confirm: Duration,
    /// How far ahead a scheduled recording is announced.
    pub lead: Duration,
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        let tick = config.controller.tick();
        Self {
            tick,
            default_record_secs: config.controller.default_record_secs,
            start_confirm: tick * config.controller.start_confirm_ticks,
            lead: Duration::from_secs(config.schedule.lead_secs),
        }
    }
}

pub struct Controller<P: FrontPanel> {
    settings: ControllerSettings,
    recorder: Recorder,
    converter: Worker,
    uploader: Worker,
    copier: Worker,
    scheduler: Scheduler,
    schedule: SchedulerHandle,
    panel: P,
    signals: Arc<ControllerSignals>,
    state: ControllerState,
    status: String,
    last_recording: Option<String>,
    /// The take moving through convert and upload.
    take: Option<PathBuf>,
    /// The event the current pipeline records, if it was scheduled.
    scheduled: Option<ScheduleEvent>,
    /// Id of the last event a recording was started for.
    last_triggered: Option<String>,
    /// Id of the last event announced as near.
    announced: Option<String>,
    announcing: bool,
    /// The active stage was asked to finish (cancel or end of stream).
    finishing: bool,
    stray_logs: VecDeque<PathBuf>,
    /// Stage log being uploaded, rotated once delivered.
    uploading_log: Option<PathBuf>,
}

impl<P: FrontPanel> Controller<P> {
    pub fn new(settings: ControllerSettings, stages: Stages, scheduler: Scheduler, panel: P) -> Self {
        let schedule = scheduler.handle();
        Self {
            settings,
            recorder: stages.recorder,
            converter: stages.converter,
            uploader: stages.uploader,
            copier: stages.copier,
            scheduler,
            schedule,
            panel,
            signals: Arc::new(ControllerSignals {
                record: Signal::new("record"),
                cancel: Signal::new("cancel"),
                copy: Signal::new("copy"),
                purge: Signal::new("purge"),
                update: Signal::new("update"),
                stop: Signal::new("stop"),
                request: Slot::new(RecordRequest::default()),
            }),
            state: ControllerState::Idle,
            status: "ready".to_string(),
            last_recording: None,
            take: None,
            scheduled: None,
            last_triggered: None,
            announced: None,
            announcing: false,
            finishing: false,
            stray_logs: VecDeque::new(),
            uploading_log: None,
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            signals: Arc::clone(&self.signals),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn monitors(&self) -> [WorkerMonitor; 4] {
        [
            self.recorder.monitor(),
            self.converter.monitor(),
            self.uploader.monitor(),
            self.copier.monitor(),
        ]
    }

    /// Ticks until stopped or failed, then shuts every thread down.
    pub fn run(mut self) -> ControllerExit {
        info!("controller started");
        let exit = loop {
            if let Some(exit) = self.tick() {
                break exit;
            }
            thread::sleep(self.settings.tick);
        };
        self.shutdown();
        exit
    }

    /// One controller tick. Returns `Some` when the loop must end.
    pub(crate) fn tick(&mut self) -> Option<ControllerExit> {
        if self.signals.stop.take() {
            info!("stop requested");
            self.finish_active();
            return Some(ControllerExit::Quit);
        }
        if self.schedule.is_fatal() {
            return Some(self.fatal());
        }
        // A cancel that acted owns the tick; one that found nothing to cancel
        // lets the active stage be collected as usual.
        if self.signals.cancel.take() && self.cancel() {
            self.show();
            return None;
        }
        if self.signals.purge.take() {
            self.schedule.request_purge();
        }
        if self.signals.update.take() {
            self.schedule.request_refresh();
        }
        self.stray_logs.extend(self.schedule.take_stray_logs());
        self.check_exclusive();

        if self.state != ControllerState::Idle {
            if self.signals.record.take() {
                warn!("record request ignored while {}", self.state);
            }
            if self.signals.copy.take() {
                warn!("copy request ignored while {}", self.state);
            }
        }

        match self.state {
            ControllerState::Idle => self.idle(),
            ControllerState::Recording => self.recording(),
            ControllerState::Converting => self.converting(),
            ControllerState::Uploading => self.uploading(),
            ControllerState::Copying => self.copying(),
            ControllerState::Stopped => {}
        }
        self.show();
        None
    }

    // ── state handlers ────────────────────────────────────────────────────────

    fn idle(&mut self) {
        if self.signals.record.take() {
            let request = self.signals.request.snapshot();
            self.start_recording(request, None);
            return;
        }

        let now = self.schedule.now();
        let event = self.schedule.current();
        if !event.is_blank() && self.last_triggered.as_deref() != Some(event.id.as_str()) {
            if self.schedule.is_due() {
                info!(event = %event.id, "scheduled recording due: {}", event.summary);
                let request = RecordRequest {
                    duration: Some(Duration::from_secs(event.duration_secs)),
                    filename: None,
                };
                self.start_recording(request, Some(event));
                return;
            }
            // Came due while the pipeline was busy: record what is left of it.
            if event.in_progress_at(now) && event.status.filename.is_none() {
                let remaining = event
                    .end()
                    .and_then(|end| (end - now).to_std().ok())
                    .map_or(0, |left| left.as_secs());
                if remaining > 0 {
                    info!(event = %event.id, "late start, {remaining}s left: {}", event.summary);
                    let request = RecordRequest {
                        duration: Some(Duration::from_secs(remaining)),
                        filename: None,
                    };
                    self.start_recording(request, Some(event));
                    return;
                }
            }
        }

        if self.signals.copy.take() {
            self.start_copy();
            return;
        }

        if let Some(log) = self.stray_logs.pop_front() {
            self.uploading_log = Some(log.clone());
            self.start_upload(log);
            return;
        }

        self.announce(&event, now);
    }

    fn recording(&mut self) {
        let worker = self.recorder.worker();
        if worker.is_busy() {
            if !self.finishing && worker.is_running() {
                match self.recorder.is_stream_active() {
                    Ok(true) => {}
                    Ok(false) => {
                        info!("recording stream ended");
                        self.stop_recording();
                    }
                    Err(e) => warn!("{e}"),
                }
            }
            return;
        }

        let take = self.recorder.worker().result().or_else(|| {
            let path = self.recorder.path();
            path.exists().then_some(path)
        });
        match take {
            Some(path) => {
                let fail = self.recorder.worker().fail();
                if !fail.is_empty() {
                    warn!("recording ended with errors: {fail}");
                }
                self.last_recording = Some(file_name(&path));
                self.start_convert(path);
            }
            None => {
                let fail = self.recorder.worker().fail();
                self.go_idle(Some(format!("recording failed: {fail}")));
            }
        }
    }

    fn converting(&mut self) {
        if self.converter.is_busy() {
            return;
        }
        let Some(take) = self.take.clone() else {
            self.go_idle(None);
            return;
        };
        match self.converter.result() {
            Some(converted) => self.start_upload(converted),
            None => {
                let fail = self.converter.fail();
                if fail.is_empty() {
                    info!("conversion cancelled, uploading {}", take.display());
                } else {
                    warn!("conversion failed, uploading {}: {fail}", take.display());
                }
                self.start_upload(take);
            }
        }
    }

    fn uploading(&mut self) {
        if self.uploader.is_busy() {
            return;
        }
        let cancelled = self.finishing;
        let delivered = self.uploader.result().is_some();
        let fail = self.uploader.fail();

        if let Some(log) = self.uploading_log.take() {
            if delivered {
                match rotate_log(&log) {
                    Ok(rotated) => debug!(log = %rotated.display(), "delivered log rotated"),
                    Err(e) => warn!("cannot rotate {}: {e}", log.display()),
                }
            }
            let notice = (!delivered && !fail.is_empty()).then(|| format!("log upload failed: {fail}"));
            self.go_idle(notice);
            return;
        }

        if let Some(event) = self.scheduled.take() {
            if delivered || cancelled {
                self.schedule.update_items(&event, &StatusUpdate::uploaded());
            }
            self.schedule.request_put();
            self.schedule.request_refresh();
        }

        let notice = if delivered {
            None
        } else if cancelled {
            Some("upload cancelled".to_string())
        } else {
            Some(format!("upload failed: {fail}"))
        };
        self.go_idle(notice);
    }

    fn copying(&mut self) {
        if self.copier.is_busy() {
            return;
        }
        let fail = self.copier.fail();
        let notice = match self.copier.result() {
            Some(dest) if fail.is_empty() => format!("copied to {}", dest.display()),
            Some(dest) => format!("copied to {} with errors: {fail}", dest.display()),
            None if fail.is_empty() => "copy cancelled".to_string(),
            None => format!("copy failed: {fail}"),
        };
        self.go_idle(Some(notice));
    }

    // ── transitions ───────────────────────────────────────────────────────────

    fn start_recording(&mut self, request: RecordRequest, event: Option<ScheduleEvent>) {
        if let Some(event) = &event {
            self.last_triggered = Some(event.id.clone());
        }
        let secs = request
            .duration
            .map(|d| d.as_secs())
            .filter(|&secs| secs > 0)
            .unwrap_or(self.settings.default_record_secs);

        let filename = match self
            .recorder
            .set_duration(secs)
            .and_then(|_| self.recorder.set_filename(request.filename.as_deref()))
        {
            Ok(filename) => filename,
            Err(e) => {
                warn!("cannot start recording: {e}");
                return;
            }
        };
        if let Err(e) = self.recorder.start() {
            warn!("cannot start recording: {e}");
            return;
        }

        let worker = self.recorder.worker();
        if !worker.confirm_started(self.settings.start_confirm) && !worker.is_busy() {
            let fail = worker.fail();
            self.go_idle(Some(format!("recording failed to start: {fail}")));
            return;
        }

        if let Some(event) = event {
            let merged = self.schedule.update_items(&event, &StatusUpdate::filename(filename.as_str()));
            self.schedule.request_put();
            self.scheduled = Some(merged);
        }
        self.take = Some(self.recorder.path());
        info!(
            secs = self.recorder.duration().as_secs(),
            scheduled = self.scheduled.is_some(),
            "take {filename}"
        );
        self.enter(ControllerState::Recording, format!("recording {filename}"));
    }

    fn stop_recording(&mut self) {
        match self.recorder.stop() {
            Ok(path) => {
                self.finishing = true;
                self.status = format!("finishing {}", file_name(&path));
            }
            Err(e) => warn!("{e}"),
        }
    }

    fn start_convert(&mut self, take: PathBuf) {
        let name = file_name(&take);
        self.take = Some(take.clone());
        match self.converter.start(Job::with_input(take)) {
            Ok(()) => self.enter(ControllerState::Converting, format!("converting {name}")),
            Err(e) => self.go_idle(Some(e.to_string())),
        }
    }

    fn start_upload(&mut self, input: PathBuf) {
        let name = file_name(&input);
        match self.uploader.start(Job::with_input(input)) {
            Ok(()) => self.enter(ControllerState::Uploading, format!("uploading {name}")),
            Err(e) => {
                self.uploading_log = None;
                self.go_idle(Some(e.to_string()));
            }
        }
    }

    fn start_copy(&mut self) {
        match self.copier.start(Job::default()) {
            Ok(()) => self.enter(ControllerState::Copying, "copying to removable media".to_string()),
            Err(e) => self.go_idle(Some(e.to_string())),
        }
    }

    /// Asks the active stage to finish now. Returns whether a stage was told
    /// to finish.
    fn cancel(&mut self) -> bool {
        if self.finishing {
            return false;
        }
        let stage = match self.state {
            ControllerState::Recording => {
                if !self.recorder.worker().is_busy() {
                    return false;
                }
                info!("recording cancelled");
                self.stop_recording();
                return self.finishing;
            }
            ControllerState::Converting => &self.converter,
            ControllerState::Uploading => &self.uploader,
            ControllerState::Copying => &self.copier,
            ControllerState::Idle | ControllerState::Stopped => {
                info!("nothing to cancel");
                return false;
            }
        };
        if !stage.is_busy() {
            return false;
        }
        let name = stage.name();
        match stage.finish() {
            Ok(()) => {
                info!(stage = name, "cancelled");
                self.finishing = true;
                self.status = format!("finishing {name}");
                true
            }
            Err(e) => {
                warn!("{e}");
                false
            }
        }
    }

    fn fatal(&mut self) -> ControllerExit {
        self.finish_active();
        let mut parts = vec![format!("scheduler: {}", self.schedule.fail())];
        for worker in [self.recorder.worker(), &self.converter, &self.uploader, &self.copier] {
            let fail = worker.fail();
            if !fail.is_empty() {
                parts.push(format!("{}: {fail}", worker.name()));
            }
        }
        let message = parts.join("; ");
        error!("fatal: {message}");
        self.enter(ControllerState::Stopped, message.clone());
        self.panel.fail(&message);
        ControllerExit::Fatal(message)
    }

    fn go_idle(&mut self, notice: Option<String>) {
        if let Some(notice) = &notice {
            warn!("{notice}");
        }
        self.take = None;
        self.scheduled = None;
        self.enter(ControllerState::Idle, notice.unwrap_or_else(|| "ready".to_string()));
    }

    fn enter(&mut self, state: ControllerState, status: String) {
        if state != self.state {
            info!(from = %self.state, to = %state, "{status}");
        }
        self.state = state;
        self.status = status;
        self.finishing = false;
        self.announcing = false;
    }

    // ── helpers ───────────────────────────────────────────────────────────────

    fn announce(&mut self, event: &ScheduleEvent, now: chrono::DateTime<chrono::Local>) {
        if !self.schedule.is_near(self.settings.lead) {
            if self.announcing {
                self.announcing = false;
                self.status = "ready".to_string();
            }
            return;
        }
        let secs = event
            .start
            .map_or(0, |start| (start - now).num_seconds().max(0));
        self.status = format!("next: {} in {} min", event.summary, (secs + 59) / 60);
        self.announcing = true;
        if self.announced.as_deref() != Some(event.id.as_str()) {
            self.announced = Some(event.id.clone());
            // Make room for the take before it starts.
            self.schedule.request_purge();
        }
    }

    fn check_exclusive(&self) {
        let running: Vec<&str> = self
            .monitors()
            .iter()
            .filter(|m| m.is_running())
            .map(WorkerMonitor::name)
            .collect();
        if running.len() > 1 {
            error!("stages running at once: {}", running.join(", "));
        }
    }

    fn active_worker(&self) -> Option<&Worker> {
        match self.state {
            ControllerState::Recording => Some(self.recorder.worker()),
            ControllerState::Converting => Some(&self.converter),
            ControllerState::Uploading => Some(&self.uploader),
            ControllerState::Copying => Some(&self.copier),
            ControllerState::Idle | ControllerState::Stopped => None,
        }
    }

    fn finish_active(&mut self) {
        if let Some(worker) = self.active_worker() {
            if worker.is_busy() {
                let _ = worker.finish();
            }
        }
    }

    fn show(&mut self) {
        let view = PanelView {
            state: self.state,
            status: self.status.clone(),
            progress: self.active_worker().map(Worker::progress).unwrap_or_default(),
            last_recording: self.last_recording.clone(),
        };
        self.panel.show(&view);
    }

    fn shutdown(&mut self) {
        self.recorder.worker_mut().shutdown();
        self.converter.shutdown();
        self.uploader.shutdown();
        self.copier.shutdown();
        self.scheduler.shutdown();

        for monitor in self.monitors() {
            let violations = monitor.violations();
            if violations > 0 {
                warn!(stage = monitor.name(), "{violations} protocol violation(s) during this run");
            }
        }
        info!(state = %self.state(), "controller stopped");
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
