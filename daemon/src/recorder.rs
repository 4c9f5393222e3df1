/// Audio capture stage.
///
/// A take is captured by an external command (sox by default) writing straight
/// to the take's file. The [`Recording`] operation watches the child: when it
/// exits, or the configured duration elapses, the stream is reported as ended
/// and the operation waits for the controller's stop before finalising. A stop
/// while the stream is still open sends SIGINT, which makes sox close the file
/// with a valid header.
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal as UnixSignal;
use tracing::{info, warn};

use crate::command::{log_path, CommandTemplate, Supervised};
use crate::config::RecordingConfig;
use crate::worker::{
    Job, Operation, ProtocolError, Stage, StageContext, StageError, Worker, WorkerMonitor,
};

pub const STAGE: &str = "record";

/// Default take name: the configured chrono format applied to local time.
pub fn default_filename(format: &str) -> String {
    chrono::Local::now().format(format).to_string()
}

/// Formats an elapsed duration as `HH:MM:SS`.
pub fn clock(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Stage factory: renders the capture command for each take.
pub struct CaptureStage {
    command: CommandTemplate,
    dir: PathBuf,
    sample_rate: u32,
    channels: u16,
}

impl CaptureStage {
    pub fn new(config: &RecordingConfig) -> Self {
        Self {
            command: CommandTemplate::new(config.capture_command.clone()),
            dir: config.dir.clone(),
            sample_rate: config.sample_rate,
            channels: config.channels,
        }
    }
}

impl Stage for CaptureStage {
    type Operation = Recording;

    fn name(&self) -> &'static str {
        STAGE
    }

    fn open(&mut self, job: &Job) -> Result<Recording, StageError> {
        let path = job.output.clone().ok_or(StageError::NoInput(STAGE))?;
        let duration = job.duration.unwrap_or(Duration::ZERO);
        let argv = self.command.render(&[
            ("output", path.to_string_lossy().into_owned()),
            ("duration", duration.as_secs().to_string()),
            ("rate", self.sample_rate.to_string()),
            ("channels", self.channels.to_string()),
        ])?;
        let process = Supervised::spawn(&argv, Some(&self.dir), Some(&log_path(&self.dir, STAGE)))?;
        Ok(Recording {
            process,
            path,
            duration,
            started: Instant::now(),
        })
    }
}

/// One take in progress. Owns the capture process.
pub struct Recording {
    process: Supervised,
    path: PathBuf,
    duration: Duration,
    started: Instant,
}

impl Operation for Recording {
    fn streams(&self) -> bool {
        true
    }

    fn run(mut self, ctx: &StageContext<'_>) -> Result<PathBuf, StageError> {
        let mut stream_open = true;
        let mut interrupted = false;

        while !ctx.finish_requested() {
            self.process.drain_lines();
            if stream_open {
                if !interrupted && !self.duration.is_zero() && self.started.elapsed() >= self.duration {
                    info!(stage = STAGE, "duration limit reached");
                    self.process.signal(UnixSignal::SIGINT);
                    interrupted = true;
                }
                if !self.process.is_alive()? {
                    stream_open = false;
                    ctx.end_stream();
                }
                ctx.report(clock(self.started.elapsed()));
            }
            thread::sleep(ctx.poll_interval());
        }

        let status = self.process.stop(UnixSignal::SIGINT)?;
        if !status.success() && !interrupted {
            warn!(stage = STAGE, "`{}` exited with {status}", self.process.rendered());
        }
        if self.path.exists() {
            Ok(self.path)
        } else {
            Err(StageError::MissingArtifact {
                stage: STAGE,
                path: self.path,
            })
        }
    }
}

/// Controller-side recorder: the worker plus the settings for the next take.
pub struct Recorder {
    worker: Worker,
    dir: PathBuf,
    filename_format: String,
    duration: Duration,
    filename: String,
}

impl Recorder {
    pub fn new(worker: Worker, config: &RecordingConfig) -> Self {
        Self {
            worker,
            dir: config.dir.clone(),
            filename_format: config.filename_format.clone(),
            duration: Duration::ZERO,
            filename: String::new(),
        }
    }

    pub fn set_duration(&mut self, secs: u64) -> Result<Duration, ProtocolError> {
        self.refuse_while_busy("set duration")?;
        self.duration = Duration::from_secs(secs);
        Ok(self.duration)
    }

    /// Sets the next take's file name, or a timestamp-derived default when `name` is `None`.
    pub fn set_filename(&mut self, name: Option<&str>) -> Result<String, ProtocolError> {
        self.refuse_while_busy("set filename")?;
        self.filename = match name {
            Some(name) => name.to_string(),
            None => default_filename(&self.filename_format),
        };
        Ok(self.filename.clone())
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.filename)
    }

    /// Length limit of the next (or current) take.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn start(&self) -> Result<(), ProtocolError> {
        self.worker.start(Job {
            input: None,
            output: Some(self.path()),
            duration: Some(self.duration),
        })
    }

    /// Asks the take to stop and returns the file it is written to.
    pub fn stop(&self) -> Result<PathBuf, ProtocolError> {
        self.worker.finish()?;
        Ok(self.path())
    }

    pub fn is_stream_active(&self) -> Result<bool, ProtocolError> {
        self.worker.is_stream_active()
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn worker_mut(&mut self) -> &mut Worker {
        &mut self.worker
    }

    pub fn monitor(&self) -> WorkerMonitor {
        self.worker.monitor()
    }

    fn refuse_while_busy(&self, action: &'static str) -> Result<(), ProtocolError> {
        if self.worker.is_busy() {
            return Err(ProtocolError::Busy { stage: STAGE, action });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const WAIT: Duration = Duration::from_secs(5);

    fn config(dir: &Path, command: &[&str]) -> RecordingConfig {
        RecordingConfig {
            dir: dir.to_path_buf(),
            capture_command: command.iter().map(|s| s.to_string()).collect(),
            ..RecordingConfig::default()
        }
    }

    fn recorder(config: &RecordingConfig) -> Recorder {
        let worker = Worker::spawn(CaptureStage::new(config), Duration::from_millis(5)).unwrap();
        Recorder::new(worker, config)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    // ── helpers ───────────────────────────────────────────────────────────────

    #[test]
    fn clock_formats_hours_minutes_seconds() {
        assert_eq!(clock(Duration::from_secs(0)), "00:00:00");
        assert_eq!(clock(Duration::from_secs(3725)), "01:02:05");
    }

    #[test]
    fn default_filename_uses_format() {
        let name = default_filename("STELC_%Y%m%d-%H%M.wav");
        // STELC_ + 8 date digits + '-' + 4 time digits + .wav
        assert_eq!(name.len(), "STELC_20260101-0000.wav".len());
        assert!(name.starts_with("STELC_"));
        assert!(name.ends_with(".wav"));
    }

    // ── settings ──────────────────────────────────────────────────────────────

    #[test]
    fn set_filename_defaults_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = recorder(&config(dir.path(), &["true"]));
        let name = r.set_filename(None).unwrap();
        assert!(name.starts_with("STELC_"));
        assert_eq!(r.set_filename(Some("gig.wav")).unwrap(), "gig.wav");
        assert_eq!(r.path(), dir.path().join("gig.wav"));
    }

    #[test]
    fn settings_refused_while_recording() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &["sh", "-c", "touch {output}; exec sleep 30"]);
        let mut r = recorder(&cfg);
        r.set_filename(Some("take.wav")).unwrap();
        r.set_duration(60).unwrap();
        r.start().unwrap();
        assert!(r.worker().confirm_started(WAIT));
        assert!(matches!(r.set_filename(Some("other.wav")), Err(ProtocolError::Busy { .. })));
        assert!(matches!(r.set_duration(5), Err(ProtocolError::Busy { .. })));
        r.stop().unwrap();
        wait_until(|| !r.worker().is_busy());
    }

    // ── recording lifecycle ───────────────────────────────────────────────────

    #[test]
    fn natural_end_reports_inactive_stream_then_waits_for_stop() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &["sh", "-c", "echo data > {output}"]);
        let mut r = recorder(&cfg);
        r.set_filename(Some("take.wav")).unwrap();
        r.set_duration(60).unwrap();
        r.start().unwrap();
        assert!(r.worker().confirm_started(WAIT));

        wait_until(|| !r.is_stream_active().unwrap());
        assert!(r.worker().is_running());

        let path = r.stop().unwrap();
        wait_until(|| !r.worker().is_busy());
        assert_eq!(r.worker().result(), Some(path));
        assert_eq!(r.monitor().violations(), 0);
    }

    #[test]
    fn stop_mid_take_keeps_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &["sh", "-c", "echo partial > {output}; exec sleep 30"]);
        let mut r = recorder(&cfg);
        r.set_filename(Some("take.wav")).unwrap();
        r.set_duration(3600).unwrap();
        r.start().unwrap();
        assert!(r.worker().confirm_started(WAIT));
        wait_until(|| dir.path().join("take.wav").exists());
        assert!(r.is_stream_active().unwrap());

        r.stop().unwrap();
        wait_until(|| !r.worker().is_busy());
        assert_eq!(r.worker().result(), Some(dir.path().join("take.wav")));
    }

    #[test]
    fn duration_limit_ends_stream() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &["sh", "-c", "echo x > {output}; exec sleep 30"]);
        let mut r = recorder(&cfg);
        r.set_filename(Some("short.wav")).unwrap();
        r.set_duration(1).unwrap();
        r.start().unwrap();
        assert!(r.worker().confirm_started(WAIT));
        wait_until(|| !r.is_stream_active().unwrap());
        r.stop().unwrap();
        wait_until(|| !r.worker().is_busy());
        assert!(r.worker().result().is_some());
    }

    #[test]
    fn missing_output_is_reported_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &["true"]);
        let mut r = recorder(&cfg);
        r.set_filename(Some("never.wav")).unwrap();
        r.set_duration(10).unwrap();
        r.start().unwrap();
        assert!(r.worker().confirm_started(WAIT));
        wait_until(|| !r.is_stream_active().unwrap());
        r.stop().unwrap();
        wait_until(|| !r.worker().is_busy());
        assert!(r.worker().result().is_none());
        assert!(r.worker().fail().contains("no output"));
    }
}
