//! Supervised external commands for the capture, convert, upload and copy stages.
//!
//! A [`Supervised`] child has its stdout and stderr drained on helper threads
//! into a line channel (splitting on `\r` as well as `\n`, so progress meters
//! that redraw a single line still arrive line by line). Every line is appended
//! to the stage's log file in the recordings directory.
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal as UnixSignal};
use nix::unistd::Pid;
use regex::Regex;
use tracing::{debug, warn};

use crate::worker::{Operation, StageContext, StageError};

/// How long a child gets to exit after SIGINT/SIGTERM before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(5);
const STOP_POLL: Duration = Duration::from_millis(20);
/// How long to wait for output still buffered in the pipes after an exit.
const TRAIL_GRACE: Duration = Duration::from_secs(1);

/// An argv template with `{name}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    argv: Vec<String>,
}

impl CommandTemplate {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    /// Substitutes `vars` into every argument. Unknown placeholders are kept verbatim.
    pub fn render(&self, vars: &[(&str, String)]) -> Result<Vec<String>, StageError> {
        if self.argv.is_empty() {
            return Err(StageError::EmptyCommand);
        }
        Ok(self
            .argv
            .iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |acc, (key, value)| {
                    acc.replace(&format!("{{{key}}}"), value)
                })
            })
            .collect())
    }
}

/// Path of a stage's command log inside `dir`.
pub fn log_path(dir: &Path, stage: &str) -> PathBuf {
    dir.join(format!("{stage}.log"))
}

/// Moves a delivered log to `<name>.1`, replacing the previous generation, so
/// the stage starts a fresh file on its next run.
pub fn rotate_log(log: &Path) -> std::io::Result<PathBuf> {
    let mut rotated = log.as_os_str().to_owned();
    rotated.push(".1");
    let rotated = PathBuf::from(rotated);
    std::fs::rename(log, &rotated)?;
    Ok(rotated)
}

/// Extracts the last `NN%` figure from a progress line.
pub fn percent(line: &str) -> Option<u8> {
    static PERCENT: OnceLock<Regex> = OnceLock::new();
    let re = PERCENT.get_or_init(|| Regex::new(r"(\d{1,3})(?:\.\d+)?%").expect("valid regex"));
    re.captures_iter(line)
        .last()
        .and_then(|c| c[1].parse::<u8>().ok())
        .filter(|p| *p <= 100)
}

/// A running child process with its output forwarded as lines.
pub struct Supervised {
    rendered: String,
    child: Child,
    lines: Receiver<String>,
    log: Option<File>,
    status: Option<ExitStatus>,
}

impl Supervised {
    /// Spawns `argv`, appending its output to `log` when given.
    pub fn spawn(argv: &[String], cwd: Option<&Path>, log: Option<&Path>) -> Result<Self, StageError> {
        let (program, args) = argv.split_first().ok_or(StageError::EmptyCommand)?;
        let rendered = argv.join(" ");

        let mut log = match log {
            Some(path) => match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => Some(file),
                Err(e) => {
                    warn!("cannot open command log {}: {e}", path.display());
                    None
                }
            },
            None => None,
        };
        if let Some(file) = log.as_mut() {
            let _ = writeln!(
                file,
                "[{}] command: {rendered}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
            );
        }

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        let mut child = command.spawn().map_err(|source| StageError::Spawn {
            command: rendered.clone(),
            source,
        })?;

        let (tx, lines) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx);
        }
        debug!("spawned `{rendered}` (pid {})", child.id());

        Ok(Self {
            rendered,
            child,
            lines,
            log,
            status: None,
        })
    }

    pub fn rendered(&self) -> &str {
        &self.rendered
    }

    /// Non-blocking exit check.
    pub fn is_alive(&mut self) -> Result<bool, StageError> {
        if self.status.is_some() {
            return Ok(false);
        }
        self.status = self.child.try_wait()?;
        Ok(self.status.is_none())
    }

    /// Returns output lines received since the last call, logging each.
    pub fn drain_lines(&mut self) -> Vec<String> {
        let lines: Vec<String> = self.lines.try_iter().collect();
        self.log_lines(&lines);
        lines
    }

    /// Collects output still in flight after the child exited, waiting briefly
    /// for both reader threads to reach end of file.
    fn trailing_lines(&mut self) -> Vec<String> {
        let deadline = Instant::now() + TRAIL_GRACE;
        let mut lines = Vec::new();
        while let Ok(line) = self
            .lines
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
        {
            lines.push(line);
        }
        self.log_lines(&lines);
        lines
    }

    fn log_lines(&mut self, lines: &[String]) {
        if let Some(file) = self.log.as_mut() {
            for line in lines {
                let _ = writeln!(file, "{line}");
            }
        }
    }

    /// Delivers `sig` to the child, ignoring a child that already exited.
    pub fn signal(&mut self, sig: UnixSignal) {
        if matches!(self.is_alive(), Ok(false)) {
            return;
        }
        let Ok(pid) = i32::try_from(self.child.id()) else {
            return;
        };
        if let Err(e) = signal::kill(Pid::from_raw(pid), sig) {
            debug!("{sig} to `{}` failed: {e}", self.rendered);
        }
    }

    /// Sends `sig`, waits up to the grace period, then kills.
    pub fn stop(&mut self, sig: UnixSignal) -> Result<ExitStatus, StageError> {
        self.signal(sig);
        let deadline = Instant::now() + STOP_GRACE;
        while self.is_alive()? {
            if Instant::now() >= deadline {
                warn!("`{}` ignored {sig}; killing", self.rendered);
                self.child.kill()?;
                break;
            }
            thread::sleep(STOP_POLL);
        }
        let status = self.wait()?;
        self.trailing_lines();
        Ok(status)
    }

    /// Blocks until the child exits.
    pub fn wait(&mut self) -> Result<ExitStatus, StageError> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self.child.wait()?;
        self.status = Some(status);
        Ok(status)
    }

    /// Polls the child every `ctx.poll_interval()` until it exits, feeding each
    /// output line to `on_line`. A finish request terminates the child with
    /// SIGTERM and yields [`StageError::Cancelled`].
    pub fn supervise(
        &mut self,
        ctx: &StageContext<'_>,
        mut on_line: impl FnMut(&str),
    ) -> Result<(), StageError> {
        loop {
            for line in self.drain_lines() {
                on_line(&line);
            }
            if !self.is_alive()? {
                break;
            }
            if ctx.finish_requested() {
                self.stop(UnixSignal::SIGTERM)?;
                return Err(StageError::Cancelled(ctx.stage()));
            }
            thread::sleep(ctx.poll_interval());
        }
        let status = self.wait()?;
        for line in self.trailing_lines() {
            on_line(&line);
        }
        if status.success() {
            Ok(())
        } else {
            Err(StageError::ExitStatus {
                command: self.rendered.clone(),
                status: status.to_string(),
            })
        }
    }
}

impl Drop for Supervised {
    fn drop(&mut self) {
        if matches!(self.is_alive(), Ok(true)) {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn forward_lines(mut reader: impl Read + Send + 'static, tx: Sender<String>) {
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        let mut pending = Vec::new();
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for &byte in &buf[..n] {
                if byte == b'\n' || byte == b'\r' {
                    if !pending.is_empty() {
                        let line = String::from_utf8_lossy(&pending).into_owned();
                        pending.clear();
                        if tx.send(line).is_err() {
                            return;
                        }
                    }
                } else {
                    pending.push(byte);
                }
            }
        }
        if !pending.is_empty() {
            let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
        }
    });
}

/// A single command whose successful exit yields `artifact`.
///
/// Used by the converter (artifact = the converted file) and the uploader
/// (artifact = the uploaded file).
pub struct CommandOperation {
    pub process: Supervised,
    pub artifact: PathBuf,
    pub stage: &'static str,
    /// Whether `artifact` must exist on disk after a successful exit.
    pub verify_artifact: bool,
}

impl Operation for CommandOperation {
    fn run(mut self, ctx: &StageContext<'_>) -> Result<PathBuf, StageError> {
        self.process.supervise(ctx, |line| {
            if let Some(pct) = percent(line) {
                ctx.report(format!("{pct}%"));
            }
        })?;
        if self.verify_artifact && !self.artifact.exists() {
            return Err(StageError::MissingArtifact {
                stage: self.stage,
                path: self.artifact,
            });
        }
        Ok(self.artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    // ── log rotation ──────────────────────────────────────────────────────────

    #[test]
    fn rotate_log_replaces_previous_generation() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_path(dir.path(), "upload");

        std::fs::write(&log, "monday").unwrap();
        let rotated = rotate_log(&log).unwrap();
        assert_eq!(rotated, dir.path().join("upload.log.1"));
        assert!(!log.exists());

        std::fs::write(&log, "tuesday").unwrap();
        rotate_log(&log).unwrap();
        assert_eq!(std::fs::read_to_string(&rotated).unwrap(), "tuesday");
    }

    #[test]
    fn rotate_missing_log_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(rotate_log(&log_path(dir.path(), "copy")).is_err());
    }

    // ── CommandTemplate ───────────────────────────────────────────────────────

    #[test]
    fn render_substitutes_placeholders() {
        let t = CommandTemplate::new(argv(&["lame", "{input}", "{output}"]));
        let out = t
            .render(&[("input", "/r/a.wav".into()), ("output", "/r/a.mp3".into())])
            .unwrap();
        assert_eq!(out, argv(&["lame", "/r/a.wav", "/r/a.mp3"]));
    }

    #[test]
    fn render_substitutes_inside_arguments() {
        let t = CommandTemplate::new(argv(&["rclone", "copyto", "{input}", "remote:takes/{name}"]));
        let out = t
            .render(&[("input", "/r/a.mp3".into()), ("name", "a.mp3".into())])
            .unwrap();
        assert_eq!(out[3], "remote:takes/a.mp3");
    }

    #[test]
    fn render_keeps_unknown_placeholders() {
        let t = CommandTemplate::new(argv(&["echo", "{nope}"]));
        assert_eq!(t.render(&[]).unwrap(), argv(&["echo", "{nope}"]));
    }

    #[test]
    fn render_rejects_empty_template() {
        let t = CommandTemplate::new(Vec::new());
        assert!(matches!(t.render(&[]), Err(StageError::EmptyCommand)));
    }

    // ── percent ───────────────────────────────────────────────────────────────

    #[test]
    fn percent_parses_rsync_line() {
        let line = "     32,768 100%   31.25MB/s    0:00:00 (xfr#1, to-chk=3/5)";
        assert_eq!(percent(line), Some(100));
    }

    #[test]
    fn percent_takes_last_figure() {
        assert_eq!(percent("Frame 10 ( 5%) ... 42.5%"), Some(42));
    }

    #[test]
    fn percent_ignores_lines_without_figure() {
        assert_eq!(percent("sending incremental file list"), None);
        assert_eq!(percent("250%"), None);
    }

    // ── Supervised ────────────────────────────────────────────────────────────

    #[test]
    fn spawn_missing_program_is_spawn_error() {
        let err = Supervised::spawn(&argv(&["/nonexistent/stelc-test-binary"]), None, None)
            .err()
            .unwrap();
        assert!(matches!(err, StageError::Spawn { .. }));
    }

    #[test]
    fn output_lines_are_forwarded_and_logged() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_path(dir.path(), "convert");
        let mut child = Supervised::spawn(
            &argv(&["sh", "-c", "printf 'one\\rtwo\\nthree\\n'; echo err >&2"]),
            None,
            Some(&log),
        )
        .unwrap();
        let status = child.wait().unwrap();
        assert!(status.success());

        // Reader threads may trail the exit slightly.
        let mut lines = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while lines.len() < 4 && Instant::now() < deadline {
            lines.extend(child.drain_lines());
            thread::sleep(Duration::from_millis(5));
        }
        for expected in ["one", "two", "three", "err"] {
            assert!(lines.iter().any(|l| l == expected), "missing {expected}: {lines:?}");
        }
        let logged = std::fs::read_to_string(&log).unwrap();
        assert!(logged.contains("command: sh -c"));
        assert!(logged.contains("three"));
    }

    #[test]
    fn stop_interrupts_long_running_child() {
        let mut child = Supervised::spawn(&argv(&["sleep", "30"]), None, None).unwrap();
        assert!(child.is_alive().unwrap());
        let started = Instant::now();
        let status = child.stop(UnixSignal::SIGTERM).unwrap();
        assert!(!status.success());
        assert!(started.elapsed() < STOP_GRACE);
    }
}
