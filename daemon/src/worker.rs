//! Worker threads: one long-running operation per stage, driven by signals.
//!
//! A [`Worker`] owns a dedicated thread that ticks at a fixed period. Each tick
//! it evaluates its signals in priority order and runs at most one handler:
//!
//!   1. `shutdown`  leave the loop.
//!   2. `start`     open a fresh [`Operation`] from the [`Stage`], set
//!                  `running`, clear `start`, run it to completion, publish
//!                  `result`/`fail`, clear `running`.
//!   3. `finish`    a finish request that arrived after the operation already
//!                  ended; discard it.
//!
//! The controller is the only writer of `start`, `finish` and the job payload;
//! the worker thread is the only writer of `running`, `stream`, `progress`,
//! `result` and `fail`.
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::signal::{Signal, Slot};

/// Granularity of the controller's bounded wait for a stage to report running.
const CONFIRM_POLL: Duration = Duration::from_millis(5);

/// Failures of a single stage invocation. Surfaced through the worker's `fail`.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}")]
    ExitStatus { command: String, status: String },

    #[error("{stage} produced no output at {}", path.display())]
    MissingArtifact { stage: &'static str, path: PathBuf },

    #[error("{0} job has no input")]
    NoInput(&'static str),

    #[error("command template is empty")]
    EmptyCommand,

    #[error("{0} cancelled")]
    Cancelled(&'static str),

    #[error("{0}")]
    Device(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Requests that break the coordination protocol. These never happen in a
/// correct pipeline; every occurrence is counted on the worker.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("{action} requested on {stage} with no active operation")]
    NoActiveOperation {
        stage: &'static str,
        action: &'static str,
    },

    #[error("{action} requested on {stage} while it is busy")]
    Busy {
        stage: &'static str,
        action: &'static str,
    },
}

/// Payload handed to a stage. Written by the controller before `start` is set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Job {
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub duration: Option<Duration>,
}

impl Job {
    pub fn with_input(input: impl Into<PathBuf>) -> Self {
        Self {
            input: Some(input.into()),
            ..Self::default()
        }
    }
}

/// Factory for a stage's per-invocation operation. Lives as long as the worker.
pub trait Stage: Send + 'static {
    type Operation: Operation;

    fn name(&self) -> &'static str;

    /// Builds a fresh operation for `job`, acquiring its OS resources.
    fn open(&mut self, job: &Job) -> Result<Self::Operation, StageError>;
}

/// One invocation of a stage. Dropped as soon as `run` returns.
pub trait Operation {
    /// Whether the operation drives a live input stream whose end the
    /// controller watches through [`Worker::is_stream_active`].
    fn streams(&self) -> bool {
        false
    }

    /// Runs to completion on the worker thread. Must poll
    /// [`StageContext::finish_requested`] at least every poll interval and
    /// return promptly once it is set.
    fn run(self, ctx: &StageContext<'_>) -> Result<PathBuf, StageError>;
}

/// The view of the worker's published fields an operation may touch.
pub struct StageContext<'a> {
    shared: &'a Shared,
    poll: Duration,
}

impl StageContext<'_> {
    pub fn finish_requested(&self) -> bool {
        self.shared.finish.is_set()
    }

    pub fn report(&self, progress: impl Into<String>) {
        self.shared.progress.publish(progress.into());
    }

    /// Marks the input stream as ended. The operation keeps running until
    /// the controller asks it to finish.
    pub fn end_stream(&self) {
        self.shared.stream.clear();
    }

    /// Records a failure that does not end the operation.
    pub fn note_failure(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        warn!(stage = self.shared.name, "{message}");
        self.shared.fail.update(|fail| {
            if !fail.is_empty() {
                fail.push_str("; ");
            }
            fail.push_str(message);
        });
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll
    }

    pub fn stage(&self) -> &'static str {
        self.shared.name
    }
}

#[derive(Debug)]
struct Shared {
    name: &'static str,
    start: Signal,
    running: Signal,
    finish: Signal,
    stream: Signal,
    shutdown: Signal,
    job: Slot<Job>,
    progress: Slot<String>,
    result: Slot<Option<PathBuf>>,
    fail: Slot<String>,
    violations: AtomicUsize,
}

impl Shared {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Signal::new("start"),
            running: Signal::new("running"),
            finish: Signal::new("finish"),
            stream: Signal::new("stream"),
            shutdown: Signal::new("shutdown"),
            job: Slot::new(Job::default()),
            progress: Slot::new(String::new()),
            result: Slot::new(None),
            fail: Slot::new(String::new()),
            violations: AtomicUsize::new(0),
        }
    }

    fn busy(&self) -> bool {
        self.start.is_set() || self.running.is_set()
    }
}

/// Read-only view of a worker, usable from any thread.
#[derive(Debug, Clone)]
pub struct WorkerMonitor {
    shared: Arc<Shared>,
}

impl WorkerMonitor {
    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.is_set()
    }

    pub fn violations(&self) -> usize {
        self.shared.violations.load(Ordering::Relaxed)
    }
}

/// Controller-side handle of a stage thread.
pub struct Worker {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns the worker thread for `stage`, ticking every `tick`.
    pub fn spawn<S: Stage>(stage: S, tick: Duration) -> std::io::Result<Self> {
        let shared = Arc::new(Shared::new(stage.name()));
        let thread = thread::Builder::new()
            .name(format!("{}-worker", stage.name()))
            .spawn({
                let shared = Arc::clone(&shared);
                move || tick_loop(stage, &shared, tick)
            })?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    pub fn monitor(&self) -> WorkerMonitor {
        WorkerMonitor {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Publishes `job` and then sets `start`.
    pub fn start(&self, job: Job) -> Result<(), ProtocolError> {
        if self.shared.busy() {
            return Err(self.violation(ProtocolError::Busy {
                stage: self.shared.name,
                action: "start",
            }));
        }
        self.shared.job.publish(job);
        self.shared.start.set();
        Ok(())
    }

    /// Waits up to `timeout` for a requested start to be picked up.
    ///
    /// Returns `true` once `running` is observed. Returns `false` on timeout or
    /// when `start` is cleared without `running` ever being seen (the operation
    /// failed to open, or opened and finished within one poll).
    pub fn confirm_started(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.running.is_set() {
                return true;
            }
            if !self.shared.start.is_set() || Instant::now() >= deadline {
                return false;
            }
            thread::sleep(CONFIRM_POLL);
        }
    }

    /// Asks the active operation to finish now, keeping what it has produced.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        if !self.shared.busy() {
            return Err(self.violation(ProtocolError::NoActiveOperation {
                stage: self.shared.name,
                action: "finish",
            }));
        }
        self.shared.finish.set();
        Ok(())
    }

    /// `start` or `running` is set: the stage has not yet delivered its result.
    pub fn is_busy(&self) -> bool {
        self.shared.busy()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.is_set()
    }

    pub fn is_stream_active(&self) -> Result<bool, ProtocolError> {
        if !self.shared.running.is_set() {
            return Err(self.violation(ProtocolError::NoActiveOperation {
                stage: self.shared.name,
                action: "stream query",
            }));
        }
        Ok(self.shared.stream.is_set())
    }

    pub fn progress(&self) -> String {
        self.shared.progress.snapshot()
    }

    /// Artifact of the last completed invocation.
    pub fn result(&self) -> Option<PathBuf> {
        self.shared.result.snapshot()
    }

    /// Failure text of the last invocation; empty when it succeeded.
    pub fn fail(&self) -> String {
        self.shared.fail.snapshot()
    }

    /// Stops the active operation (if any) and joins the thread.
    pub fn shutdown(&mut self) {
        self.shared.shutdown.set();
        if self.shared.busy() {
            self.shared.finish.set();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(stage = self.shared.name, "worker thread panicked");
            }
        }
    }

    fn violation(&self, err: ProtocolError) -> ProtocolError {
        self.shared.violations.fetch_add(1, Ordering::Relaxed);
        error!(stage = self.shared.name, "protocol violation: {err}");
        err
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn tick_loop<S: Stage>(mut stage: S, shared: &Shared, tick: Duration) {
    debug!(stage = shared.name, "worker started");
    loop {
        if shared.shutdown.is_set() {
            break;
        } else if shared.start.is_set() {
            execute(&mut stage, shared, tick);
        } else if shared.finish.take() {
            debug!(
                stage = shared.name,
                signal = shared.finish.name(),
                "discarded request for a completed operation"
            );
        }
        thread::sleep(tick);
    }
    debug!(stage = shared.name, "worker stopped");
}

fn execute<S: Stage>(stage: &mut S, shared: &Shared, tick: Duration) {
    let job = shared.job.snapshot();
    shared.result.publish(None);
    shared.fail.publish(String::new());
    shared.progress.publish(String::new());

    let operation = match stage.open(&job) {
        Ok(operation) => operation,
        Err(e) => {
            warn!(stage = shared.name, "failed to start: {e}");
            shared.fail.publish(e.to_string());
            shared.start.clear();
            return;
        }
    };

    if operation.streams() {
        shared.stream.set();
    }
    // `running` goes up before `start` comes down so the stage never looks idle
    // to the controller between request and completion.
    shared.running.set();
    shared.start.clear();
    info!(stage = shared.name, input = ?job.input.as_deref().map(Path::display), "started");

    let ctx = StageContext { shared, poll: tick };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| operation.run(&ctx)));

    match outcome {
        Ok(Ok(path)) => {
            info!(stage = shared.name, output = %path.display(), "finished");
            shared.result.publish(Some(path));
        }
        Ok(Err(StageError::Cancelled(_))) => {
            info!(stage = shared.name, "cancelled before producing output");
        }
        Ok(Err(e)) => {
            warn!(stage = shared.name, "failed: {e}");
            ctx.note_failure(e.to_string());
        }
        Err(_) => {
            error!(stage = shared.name, "operation panicked");
            ctx.note_failure(format!("{} operation panicked", shared.name));
        }
    }

    shared.stream.clear();
    shared.finish.clear();
    shared.running.clear();
}
