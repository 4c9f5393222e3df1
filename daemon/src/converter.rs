/// Transcodes a finished take (wav by default) to the configured compressed format.
use std::path::PathBuf;

use crate::command::{log_path, CommandOperation, CommandTemplate, Supervised};
use crate::config::ConvertConfig;
use crate::worker::{Job, Stage, StageError};

pub const STAGE: &str = "convert";

pub struct Converter {
    command: CommandTemplate,
    extension: String,
    log_dir: PathBuf,
}

impl Converter {
    pub fn new(config: &ConvertConfig, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: CommandTemplate::new(config.command.clone()),
            extension: config.extension.clone(),
            log_dir: log_dir.into(),
        }
    }
}

impl Stage for Converter {
    type Operation = CommandOperation;

    fn name(&self) -> &'static str {
        STAGE
    }

    fn open(&mut self, job: &Job) -> Result<CommandOperation, StageError> {
        let input = job.input.as_ref().ok_or(StageError::NoInput(STAGE))?;
        let output = job
            .output
            .clone()
            .unwrap_or_else(|| input.with_extension(&self.extension));
        let argv = self.command.render(&[
            ("input", input.to_string_lossy().into_owned()),
            ("output", output.to_string_lossy().into_owned()),
        ])?;
        let process = Supervised::spawn(&argv, None, Some(&log_path(&self.log_dir, STAGE)))?;
        Ok(CommandOperation {
            process,
            artifact: output,
            stage: STAGE,
            verify_artifact: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::Worker;
    use std::thread;
    use std::time::{Duration, Instant};

    fn converter(dir: &std::path::Path, command: &[&str]) -> Worker {
        let config = ConvertConfig {
            command: command.iter().map(|s| s.to_string()).collect(),
            extension: "mp3".to_string(),
        };
        Worker::spawn(Converter::new(&config, dir), Duration::from_millis(5)).unwrap()
    }

    fn wait_idle(w: &Worker) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while w.is_busy() {
            assert!(Instant::now() < deadline, "converter never went idle");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn converts_next_to_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("take.wav");
        std::fs::write(&input, b"RIFF").unwrap();

        let w = converter(dir.path(), &["cp", "{input}", "{output}"]);
        w.start(Job::with_input(&input)).unwrap();
        wait_idle(&w);

        assert_eq!(w.result(), Some(dir.path().join("take.mp3")));
        assert_eq!(w.fail(), "");
        assert!(dir.path().join("convert.log").exists());
    }

    #[test]
    fn progress_reports_percentage() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("take.wav");
        std::fs::write(&input, b"RIFF").unwrap();

        let w = converter(
            dir.path(),
            &["sh", "-c", "printf ' 50%%\\r'; cp {input} {output}; printf '100%%\\n'"],
        );
        w.start(Job::with_input(&input)).unwrap();
        wait_idle(&w);
        assert_eq!(w.progress(), "100%");
    }

    #[test]
    fn nonzero_exit_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let w = converter(dir.path(), &["false"]);
        w.start(Job::with_input(dir.path().join("take.wav"))).unwrap();
        wait_idle(&w);
        assert!(w.result().is_none());
        assert!(w.fail().contains("exited with"));
    }

    #[test]
    fn clean_exit_without_output_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let w = converter(dir.path(), &["true"]);
        w.start(Job::with_input(dir.path().join("take.wav"))).unwrap();
        wait_idle(&w);
        assert!(w.fail().contains("no output"));
    }

    #[test]
    fn missing_input_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let w = converter(dir.path(), &["true"]);
        w.start(Job::default()).unwrap();
        wait_idle(&w);
        assert!(w.fail().contains("no input"));
    }

    #[test]
    fn finish_terminates_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let w = converter(dir.path(), &["sleep", "30"]);
        w.start(Job::with_input(dir.path().join("take.wav"))).unwrap();
        assert!(w.confirm_started(Duration::from_secs(5)));
        w.finish().unwrap();
        wait_idle(&w);
        assert!(w.result().is_none());
        assert_eq!(w.fail(), "");
    }
}
