/// Pushes a file to remote storage through the configured upload command.
///
/// The command sees `{input}` (absolute path) and `{name}` (bare file name).
/// Progress lines carrying a percentage are republished as `NN%`.
use std::path::PathBuf;

use crate::command::{log_path, CommandOperation, CommandTemplate, Supervised};
use crate::config::UploadConfig;
use crate::worker::{Job, Stage, StageError};

pub const STAGE: &str = "upload";

pub struct Uploader {
    command: CommandTemplate,
    log_dir: PathBuf,
}

impl Uploader {
    pub fn new(config: &UploadConfig, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: CommandTemplate::new(config.command.clone()),
            log_dir: log_dir.into(),
        }
    }
}

impl Stage for Uploader {
    type Operation = CommandOperation;

    fn name(&self) -> &'static str {
        STAGE
    }

    fn open(&mut self, job: &Job) -> Result<CommandOperation, StageError> {
        let input = job.input.clone().ok_or(StageError::NoInput(STAGE))?;
        let input = if input.is_relative() {
            std::env::current_dir()?.join(input)
        } else {
            input
        };
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or(StageError::NoInput(STAGE))?;
        let argv = self.command.render(&[
            ("input", input.to_string_lossy().into_owned()),
            ("name", name),
        ])?;
        // Output of sending upload.log must not be appended to the file being sent.
        let log = log_path(&self.log_dir, STAGE);
        let log = (input != log).then_some(log);
        let process = Supervised::spawn(&argv, None, log.as_deref())?;
        Ok(CommandOperation {
            process,
            artifact: input,
            stage: STAGE,
            verify_artifact: false,
        })
    }
}
