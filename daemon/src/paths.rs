/// Canonical file paths for the daemon's data files.
///
/// Everything lives under the app data directory (`$STELC_HOME`, or
/// `$HOME/.stelc` when unset):
///   - config.toml    Hand-edited, read at startup.
///   - status.toml    Written by the daemon's front panel every state change.
///   - calendar.toml  Default location of the file-backed schedule.
use anyhow::{Context, Result};
use std::path::PathBuf;

const APP_DIR_ENV: &str = "STELC_HOME";
const APP_DIR_NAME: &str = ".stelc";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";

/// Returns the app data directory.
pub fn app_data_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(APP_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var_os("HOME")
        .with_context(|| format!("Neither {APP_DIR_ENV} nor HOME is set"))?;
    Ok(PathBuf::from(home).join(APP_DIR_NAME))
}

/// Returns the full path to the config file: `<app dir>/config.toml`
pub fn config_file_path() -> Result<PathBuf> {
    Ok(app_data_dir()?.join(CONFIG_FILE_NAME))
}

/// Returns the full path to the status file: `<app dir>/status.toml`
pub fn status_file_path() -> Result<PathBuf> {
    Ok(app_data_dir()?.join(STATUS_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment variables are process-wide, so every assertion that touches
    // STELC_HOME lives in this single test.
    #[test]
    fn paths_follow_stelc_home() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(APP_DIR_ENV, dir.path());

        assert_eq!(app_data_dir().unwrap(), dir.path());

        let config = config_file_path().unwrap();
        let status = status_file_path().unwrap();
        assert_eq!(config.file_name().unwrap(), CONFIG_FILE_NAME);
        assert_eq!(status.file_name().unwrap(), STATUS_FILE_NAME);
        assert_eq!(config.parent(), status.parent());

        std::env::remove_var(APP_DIR_ENV);
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(app_data_dir().unwrap(), PathBuf::from(home).join(APP_DIR_NAME));
        }
    }
}
