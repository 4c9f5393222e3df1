/// Disk-space retention: frees room for the next take by deleting the oldest
/// recordings.
///
/// Candidates are the files in the recordings directory matching any of the
/// configured globs, ordered oldest first by modification time (whole seconds,
/// ties broken by file name). The newest candidate is never deleted.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use sysinfo::Disks;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::RetentionConfig;

#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("not enough disk space: need {required} bytes, {available} available after removing {removed} file(s)")]
    InsufficientSpace {
        required: u64,
        available: u64,
        removed: usize,
    },

    #[error("no mounted filesystem holds {}", .0.display())]
    NoDisk(PathBuf),

    #[error("invalid recording pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reports the bytes available to new files under a directory.
pub trait SpaceProbe: Send + 'static {
    fn available(&self, dir: &Path) -> Result<u64, RetentionError>;
}

/// Free space of the filesystem mounted deepest above the directory.
#[derive(Debug, Default)]
pub struct DiskSpace;

impl SpaceProbe for DiskSpace {
    fn available(&self, dir: &Path) -> Result<u64, RetentionError> {
        let dir = dir.canonicalize()?;
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| dir.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or(RetentionError::NoDisk(dir))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub modified_secs: u64,
}

/// Matching files in `dir`, oldest first, with the newest one left out.
pub fn candidates(dir: &Path, patterns: &[String]) -> Result<Vec<Candidate>, RetentionError> {
    // Keyed by path so a file matched by two patterns is listed once.
    let mut found = BTreeMap::new();
    for pattern in patterns {
        let pattern = dir.join(pattern);
        for entry in glob::glob(&pattern.to_string_lossy())? {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!("skipping unreadable retention candidate: {e}");
                    continue;
                }
            };
            let metadata = std::fs::metadata(&path)?;
            if !metadata.is_file() {
                continue;
            }
            let modified_secs = metadata
                .modified()?
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            found.insert(path.clone(), Candidate { path, modified_secs });
        }
    }

    let mut sorted: Vec<Candidate> = found.into_values().collect();
    sorted.sort_by(|a, b| {
        a.modified_secs
            .cmp(&b.modified_secs)
            .then_with(|| a.path.file_name().cmp(&b.path.file_name()))
    });
    sorted.pop();
    Ok(sorted)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub removed: Vec<PathBuf>,
    pub required: u64,
    pub available: u64,
}

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    dir: PathBuf,
    patterns: Vec<String>,
    safety_factor: f64,
}

impl RetentionPolicy {
    pub fn new(dir: impl Into<PathBuf>, patterns: Vec<String>, config: &RetentionConfig) -> Self {
        Self {
            dir: dir.into(),
            patterns,
            safety_factor: config.safety_factor,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn required(&self, expected_bytes: u64) -> u64 {
        (expected_bytes as f64 * self.safety_factor).ceil() as u64
    }

    /// Deletes candidates, oldest first, until `expected_bytes × safety_factor`
    /// fits in the space `probe` reports. `on_removed` is called with every
    /// deleted path.
    pub fn purge(
        &self,
        probe: &dyn SpaceProbe,
        expected_bytes: u64,
        mut on_removed: impl FnMut(&Path),
    ) -> Result<PurgeReport, RetentionError> {
        let required = self.required(expected_bytes);
        let mut queue = candidates(&self.dir, &self.patterns)?.into_iter();
        let mut removed = Vec::new();

        loop {
            let available = probe.available(&self.dir)?;
            if available >= required {
                if !removed.is_empty() {
                    info!(
                        removed = removed.len(),
                        "retention freed space: {available} bytes available, {required} required"
                    );
                }
                return Ok(PurgeReport {
                    removed,
                    required,
                    available,
                });
            }

            let Some(oldest) = queue.next() else {
                return Err(RetentionError::InsufficientSpace {
                    required,
                    available,
                    removed: removed.len(),
                });
            };

            match std::fs::remove_file(&oldest.path) {
                Ok(()) => {
                    info!("retention removed {}", oldest.path.display());
                    on_removed(&oldest.path);
                    removed.push(oldest.path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}
