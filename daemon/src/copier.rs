/// Copies the recordings directory onto every attached removable volume.
///
/// Volumes are discovered with `lsblk --json`, mounted with `udisksctl` when
/// needed and synced with rsync into `<mount>/<dest_subdir>/`. Afterwards every
/// volume is unmounted and its disk powered off so the stick can be pulled.
/// Mount, unmount, power-off and discovery are retried a few times; a volume
/// that still fails is skipped and noted in the worker's `fail`.
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Deserializer};
use tracing::{debug, info, warn};

use crate::command::{log_path, percent, Supervised};
use crate::config::CopyConfig;
use crate::worker::{Job, Operation, Stage, StageContext, StageError};

pub const STAGE: &str = "copy";

/// A writable removable filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub device: String,
    /// Whole-disk device the volume lives on, the unit that gets powered off.
    pub disk: String,
    pub label: Option<String>,
    pub mount_point: Option<PathBuf>,
}

/// Discovery and mount mechanics for removable media.
pub trait RemovableMedia: Send + Sync + 'static {
    fn discover(&self) -> Result<Vec<Volume>, StageError>;

    /// Mounts `device` and returns its mount point.
    fn mount(&self, device: &str) -> Result<PathBuf, StageError>;

    fn unmount(&self, device: &str) -> Result<(), StageError>;

    /// Powers off a whole disk once none of its volumes is mounted.
    fn detach(&self, disk: &str) -> Result<(), StageError>;
}

// ── udisks ────────────────────────────────────────────────────────────────────

/// `lsblk` for discovery, `udisksctl` for (un)mounting as the desktop user.
#[derive(Debug, Default)]
pub struct UdisksMedia;

impl RemovableMedia for UdisksMedia {
    fn discover(&self) -> Result<Vec<Volume>, StageError> {
        let json = run(&["lsblk", "--json", "-o", "NAME,PATH,RM,RO,TYPE,MOUNTPOINT,LABEL"])?;
        parse_lsblk(&json)
    }

    fn mount(&self, device: &str) -> Result<PathBuf, StageError> {
        let out = run(&["udisksctl", "mount", "--no-user-interaction", "-b", device])?;
        parse_mount_point(&out)
            .ok_or_else(|| StageError::Device(format!("unexpected udisksctl output: {}", out.trim())))
    }

    fn unmount(&self, device: &str) -> Result<(), StageError> {
        run(&["udisksctl", "unmount", "--no-user-interaction", "-b", device]).map(|_| ())
    }

    fn detach(&self, disk: &str) -> Result<(), StageError> {
        run(&["udisksctl", "power-off", "--no-user-interaction", "-b", disk]).map(|_| ())
    }
}

fn run(argv: &[&str]) -> Result<String, StageError> {
    let (program, args) = argv.split_first().ok_or(StageError::EmptyCommand)?;
    let rendered = argv.join(" ");
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| StageError::Spawn {
            command: rendered.clone(),
            source,
        })?;
    if !output.status.success() {
        return Err(StageError::ExitStatus {
            command: rendered,
            status: format!(
                "{} ({})",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[derive(Debug, Deserialize)]
struct Lsblk {
    blockdevices: Vec<BlockDevice>,
}

#[derive(Debug, Deserialize)]
struct BlockDevice {
    name: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default, deserialize_with = "flag")]
    rm: bool,
    #[serde(default, deserialize_with = "flag")]
    ro: bool,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    children: Vec<BlockDevice>,
}

/// Older util-linux reports boolean columns as `"0"`/`"1"`.
fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }
    Ok(match Option::<Flag>::deserialize(d)? {
        Some(Flag::Bool(b)) => b,
        Some(Flag::Text(s)) => s == "1",
        None => false,
    })
}

/// Extracts writable removable filesystems from `lsblk --json` output.
/// Partitions inherit the removable flag of their disk; volumes mounted as the
/// system root or boot partition are never offered.
pub fn parse_lsblk(json: &str) -> Result<Vec<Volume>, StageError> {
    let parsed: Lsblk = serde_json::from_str(json)
        .map_err(|e| StageError::Device(format!("cannot parse lsblk output: {e}")))?;
    let mut volumes = Vec::new();
    for device in &parsed.blockdevices {
        collect(device, None, false, &mut volumes);
    }
    Ok(volumes)
}

fn collect(device: &BlockDevice, disk: Option<&str>, parent_removable: bool, out: &mut Vec<Volume>) {
    let removable = device.rm || parent_removable;
    let path = device
        .path
        .clone()
        .unwrap_or_else(|| format!("/dev/{}", device.name));
    let disk = match disk {
        Some(disk) => disk.to_string(),
        None => path.clone(),
    };
    for child in &device.children {
        collect(child, Some(disk.as_str()), removable, out);
    }
    let leaf = device.kind == "part" || (device.kind == "disk" && device.children.is_empty());
    let system = device
        .mountpoint
        .as_deref()
        .is_some_and(|m| m == "/" || m.starts_with("/boot"));
    if removable && !device.ro && leaf && !system {
        out.push(Volume {
            device: path,
            disk,
            label: device.label.clone(),
            mount_point: device.mountpoint.as_ref().map(PathBuf::from),
        });
    }
}

/// `Mounted /dev/sda1 at /media/pi/STICK.` → `/media/pi/STICK`
pub fn parse_mount_point(output: &str) -> Option<PathBuf> {
    static MOUNTED: OnceLock<Regex> = OnceLock::new();
    let re = MOUNTED
        .get_or_init(|| Regex::new(r"(?m)^Mounted \S+ at (.+?)\.?\s*$").expect("valid regex"));
    re.captures(output).map(|c| PathBuf::from(&c[1]))
}

/// rsync's running transfer count, `(xfr#N, ...)`.
fn transfer_number(line: &str) -> Option<u32> {
    static XFR: OnceLock<Regex> = OnceLock::new();
    let re = XFR.get_or_init(|| Regex::new(r"xfr#(\d+)").expect("valid regex"));
    re.captures(line).and_then(|c| c[1].parse().ok())
}

/// Calls `f` up to `attempts` times, sleeping `delay` between failures.
pub fn retry<T>(
    attempts: u32,
    delay: Duration,
    what: &str,
    mut f: impl FnMut() -> Result<T, StageError>,
) -> Result<T, StageError> {
    let mut attempt = 1;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!(stage = STAGE, "{what} failed (attempt {attempt}/{attempts}): {e}");
                attempt += 1;
                thread::sleep(delay);
            }
            Err(e) => return Err(e),
        }
    }
}

// ── stage ─────────────────────────────────────────────────────────────────────

pub struct Copier<M: RemovableMedia> {
    media: Arc<M>,
    config: CopyConfig,
    /// The recordings directory: default copy source and home of `copy.log`.
    recordings: PathBuf,
}

impl<M: RemovableMedia> Copier<M> {
    pub fn new(media: M, config: &CopyConfig, recordings: impl Into<PathBuf>) -> Self {
        Self {
            media: Arc::new(media),
            config: config.clone(),
            recordings: recordings.into(),
        }
    }

    fn delay(&self) -> Duration {
        Duration::from_millis(self.config.retry_delay_ms)
    }
}

impl<M: RemovableMedia> Stage for Copier<M> {
    type Operation = UsbCopy<M>;

    fn name(&self) -> &'static str {
        STAGE
    }

    fn open(&mut self, job: &Job) -> Result<UsbCopy<M>, StageError> {
        let source = job.input.clone().unwrap_or_else(|| self.recordings.clone());
        let media = Arc::clone(&self.media);
        let volumes = retry(self.config.attempts, self.delay(), "discovery", || media.discover())?;
        if volumes.is_empty() {
            return Err(StageError::Device("no removable media found".to_string()));
        }
        info!(stage = STAGE, "found {} removable volume(s)", volumes.len());
        Ok(UsbCopy {
            media,
            volumes,
            source,
            config: self.config.clone(),
            log: log_path(&self.recordings, STAGE),
        })
    }
}

/// One copy run over the discovered volumes, in order.
pub struct UsbCopy<M: RemovableMedia> {
    media: Arc<M>,
    volumes: Vec<Volume>,
    source: PathBuf,
    config: CopyConfig,
    log: PathBuf,
}

impl<M: RemovableMedia> UsbCopy<M> {
    fn rsync_argv(&self, dest: &Path) -> Vec<String> {
        let mut argv = self.config.command.clone();
        argv.extend(self.config.include.iter().map(|p| format!("--include={p}")));
        argv.push("--exclude=*".to_string());
        argv.push(format!("{}/", self.source.display()));
        argv.push(format!("{}/", dest.display()));
        argv
    }

    /// Mounts (if needed) and syncs one volume. Returns the destination
    /// directory; `mounted` is set once the volume has a mount point.
    fn copy_to(
        &self,
        index: usize,
        volume: &Volume,
        ctx: &StageContext<'_>,
        mounted: &mut bool,
    ) -> Result<PathBuf, StageError> {
        let delay = Duration::from_millis(self.config.retry_delay_ms);
        let mount = match &volume.mount_point {
            Some(path) => {
                *mounted = true;
                path.clone()
            }
            None => {
                let path = retry(self.config.attempts, delay, "mount", || {
                    self.media.mount(&volume.device)
                })?;
                *mounted = true;
                path
            }
        };
        let dest = mount.join(&self.config.dest_subdir);
        std::fs::create_dir_all(&dest)?;

        let mut process = Supervised::spawn(&self.rsync_argv(&dest), None, Some(&self.log))?;
        let mut files = 0;
        process.supervise(ctx, |line| {
            if let Some(n) = transfer_number(line) {
                files = n;
            }
            if let Some(pct) = percent(line) {
                ctx.report(format!("{}.{} {pct}%", index + 1, files.max(1)));
            }
        })?;
        Ok(dest)
    }
}

impl<M: RemovableMedia> UsbCopy<M> {
    /// Unmounts every mounted volume, then powers off each disk whose volumes
    /// all came off cleanly. Failures are noted and the rest carries on.
    fn release(&self, mounted: &[bool], ctx: &StageContext<'_>) {
        let delay = Duration::from_millis(self.config.retry_delay_ms);
        let mut busy: Vec<&str> = Vec::new();
        for (volume, _) in self.volumes.iter().zip(mounted).filter(|(_, m)| **m) {
            if let Err(e) = retry(self.config.attempts, delay, "unmount", || {
                self.media.unmount(&volume.device)
            }) {
                ctx.note_failure(format!("{}: {e}", volume.device));
                busy.push(&volume.disk);
            }
        }

        let mut disks: Vec<&str> = Vec::new();
        for volume in &self.volumes {
            if !disks.contains(&volume.disk.as_str()) {
                disks.push(&volume.disk);
            }
        }
        for disk in disks {
            if busy.contains(&disk) {
                warn!(stage = STAGE, disk, "left powered on, a volume is still mounted");
                continue;
            }
            match retry(self.config.attempts, delay, "power-off", || self.media.detach(disk)) {
                Ok(()) => info!(stage = STAGE, disk, "safe to remove"),
                Err(e) => ctx.note_failure(format!("{disk}: {e}")),
            }
        }
    }
}

impl<M: RemovableMedia> Operation for UsbCopy<M> {
    fn run(self, ctx: &StageContext<'_>) -> Result<PathBuf, StageError> {
        let mut last_dest = None;
        let mut cancelled = false;

        // Volumes that are mounted already count as mounted before they are visited.
        let mut mounted: Vec<bool> = self.volumes.iter().map(|v| v.mount_point.is_some()).collect();

        for (index, volume) in self.volumes.iter().enumerate() {
            if ctx.finish_requested() {
                cancelled = true;
                break;
            }
            match self.copy_to(index, volume, ctx, &mut mounted[index]) {
                Ok(dest) => {
                    info!(
                        stage = STAGE,
                        device = %volume.device,
                        label = volume.label.as_deref().unwrap_or(""),
                        "copied to {}",
                        dest.display()
                    );
                    last_dest = Some(dest);
                }
                Err(StageError::Cancelled(_)) => cancelled = true,
                Err(e) => ctx.note_failure(format!("{}: {e}", volume.device)),
            }
            if cancelled {
                break;
            }
        }
        self.release(&mounted, ctx);

        match last_dest {
            Some(dest) => Ok(dest),
            None if cancelled => Err(StageError::Cancelled(STAGE)),
            None => {
                debug!(stage = STAGE, "no volume received a copy");
                Err(StageError::Device("copy failed on every volume".to_string()))
            }
        }
    }
}
