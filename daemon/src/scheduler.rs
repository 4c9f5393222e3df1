//! Calendar-driven scheduling and daily maintenance.
//!
//! The [`Scheduler`] thread owns the schedule provider and the retention
//! policy. It keeps exactly one cached event (the next or current one) and
//! answers the controller's near/due questions from that cache without ever
//! touching the provider on the controller's thread. Provider traffic happens
//! only on the scheduler tick, in priority order:
//!
//!   1. `shutdown`  leave the loop.
//!   2. `put`       write pending status updates back to the provider.
//!   3. `purge`     run the retention policy.
//!   4. `refresh`   re-query the next event.
//!   5. daily slot  purge, refresh, collect stray stage logs for re-upload.
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Local, NaiveDate, NaiveTime};
use tracing::{debug, error, info, warn};

use crate::calendar::{ScheduleEvent, ScheduleProvider, StatusUpdate};
use crate::config::{Config, RecordingConfig};
use crate::retention::{RetentionError, RetentionPolicy, SpaceProbe};
use crate::signal::{Signal, Slot};

/// Source of wall-clock time, shared by the scheduler and the controller.
pub type Clock = Arc<dyn Fn() -> DateTime<Local> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Local::now)
}

/// Length of the daily maintenance slot.
const DAILY_SLOT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick: Duration,
    pub look_ahead: Duration,
    pub daily_at: NaiveTime,
    /// Expected take length when no event is cached.
    pub default_record_secs: u64,
    pub recording: RecordingConfig,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            tick: config.controller.tick(),
            look_ahead: Duration::from_secs(config.schedule.look_ahead_secs),
            daily_at: config.schedule.daily_time()?,
            default_record_secs: config.controller.default_record_secs,
            recording: config.recording.clone(),
        })
    }
}

/// `0 <= start - now < window` for an event with a positive duration.
pub fn starts_within(event: &ScheduleEvent, now: DateTime<Local>, window: Duration) -> bool {
    if event.is_blank() || event.duration_secs == 0 {
        return false;
    }
    let (Some(start), Ok(window)) = (event.start, chrono::Duration::from_std(window)) else {
        return false;
    };
    let until = start - now;
    until >= chrono::Duration::zero() && until < window
}

/// Whether `now` falls in today's maintenance slot and the slot has not run yet.
pub fn daily_due(now: DateTime<Local>, at: NaiveTime, last_run: Option<NaiveDate>) -> bool {
    if last_run == Some(now.date_naive()) {
        return false;
    }
    let since = now.time().signed_duration_since(at);
    since >= chrono::Duration::zero() && since.to_std().is_ok_and(|d| d < DAILY_SLOT)
}

#[derive(Debug)]
struct Shared {
    current: Slot<ScheduleEvent>,
    /// Events whose merged status still has to be written to the provider.
    outbox: Slot<Vec<ScheduleEvent>>,
    stray_logs: Slot<Vec<PathBuf>>,
    fail: Slot<String>,
    put: Signal,
    purge: Signal,
    refresh: Signal,
    shutdown: Signal,
    fatal: Signal,
}

/// The controller's view of the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
    clock: Clock,
    tick: Duration,
}

impl SchedulerHandle {
    pub fn now(&self) -> DateTime<Local> {
        (self.clock)()
    }

    /// Snapshot of the cached event.
    pub fn current(&self) -> ScheduleEvent {
        self.shared.current.snapshot()
    }

    pub fn is_near(&self, window: Duration) -> bool {
        self.is_near_at(self.now(), window)
    }

    pub fn is_near_at(&self, now: DateTime<Local>, window: Duration) -> bool {
        starts_within(&self.current(), now, window)
    }

    /// The cached event starts within the next tick.
    pub fn is_due(&self) -> bool {
        self.is_due_at(self.now())
    }

    pub fn is_due_at(&self, now: DateTime<Local>) -> bool {
        starts_within(&self.current(), now, self.tick)
    }

    /// Merges `update` into `target`'s status, in the cache too when `target`
    /// is the cached event, and queues the result for the next put. Returns
    /// the merged event.
    pub fn update_items(&self, target: &ScheduleEvent, update: &StatusUpdate) -> ScheduleEvent {
        if target.is_blank() {
            return target.clone();
        }
        let mut merged = target.clone();
        if let Some(pending) = self
            .shared
            .outbox
            .snapshot()
            .into_iter()
            .find(|e| e.id == target.id)
        {
            merged.status = pending.status;
        }
        merged.status.merge(update);

        self.shared.current.update(|current| {
            if current.id == merged.id {
                current.status = merged.status.clone();
            }
        });
        self.shared.outbox.update(|outbox| {
            outbox.retain(|e| e.id != merged.id);
            outbox.push(merged.clone());
        });
        merged
    }

    pub fn request_put(&self) {
        self.shared.put.set();
    }

    pub fn request_refresh(&self) {
        self.shared.refresh.set();
    }

    pub fn request_purge(&self) {
        self.shared.purge.set();
    }

    /// Retention could not free enough space.
    pub fn is_fatal(&self) -> bool {
        self.shared.fatal.is_set()
    }

    pub fn fail(&self) -> String {
        self.shared.fail.snapshot()
    }

    /// Stage logs found by the daily routine, handed over once.
    pub fn take_stray_logs(&self) -> Vec<PathBuf> {
        self.shared.stray_logs.update(std::mem::take)
    }
}

pub struct Scheduler {
    handle: SchedulerHandle,
    thread: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawns the scheduler thread. The first tick connects to the provider
    /// and loads the next event.
    pub fn spawn<P: ScheduleProvider, S: SpaceProbe>(
        provider: P,
        probe: S,
        policy: RetentionPolicy,
        settings: SchedulerSettings,
        clock: Clock,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            current: Slot::new(ScheduleEvent::blank()),
            outbox: Slot::new(Vec::new()),
            stray_logs: Slot::new(Vec::new()),
            fail: Slot::new(String::new()),
            put: Signal::new("put"),
            purge: Signal::new("purge"),
            refresh: Signal::new("refresh"),
            shutdown: Signal::new("shutdown"),
            fatal: Signal::new("fatal"),
        });
        shared.refresh.set();

        let handle = SchedulerHandle {
            shared: Arc::clone(&shared),
            clock: Arc::clone(&clock),
            tick: settings.tick,
        };
        let worker = SchedulerLoop {
            provider,
            probe,
            policy,
            settings,
            clock,
            shared,
            last_daily: None,
        };
        let thread = thread::Builder::new()
            .name("scheduler".to_string())
            .spawn(move || worker.run())?;
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    pub fn shutdown(&mut self) {
        self.handle.shared.shutdown.set();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("scheduler thread panicked");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct SchedulerLoop<P, S> {
    provider: P,
    probe: S,
    policy: RetentionPolicy,
    settings: SchedulerSettings,
    clock: Clock,
    shared: Arc<Shared>,
    last_daily: Option<NaiveDate>,
}

impl<P: ScheduleProvider, S: SpaceProbe> SchedulerLoop<P, S> {
    fn run(mut self) {
        if let Err(e) = self.provider.connect() {
            warn!("schedule provider unavailable: {e}");
        }
        loop {
            if self.shared.shutdown.is_set() {
                break;
            } else if self.shared.put.take() {
                self.put_events();
            } else if self.shared.purge.take() {
                self.purge();
            } else if self.shared.refresh.take() {
                self.refresh();
            } else if daily_due((self.clock)(), self.settings.daily_at, self.last_daily) {
                self.daily();
            }
            thread::sleep(self.settings.tick);
        }
        debug!("scheduler stopped");
    }

    fn put_events(&mut self) {
        let pending = self.shared.outbox.update(std::mem::take);
        let mut failed = Vec::new();
        for event in pending {
            match self.provider.patch(&event.id, &event.status.to_json()) {
                Ok(()) => info!(event = %event.id, "schedule status saved"),
                Err(e) => {
                    warn!(event = %event.id, "failed to save schedule status: {e}");
                    failed.push(event);
                }
            }
        }
        // Failed writes wait for the next put, unless a newer update superseded them.
        if !failed.is_empty() {
            self.shared.outbox.update(|outbox| {
                for event in failed {
                    if !outbox.iter().any(|e| e.id == event.id) {
                        outbox.push(event);
                    }
                }
            });
        }
    }

    fn refresh(&mut self) {
        let now = (self.clock)();
        let mut event = match self.provider.get_next(now, self.settings.look_ahead) {
            Ok(event) if event.is_blank() => {
                // An empty answer may be an outage; a soon-due event stays cached.
                debug!("no scheduled recording ahead, cache kept");
                return;
            }
            Ok(event) => event,
            Err(e) => {
                warn!("schedule refresh failed: {e}");
                return;
            }
        };
        if let Some(pending) = self
            .shared
            .outbox
            .snapshot()
            .into_iter()
            .find(|e| e.id == event.id)
        {
            event.status = pending.status;
        }
        if event.id != self.shared.current.snapshot().id {
            info!(event = %event.id, start = ?event.start, "next scheduled recording: {}", event.summary);
        }
        self.shared.current.publish(event);
    }

    fn purge(&mut self) {
        let current = self.shared.current.snapshot();
        let secs = if !current.is_blank() && current.duration_secs > 0 {
            current.duration_secs
        } else {
            self.settings.default_record_secs
        };
        let expected = self.settings.recording.expected_bytes(secs);

        let provider = &mut self.provider;
        let shared = &self.shared;
        let result = self
            .policy
            .purge(&self.probe, expected, |path| {
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    return;
                };
                mark_purged(provider, shared, name);
            });

        match result {
            Ok(report) => debug!(
                removed = report.removed.len(),
                "retention ok: {} bytes available, {} required",
                report.available,
                report.required
            ),
            Err(e @ RetentionError::InsufficientSpace { .. }) => {
                error!("{e}");
                self.shared.fail.publish(e.to_string());
                self.shared.fatal.set();
            }
            Err(e) => warn!("retention purge failed: {e}"),
        }
    }

    fn daily(&mut self) {
        let now = (self.clock)();
        info!("daily maintenance");
        self.last_daily = Some(now.date_naive());
        self.purge();
        self.refresh();
        self.collect_logs();
    }

    fn collect_logs(&mut self) {
        let pattern = self.policy.dir().join("*.log");
        let logs: Vec<PathBuf> = match glob::glob(&pattern.to_string_lossy()) {
            Ok(paths) => paths.filter_map(|p| p.ok()).collect(),
            Err(e) => {
                warn!("cannot list stage logs: {e}");
                return;
            }
        };
        if logs.is_empty() {
            return;
        }
        info!("{} stage log(s) queued for upload", logs.len());
        self.shared.stray_logs.update(|queued| {
            for log in logs {
                if !queued.contains(&log) {
                    queued.push(log);
                }
            }
        });
    }
}

/// Marks the event that recorded `filename` as purged, in the provider and in
/// the cache.
fn mark_purged<P: ScheduleProvider>(provider: &mut P, shared: &Shared, filename: &str) {
    let event = match provider.get_by("filename", filename) {
        Ok(event) if !event.is_blank() => event,
        Ok(_) => return,
        Err(e) => {
            warn!("cannot look up event for purged {filename}: {e}");
            return;
        }
    };
    let mut status = event.status.clone();
    status.merge(&StatusUpdate::purged());
    if let Err(e) = provider.patch(&event.id, &status.to_json()) {
        warn!(event = %event.id, "failed to mark event purged: {e}");
    }
    shared.current.update(|current| {
        if current.id == event.id {
            current.status.purged = true;
        }
    });
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// A clock tests move by hand.
    #[derive(Clone)]
    pub struct ManualClock(pub Arc<Mutex<DateTime<Local>>>);

    impl ManualClock {
        pub fn at(now: DateTime<Local>) -> Self {
            Self(Arc::new(Mutex::new(now)))
        }

        pub fn set(&self, now: DateTime<Local>) {
            *self.0.lock().unwrap() = now;
        }

        pub fn clock(&self) -> Clock {
            let now = Arc::clone(&self.0);
            Arc::new(move || *now.lock().unwrap())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ManualClock;
    use super::*;
    use crate::calendar::testing::MemoryCalendar;
    use crate::calendar::EventStatus;
    use crate::config::RetentionConfig;
    use crate::retention::testing::FixedSpace;
    use chrono::TimeZone;
    use std::path::Path;
    use std::time::Instant;

    const TICK: Duration = Duration::from_millis(2);
    const WAIT: Duration = Duration::from_secs(5);

    fn t0() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 5, 3, 9, 50, 0).unwrap()
    }

    fn event(id: &str, start: DateTime<Local>, duration_secs: u64) -> ScheduleEvent {
        ScheduleEvent {
            id: id.to_string(),
            summary: format!("{id} service"),
            start: Some(start),
            duration_secs,
            status: EventStatus::default(),
        }
    }

    fn settings(dir: &Path) -> SchedulerSettings {
        SchedulerSettings {
            tick: TICK,
            look_ahead: Duration::from_secs(86_400),
            // Out of the way unless a test moves the clock there.
            daily_at: NaiveTime::from_hms_opt(3, 30, 0).unwrap(),
            default_record_secs: 3600,
            recording: RecordingConfig {
                dir: dir.to_path_buf(),
                ..RecordingConfig::default()
            },
        }
    }

    fn spawn(
        calendar: &MemoryCalendar,
        free: u64,
        dir: &Path,
        clock: &ManualClock,
    ) -> Scheduler {
        let policy = RetentionPolicy::new(
            dir,
            vec!["STELC_*.wav".to_string()],
            &RetentionConfig { safety_factor: 2.5 },
        );
        Scheduler::spawn(calendar.clone(), FixedSpace(free), policy, settings(dir), clock.clock())
            .unwrap()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    // ── pure predicates ───────────────────────────────────────────────────────

    #[test]
    fn starts_within_is_half_open() {
        let e = event("e", t0(), 60);
        let w = Duration::from_secs(10);
        assert!(starts_within(&e, t0(), w));
        assert!(starts_within(&e, t0() - chrono::Duration::seconds(9), w));
        assert!(!starts_within(&e, t0() - chrono::Duration::seconds(10), w));
        assert!(!starts_within(&e, t0() + chrono::Duration::seconds(1), w));
    }

    #[test]
    fn starts_within_needs_positive_duration_and_id() {
        let w = Duration::from_secs(10);
        assert!(!starts_within(&event("e", t0(), 0), t0(), w));
        assert!(!starts_within(&ScheduleEvent::blank(), t0(), w));
    }

    #[test]
    fn daily_due_fires_once_per_day_inside_slot() {
        let at = NaiveTime::from_hms_opt(3, 30, 0).unwrap();
        let slot = Local.with_ymd_and_hms(2026, 5, 3, 3, 30, 20).unwrap();
        assert!(daily_due(slot, at, None));
        assert!(!daily_due(slot, at, Some(slot.date_naive())));
        assert!(daily_due(slot, at, Some(slot.date_naive().pred_opt().unwrap())));

        let before = Local.with_ymd_and_hms(2026, 5, 3, 3, 29, 59).unwrap();
        let after = Local.with_ymd_and_hms(2026, 5, 3, 3, 31, 0).unwrap();
        assert!(!daily_due(before, at, None));
        assert!(!daily_due(after, at, None));
    }

    // ── near / due ────────────────────────────────────────────────────────────

    #[test]
    fn event_ten_minutes_out_is_near_then_due() {
        let dir = tempfile::tempdir().unwrap();
        let start = t0() + chrono::Duration::minutes(10);
        let calendar = MemoryCalendar::with(vec![event("svc", start, 3600)]);
        let clock = ManualClock::at(t0());
        let scheduler = spawn(&calendar, u64::MAX, dir.path(), &clock);
        let handle = scheduler.handle();
        wait_until(|| handle.current().id == "svc");

        assert!(handle.is_near(Duration::from_secs(900)));
        assert!(!handle.is_due());

        clock.set(start);
        assert!(handle.is_due());
        assert_eq!(handle.current().duration_secs, 3600);
    }

    #[test]
    fn empty_lookup_keeps_cached_event() {
        let dir = tempfile::tempdir().unwrap();
        // "far" is outside the look-ahead, so lookups come back empty once "a"
        // is gone; it only serves as a patch target below.
        let far = event("far", t0() + chrono::Duration::days(3), 60);
        let calendar = MemoryCalendar::with(vec![
            event("a", t0() + chrono::Duration::hours(1), 60),
            far.clone(),
        ]);
        let clock = ManualClock::at(t0());
        let scheduler = spawn(&calendar, u64::MAX, dir.path(), &clock);
        let handle = scheduler.handle();
        wait_until(|| handle.current().id == "a");

        calendar.events.lock().unwrap().retain(|e| e.id != "a");
        handle.request_refresh();
        wait_until(|| !handle.shared.refresh.is_set());
        // The put is served on a later loop pass than the refresh.
        handle.update_items(&far, &StatusUpdate::uploaded());
        handle.request_put();
        wait_until(|| calendar.patch_count() == 1);

        assert_eq!(handle.current().id, "a");
    }

    // ── update_items / put ────────────────────────────────────────────────────

    #[test]
    fn update_then_put_is_visible_by_filename() {
        let dir = tempfile::tempdir().unwrap();
        let calendar = MemoryCalendar::with(vec![event("svc", t0() + chrono::Duration::hours(1), 60)]);
        let clock = ManualClock::at(t0());
        let scheduler = spawn(&calendar, u64::MAX, dir.path(), &clock);
        let handle = scheduler.handle();
        wait_until(|| handle.current().id == "svc");

        let target = handle.current();
        let merged = handle.update_items(&target, &StatusUpdate::filename("STELC_x.wav"));
        assert_eq!(merged.status.filename.as_deref(), Some("STELC_x.wav"));
        // Cache reflects the update before it is persisted.
        assert_eq!(handle.current().status.filename.as_deref(), Some("STELC_x.wav"));
        assert_eq!(calendar.patch_count(), 0);

        handle.request_put();
        wait_until(|| calendar.patch_count() == 1);

        let mut provider = calendar.clone();
        let found = provider.get_by("filename", "STELC_x.wav").unwrap();
        assert_eq!(found.id, "svc");
        assert_eq!(found.status.filename.as_deref(), Some("STELC_x.wav"));
    }

    #[test]
    fn updates_to_an_event_no_longer_cached_still_persist() {
        let dir = tempfile::tempdir().unwrap();
        let first = event("first", t0() + chrono::Duration::minutes(5), 60);
        let calendar = MemoryCalendar::with(vec![first.clone()]);
        let clock = ManualClock::at(t0());
        let scheduler = spawn(&calendar, u64::MAX, dir.path(), &clock);
        let handle = scheduler.handle();
        wait_until(|| handle.current().id == "first");

        // The cache moves on to a later event while "first" is being uploaded.
        calendar
            .events
            .lock()
            .unwrap()
            .push(event("second", t0() + chrono::Duration::hours(2), 60));
        clock.set(t0() + chrono::Duration::minutes(10));
        handle.request_refresh();
        wait_until(|| handle.current().id == "second");

        handle.update_items(&first, &StatusUpdate::uploaded());
        handle.request_put();
        wait_until(|| calendar.patch_count() == 1);
        assert!(calendar.event("first").unwrap().status.uploaded);
        assert!(!handle.current().status.uploaded);
    }

    #[test]
    fn blank_target_is_not_queued() {
        let dir = tempfile::tempdir().unwrap();
        let calendar = MemoryCalendar::default();
        let clock = ManualClock::at(t0());
        let scheduler = spawn(&calendar, u64::MAX, dir.path(), &clock);
        let handle = scheduler.handle();
        handle.update_items(&ScheduleEvent::blank(), &StatusUpdate::uploaded());
        handle.request_put();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(calendar.patch_count(), 0);
    }

    // ── purge ─────────────────────────────────────────────────────────────────

    fn wav(dir: &Path, name: &str, mtime: i64) {
        let path = dir.join(name);
        std::fs::write(&path, b"RIFF").unwrap();
        filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(mtime, 0)).unwrap();
    }

    #[test]
    fn purge_marks_recording_event_purged() {
        let dir = tempfile::tempdir().unwrap();
        wav(dir.path(), "STELC_old.wav", 1_000);
        wav(dir.path(), "STELC_new.wav", 2_000);

        let mut recorded = event("old", t0() - chrono::Duration::days(7), 3600);
        recorded.status.filename = Some("STELC_old.wav".to_string());
        let calendar = MemoryCalendar::with(vec![recorded]);
        let clock = ManualClock::at(t0());
        // Space never suffices, so every candidate goes and the purge is fatal.
        let scheduler = spawn(&calendar, 0, dir.path(), &clock);
        let handle = scheduler.handle();

        handle.request_purge();
        wait_until(|| handle.is_fatal());

        assert!(!dir.path().join("STELC_old.wav").exists());
        assert!(dir.path().join("STELC_new.wav").exists());
        assert!(calendar.event("old").unwrap().status.purged);
        assert!(handle.fail().contains("not enough disk space"));
    }

    #[test]
    fn purge_with_enough_space_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        wav(dir.path(), "STELC_old.wav", 1_000);
        wav(dir.path(), "STELC_new.wav", 2_000);
        let calendar = MemoryCalendar::default();
        let clock = ManualClock::at(t0());
        let scheduler = spawn(&calendar, u64::MAX, dir.path(), &clock);
        let handle = scheduler.handle();

        handle.request_purge();
        thread::sleep(Duration::from_millis(30));
        assert!(!handle.is_fatal());
        assert!(dir.path().join("STELC_old.wav").exists());
    }

    // ── daily routine ─────────────────────────────────────────────────────────

    #[test]
    fn daily_routine_collects_stage_logs_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("convert.log"), "x").unwrap();
        std::fs::write(dir.path().join("upload.log"), "y").unwrap();
        let calendar = MemoryCalendar::default();
        let clock = ManualClock::at(Local.with_ymd_and_hms(2026, 5, 3, 3, 30, 5).unwrap());
        let scheduler = spawn(&calendar, u64::MAX, dir.path(), &clock);
        let handle = scheduler.handle();

        let mut logs = Vec::new();
        wait_until(|| {
            logs.extend(handle.take_stray_logs());
            logs.len() == 2
        });
        logs.sort();
        assert_eq!(logs, vec![dir.path().join("convert.log"), dir.path().join("upload.log")]);

        // Still inside the slot, but today's run already happened.
        thread::sleep(Duration::from_millis(30));
        assert!(handle.take_stray_logs().is_empty());
    }
}
