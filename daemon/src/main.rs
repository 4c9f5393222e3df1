mod calendar;
mod command;
mod config;
mod controller;
mod converter;
mod copier;
mod event;
mod panel;
mod paths;
mod recorder;
mod retention;
mod scheduler;
mod signal;
mod uploader;
mod worker;

use std::thread;

use anyhow::{Context, Result};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::calendar::FileCalendar;
use crate::controller::{Controller, ControllerExit, ControllerSettings, Stages};
use crate::converter::Converter;
use crate::copier::{Copier, UdisksMedia};
use crate::event::DaemonEvent;
use crate::panel::StatusFilePanel;
use crate::recorder::{CaptureStage, Recorder};
use crate::retention::{DiskSpace, RetentionPolicy};
use crate::scheduler::{Scheduler, SchedulerSettings};
use crate::uploader::Uploader;
use crate::worker::Worker;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let (event_tx, mut event_rx) = mpsc::channel::<DaemonEvent>(32);

    let (controller, watched) = match build() {
        Ok(parts) => parts,
        Err(e) => {
            error!("startup failed: {e:#}");
            std::process::exit(1);
        }
    };
    let handle = controller.handle();

    // ── Controller thread ─────────────────────────────────────────────────────
    let controller_thread = {
        let tx = event_tx.clone();
        let spawned = thread::Builder::new()
            .name("controller".to_string())
            .spawn(move || {
                let exit = controller.run();
                let _ = tx.blocking_send(DaemonEvent::ControllerExited(exit));
            });
        match spawned {
            Ok(thread) => thread,
            Err(e) => {
                error!("failed to start controller thread: {e}");
                std::process::exit(1);
            }
        }
    };

    // ── Background tasks ──────────────────────────────────────────────────────
    tokio::spawn(calendar::watch_calendar(watched, event_tx.clone()));
    tokio::spawn(panel::read_actions(
        BufReader::new(tokio::io::stdin()),
        event_tx.clone(),
    ));

    // Graceful shutdown on Ctrl+C.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(DaemonEvent::Shutdown).await;
            }
        });
    }
    drop(event_tx);

    info!("stelc-daemon v{} started", env!("CARGO_PKG_VERSION"));

    // ── Event loop ────────────────────────────────────────────────────────────
    let mut outcome = ControllerExit::Quit;
    while let Some(evt) = event_rx.recv().await {
        match evt {
            DaemonEvent::Panel(action) => handle.dispatch(action),
            DaemonEvent::CalendarChanged => handle.update_schedule(),
            DaemonEvent::Shutdown => {
                info!("shutting down");
                handle.stop();
            }
            DaemonEvent::ControllerExited(exit) => {
                outcome = exit;
                break;
            }
        }
    }

    if controller_thread.join().is_err() {
        error!("controller thread panicked");
        std::process::exit(1);
    }
    if let ControllerExit::Fatal(message) = outcome {
        error!("stopped: {message}");
        std::process::exit(1);
    }
}

/// Loads the configuration and creates every worker, the scheduler and the
/// controller. Returns the controller and the calendar to watch.
fn build() -> Result<(Controller<StatusFilePanel>, FileCalendar)> {
    // ── App data directory ────────────────────────────────────────────────────
    let app_dir = paths::app_data_dir()?;
    std::fs::create_dir_all(&app_dir)
        .with_context(|| format!("Failed to create app data directory {}", app_dir.display()))?;

    // ── Configuration ─────────────────────────────────────────────────────────
    let mut config = config::load_or_default(&paths::config_file_path()?)?;
    config.validate()?;
    config.resolve_paths(&app_dir);
    let dir = config.recording.dir.clone();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create recordings directory {}", dir.display()))?;

    // ── Stages ────────────────────────────────────────────────────────────────
    let tick = config.controller.tick();
    let stages = Stages {
        recorder: Recorder::new(
            Worker::spawn(CaptureStage::new(&config.recording), tick)?,
            &config.recording,
        ),
        converter: Worker::spawn(Converter::new(&config.convert, &dir), tick)?,
        uploader: Worker::spawn(Uploader::new(&config.upload, &dir), tick)?,
        copier: Worker::spawn(Copier::new(UdisksMedia, &config.copy, &dir), tick)?,
    };

    // ── Scheduler ─────────────────────────────────────────────────────────────
    let policy = RetentionPolicy::new(&dir, config.recording.patterns.clone(), &config.retention);
    let calendar = FileCalendar::new(&config.schedule.calendar_file);
    let scheduler = Scheduler::spawn(
        calendar.clone(),
        DiskSpace,
        policy,
        SchedulerSettings::from_config(&config)?,
        scheduler::system_clock(),
    )?;

    let panel = StatusFilePanel::new(paths::status_file_path()?);
    let controller = Controller::new(ControllerSettings::from_config(&config), stages, scheduler, panel);
    Ok((controller, calendar))
}
