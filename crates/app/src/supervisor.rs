//! Restart loop around the occupancy pipeline.
//!
//! The store and encoder outlive individual runs, so readers keep the last
//! snapshot while a stalled or lost source is being reopened.

use std::{
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use parking::{
    OccupancyStore, ParkingConfig, PipelineDriver, PipelineError, PipelineHandle,
    PipelineOutcome, PlateStrategy, pipeline::telemetry,
};
use tracing::{debug, error, info, warn};
use video_ingest::join_bounded;

const SUPERVISOR_POLL: Duration = Duration::from_millis(200);
const RESTART_DELAY: Duration = Duration::from_secs(1);
const STATUS_INTERVAL: Duration = Duration::from_secs(1);
/// A run lasting this long resets the restart budget.
const HEALTHY_RUN: Duration = Duration::from_secs(60);

/// Run the pipeline until Ctrl+C, restarting it on recoverable faults.
pub fn run(config: ParkingConfig) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    if config
        .recognition
        .as_ref()
        .is_some_and(|recognition| recognition.plates.strategy != PlateStrategy::Scoped)
    {
        warn!(
            "Whole-frame plates are handed to occupied spots in detection order, not matched by position"
        );
    }

    let store = Arc::new(OccupancyStore::new(config.spot_count()));
    let driver =
        PipelineDriver::new(config.clone(), store.clone()).with_shutdown(shutdown.clone());
    let monitor = spawn_status_monitor(store.clone(), shutdown.clone())?;
    info!(
        "Monitoring {} spots from {} (Ctrl+C to stop)",
        config.spot_count(),
        config.source.uri
    );

    let result = restart_loop(&driver, &config, &shutdown);

    shutdown.store(true, Ordering::SeqCst);
    if !join_bounded(monitor, STATUS_INTERVAL * 2) {
        warn!("Status monitor did not exit in time");
    }
    if let Some(rendered) = telemetry::render_metrics() {
        debug!("Final metrics:\n{rendered}");
    }
    println!("{}", store.snapshot().to_json()?);
    result
}

fn restart_loop(
    driver: &PipelineDriver,
    config: &ParkingConfig,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    let mut restarts: u32 = 0;
    while !shutdown.load(Ordering::SeqCst) {
        let started = Instant::now();
        let outcome = match driver.start() {
            Ok(handle) => supervise(&handle, shutdown),
            Err(err @ PipelineError::Initialization(_)) => {
                return Err(err).context("pipeline could not be initialised");
            }
            Err(err) => {
                error!("Pipeline failed to start: {:#}", anyhow::Error::from(err));
                PipelineOutcome::SourceLost
            }
        };

        if !outcome.is_restartable() || shutdown.load(Ordering::SeqCst) {
            info!("Pipeline finished ({outcome:?})");
            break;
        }
        if started.elapsed() >= HEALTHY_RUN {
            restarts = 0;
        }
        restarts = restarts.saturating_add(1);
        if restarts > config.max_restarts {
            bail!(
                "giving up after {} restarts (last outcome: {outcome:?})",
                config.max_restarts
            );
        }
        warn!("Restarting pipeline after {outcome:?}, attempt #{restarts}");
        metrics::counter!("parking_pipeline_restarts_total").increment(1);
        sleep_unless(shutdown, RESTART_DELAY);
    }
    Ok(())
}

fn supervise(handle: &PipelineHandle, shutdown: &AtomicBool) -> PipelineOutcome {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return handle.stop();
        }
        if let Some(component) = handle.stalled() {
            warn!("Pipeline stalled in {} stage", component.label());
            return handle.stop();
        }
        if handle.is_finished() {
            return handle.stop();
        }
        thread::sleep(SUPERVISOR_POLL);
    }
}

fn sleep_unless(shutdown: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline && !shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(50));
    }
}

/// Log the occupancy summary whenever the counts change.
fn spawn_status_monitor(
    store: Arc<OccupancyStore>,
    shutdown: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread("parking-status", move || {
        let mut last: Option<(usize, usize)> = None;
        while !shutdown.load(Ordering::SeqCst) {
            let snapshot = store.snapshot();
            let counts = (snapshot.occupied, snapshot.available);
            if last != Some(counts) && snapshot.updated_at.is_some() {
                info!(
                    "Occupancy: {} occupied, {} available of {}",
                    snapshot.occupied, snapshot.available, snapshot.total
                );
                match snapshot.to_json() {
                    Ok(json) => debug!("Status: {json}"),
                    Err(err) => warn!("Failed to serialise status: {err:#}"),
                }
                last = Some(counts);
            }
            sleep_unless(&shutdown, STATUS_INTERVAL);
        }
    })
    .context("failed to spawn status monitor")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_returns_early_on_shutdown() {
        let shutdown = AtomicBool::new(true);
        let start = Instant::now();
        sleep_unless(&shutdown, Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn status_monitor_exits_on_shutdown() {
        let store = Arc::new(OccupancyStore::new(4));
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = spawn_status_monitor(store, shutdown.clone()).unwrap();
        shutdown.store(true, Ordering::SeqCst);
        assert!(join_bounded(handle, Duration::from_secs(3)));
    }
}
