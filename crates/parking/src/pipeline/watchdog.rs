//! Watchdog that notices stalled pipeline stages.
//!
//! Capture, processing and encoding each record a heartbeat. When one stops
//! beating for longer than the stall threshold the watchdog records the
//! culprit and clears the run flag, so the driver winds down and the
//! supervisor can start a fresh pipeline.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::error;

use crate::pipeline::telemetry;

/// Grace period at startup allowing the source and models to warm up.
pub(crate) const WATCHDOG_STARTUP_GRACE_MS: u64 = 5_000;
const WATCHDOG_MAX_POLL_MS: u64 = 500;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
/// Logical components monitored by the watchdog.
pub enum HealthComponent {
    Capture,
    Processing,
    Encoding,
}

impl HealthComponent {
    pub fn label(self) -> &'static str {
        match self {
            HealthComponent::Capture => "capture",
            HealthComponent::Processing => "processing",
            HealthComponent::Encoding => "encoding",
        }
    }
}

pub(crate) struct PipelineHealth {
    capture: AtomicU64,
    processing: AtomicU64,
    encoding: AtomicU64,
    stale_after_ms: u64,
}

impl PipelineHealth {
    pub(crate) fn new(stale_after: Duration) -> Self {
        Self::starting_at(current_millis(), stale_after)
    }

    fn starting_at(now: u64, stale_after: Duration) -> Self {
        let grace_deadline = now.saturating_add(WATCHDOG_STARTUP_GRACE_MS);
        Self {
            capture: AtomicU64::new(grace_deadline),
            processing: AtomicU64::new(grace_deadline),
            encoding: AtomicU64::new(grace_deadline),
            stale_after_ms: stale_after.as_millis() as u64,
        }
    }

    pub(crate) fn beat(&self, component: HealthComponent) {
        self.beat_at(component, current_millis());
    }

    fn beat_at(&self, component: HealthComponent, now: u64) {
        self.slot(component).store(now, Ordering::Relaxed);
    }

    fn slot(&self, component: HealthComponent) -> &AtomicU64 {
        match component {
            HealthComponent::Capture => &self.capture,
            HealthComponent::Processing => &self.processing,
            HealthComponent::Encoding => &self.encoding,
        }
    }

    /// First component whose last heartbeat is older than the threshold.
    pub(crate) fn stale_component(&self, now: u64) -> Option<HealthComponent> {
        [
            HealthComponent::Capture,
            HealthComponent::Processing,
            HealthComponent::Encoding,
        ]
        .into_iter()
        .find(|&component| {
            now.saturating_sub(self.slot(component).load(Ordering::Relaxed)) > self.stale_after_ms
        })
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis((self.stale_after_ms / 4).clamp(10, WATCHDOG_MAX_POLL_MS))
    }
}

/// Shared record of whether, and why, the watchdog fired.
pub(crate) struct WatchdogState {
    triggered: AtomicBool,
    reason: Mutex<Option<HealthComponent>>,
}

impl WatchdogState {
    pub(crate) fn new() -> Self {
        Self {
            triggered: AtomicBool::new(false),
            reason: Mutex::new(None),
        }
    }

    pub(crate) fn arm(&self, component: HealthComponent) {
        if let Ok(mut guard) = self.reason.lock() {
            *guard = Some(component);
        }
        self.triggered.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub(crate) fn reason(&self) -> Option<HealthComponent> {
        match self.reason.lock() {
            Ok(guard) => *guard,
            Err(_) => None,
        }
    }
}

/// Spawn the watchdog thread; it exits once `running` clears or `shutdown` is set.
pub(crate) fn spawn_watchdog(
    health: Arc<PipelineHealth>,
    running: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    state: Arc<WatchdogState>,
) -> std::io::Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread("parking-watchdog", move || {
        let poll = health.poll_interval();
        while running.load(Ordering::Relaxed) && !shutdown.load(Ordering::Relaxed) {
            thread::sleep(poll);
            if let Some(component) = health.stale_component(current_millis()) {
                error!(
                    "Watchdog detected stalled {} stage; requesting pipeline restart",
                    component.label()
                );
                metrics::counter!("parking_watchdog_trips_total", "stage" => component.label())
                    .increment(1);
                state.arm(component);
                running.store(false, Ordering::SeqCst);
                break;
            }
        }
    })
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
