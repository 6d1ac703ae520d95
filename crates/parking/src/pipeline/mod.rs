//! Occupancy pipeline: capture, detection, plate assignment, store update and
//! preview encoding.
//!
//! A [`PipelineDriver`] opens the source and builds the detection backends
//! synchronously, then runs the frame loop on its own thread. The returned
//! [`PipelineHandle`] reports state, stops the loop with a bounded join, and
//! exposes the shared store and encoder to readers.

pub mod config;
pub mod telemetry;
pub mod watchdog;

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::Result;
use image::{RgbImage, imageops::FilterType};
use ml_core::{Detection, DetectionClass, TesseractCli};
use tracing::{debug, error, info, warn};
use video_ingest::{CaptureError, Frame, FrameSource, join_bounded};

pub use config::{ParkingCliArgs, ParkingConfig, RecognitionConfig, TelemetryOptions};
pub use watchdog::HealthComponent;

use crate::{
    annotation::{SpotOverlay, annotate},
    detection::{DetectionEngine, frame_to_rgb},
    encoding::{EncodedFrame, FrameEncoder},
    error::PipelineError,
    occupancy::{OccupancySnapshot, OccupancyStore, SpotUpdate, UpdateBatch, UpdateSummary},
    plates::PlateRecognizer,
    spots::SpotMapper,
};
use self::watchdog::{PipelineHealth, WatchdogState, spawn_watchdog};

/// Pause after a read timeout before polling the source again.
const READ_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Why a pipeline run ended.
pub enum PipelineOutcome {
    /// Stop was requested through the handle or the shutdown flag.
    Graceful,
    /// The acquisition thread ended (end of file, device error).
    SourceLost,
    /// The watchdog saw a stage stop beating, or the loop did not exit in time.
    Stalled(HealthComponent),
    /// The pipeline thread panicked.
    Crashed,
}

impl PipelineOutcome {
    /// Whether a supervisor should try another run.
    pub fn is_restartable(self) -> bool {
        !matches!(self, PipelineOutcome::Graceful)
    }
}

/// Detection and recognition backends used by one pipeline run.
pub struct PipelineComponents {
    pub detection: DetectionEngine,
    /// `None` disables plate recognition.
    pub plates: Option<PlateRecognizer>,
}

/// Build the backends selected by `config`.
///
/// Detection needs the `with-tch` feature; without it this returns an error
/// and callers have to inject their own detector.
pub fn default_components(config: &ParkingConfig) -> Result<PipelineComponents> {
    let detection = DetectionEngine::new(default_detector(config)?)
        .with_min_confidence(config.min_detection_confidence);
    let plates = config.recognition.as_ref().map(|recognition| {
        let backend = TesseractCli::new(&recognition.languages[..])
            .with_page_seg_mode(recognition.page_seg_mode)
            .with_timeout(recognition.timeout);
        PlateRecognizer::new(Box::new(backend), recognition.plates.clone())
    });
    Ok(PipelineComponents { detection, plates })
}

#[cfg(feature = "with-tch")]
fn default_detector(config: &ParkingConfig) -> Result<Box<dyn ml_core::Detector>> {
    use anyhow::Context;

    if config.detector.device != ml_core::DevicePreference::Cpu {
        ml_core::load_torch_cuda_runtime(config.verbose);
    }
    let detector = ml_core::TorchDetector::new(config.detector.clone()).with_context(|| {
        format!(
            "failed to load detector from {}",
            config.detector.model_path.display()
        )
    })?;
    info!("Detector loaded on {:?}", detector.device());
    Ok(Box::new(detector))
}

#[cfg(not(feature = "with-tch"))]
fn default_detector(config: &ParkingConfig) -> Result<Box<dyn ml_core::Detector>> {
    anyhow::bail!(
        "cannot load {}: built without the `with-tch` feature",
        config.detector.model_path.display()
    )
}

/// Result of processing one frame.
#[derive(Clone, Debug)]
pub struct FrameReport {
    pub frame_number: u64,
    /// Detections that survived the confidence floor.
    pub detections: usize,
    pub summary: UpdateSummary,
    pub encoded: EncodedFrame,
}

/// Per-frame analysis, before anything is written to the store.
struct Analysis {
    batch: UpdateBatch,
    overlays: Vec<SpotOverlay>,
    detections: usize,
}

/// One pipeline iteration on a given frame, without threads.
pub struct FrameProcessor {
    components: PipelineComponents,
    mapper: SpotMapper,
    store: Arc<OccupancyStore>,
    encoder: Arc<FrameEncoder>,
    process_size: Option<(u32, u32)>,
    verbose: bool,
}

impl FrameProcessor {
    pub fn new(
        components: PipelineComponents,
        mapper: SpotMapper,
        store: Arc<OccupancyStore>,
        encoder: Arc<FrameEncoder>,
    ) -> Self {
        Self {
            components,
            mapper,
            store,
            encoder,
            process_size: None,
            verbose: false,
        }
    }

    /// Resize frames to `size` before detection.
    pub fn with_process_size(mut self, size: Option<(u32, u32)>) -> Self {
        self.process_size = size;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn store(&self) -> &Arc<OccupancyStore> {
        &self.store
    }

    pub fn encoder(&self) -> &Arc<FrameEncoder> {
        &self.encoder
    }

    /// Detect, map, recognise, update the store, then annotate and encode.
    ///
    /// When detection or recognition fails the store is left untouched, but
    /// the plain frame is still encoded so the preview keeps moving.
    pub fn process_frame(
        &self,
        frame: &Frame,
        frame_number: u64,
    ) -> Result<FrameReport, PipelineError> {
        let span = tracing::info_span!(
            "frame",
            frame = frame_number,
            width = frame.width,
            height = frame.height,
            timestamp = frame.timestamp_ms
        );
        let _guard = span.enter();
        let start = Instant::now();

        let mut image = frame_to_rgb(frame).map_err(PipelineError::DetectionFailure)?;
        if let Some((width, height)) = self.process_size {
            if image.dimensions() != (width, height) {
                image = image::imageops::resize(&image, width, height, FilterType::Triangle);
            }
        }

        let analysis = match self.analyse(&image) {
            Ok(analysis) => analysis,
            Err(err) => {
                metrics::counter!("parking_frames_failed_total", "kind" => err.kind())
                    .increment(1);
                if let Err(encode_err) = self.encode(&image, frame.timestamp_ms, frame_number) {
                    warn!("Failed to encode unannotated frame #{frame_number}: {encode_err:#}");
                }
                return Err(err);
            }
        };

        let summary = self.store.update(&analysis.batch);
        let footer = format!(
            "FRAME {frame_number:06}  OCCUPIED {}/{}",
            summary.occupied,
            self.mapper.spot_count()
        );
        annotate(&mut image, &analysis.overlays, &footer);
        if self.verbose {
            info!(
                "Frame #{frame_number}: {} detections, {} occupied, {} available",
                analysis.detections, summary.occupied, summary.available
            );
        } else {
            debug!(
                "Frame #{frame_number}: {} detections, {} occupied, {} available",
                analysis.detections, summary.occupied, summary.available
            );
        }

        let encoded = self
            .encode(&image, frame.timestamp_ms, frame_number)
            .inspect_err(|err| {
                metrics::counter!("parking_frames_failed_total", "kind" => err.kind())
                    .increment(1);
            })?;
        metrics::counter!("parking_frames_processed_total").increment(1);
        metrics::histogram!("parking_stage_latency_seconds", "stage" => "frame")
            .record(start.elapsed().as_secs_f64());

        Ok(FrameReport {
            frame_number,
            detections: analysis.detections,
            summary,
            encoded,
        })
    }

    fn analyse(&self, image: &RgbImage) -> Result<Analysis, PipelineError> {
        let detect_start = Instant::now();
        let detections = tracing::info_span!("detect")
            .in_scope(|| self.components.detection.detect_image(image))
            .map_err(PipelineError::DetectionFailure)?;
        metrics::histogram!("parking_stage_latency_seconds", "stage" => "detect")
            .record(detect_start.elapsed().as_secs_f64());

        let (width, height) = image.dimensions();
        let mut batch: UpdateBatch = (1..=self.mapper.spot_count())
            .map(|id| (id, SpotUpdate::empty()))
            .collect();
        let mut overlays = Vec::with_capacity(detections.len());
        let mut plates = self
            .components
            .plates
            .as_ref()
            .map(|recognizer| recognizer.for_frame(image));
        let plates_span = tracing::info_span!("plates");
        let mut plate_time = Duration::ZERO;

        for Detection { bbox, class, .. } in &detections {
            let Some(spot) = self.mapper.map(bbox, width, height) else {
                debug!("Detection {bbox:?} falls outside the spot grid");
                continue;
            };
            let update = match class {
                DetectionClass::Occupied => {
                    let plate = match plates.as_mut() {
                        Some(plates) => {
                            let plate_start = Instant::now();
                            let plate = plates_span
                                .in_scope(|| plates.next_plate(bbox))
                                .map_err(PipelineError::RecognitionFailure)?;
                            plate_time += plate_start.elapsed();
                            plate
                        }
                        None => None,
                    };
                    SpotUpdate::occupied(plate)
                }
                DetectionClass::Empty => SpotUpdate::empty(),
            };
            overlays.push(SpotOverlay {
                bbox: *bbox,
                spot,
                status: update.status,
                plate: update.plate.clone(),
            });
            batch.insert(spot, update);
        }
        if plates.is_some() {
            metrics::histogram!("parking_stage_latency_seconds", "stage" => "plates")
                .record(plate_time.as_secs_f64());
        }

        Ok(Analysis {
            batch,
            overlays,
            detections: detections.len(),
        })
    }

    fn encode(
        &self,
        image: &RgbImage,
        timestamp_ms: i64,
        frame_number: u64,
    ) -> Result<EncodedFrame, PipelineError> {
        tracing::info_span!("encode")
            .in_scope(|| self.encoder.encode(image, timestamp_ms, frame_number))
            .map_err(PipelineError::Encoding)
    }
}

/// Builds and launches pipeline runs sharing one store and one encoder.
pub struct PipelineDriver {
    config: ParkingConfig,
    store: Arc<OccupancyStore>,
    encoder: Arc<FrameEncoder>,
    shutdown: Arc<AtomicBool>,
}

impl PipelineDriver {
    pub fn new(config: ParkingConfig, store: Arc<OccupancyStore>) -> Self {
        let encoder = Arc::new(FrameEncoder::new(config.encoder));
        Self {
            config,
            store,
            encoder,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Process-wide stop flag, e.g. set from a Ctrl+C handler.
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn config(&self) -> &ParkingConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<OccupancyStore> {
        &self.store
    }

    pub fn encoder(&self) -> &Arc<FrameEncoder> {
        &self.encoder
    }

    /// Start a run with the default source and backends.
    pub fn start(&self) -> Result<PipelineHandle, PipelineError> {
        self.spawn(|config| FrameSource::open(&config.source), default_components)
    }

    /// Start a run with injected source and backend factories.
    ///
    /// Backends are built before the source is opened. Either failing leaves
    /// the store and encoder as they were.
    pub fn spawn<S, C>(
        &self,
        open_source: S,
        build_components: C,
    ) -> Result<PipelineHandle, PipelineError>
    where
        S: FnOnce(&ParkingConfig) -> Result<FrameSource, CaptureError>,
        C: FnOnce(&ParkingConfig) -> Result<PipelineComponents>,
    {
        let state = Arc::new(Mutex::new(PipelineState::Starting));
        let config = &self.config;
        let _span = tracing::info_span!(
            "parking.start",
            source = %config.source.uri,
            kind = ?config.source_kind,
            spots = config.spot_count()
        )
        .entered();

        let components = build_components(config).map_err(PipelineError::Initialization)?;
        let source = open_source(config).map_err(PipelineError::SourceUnavailable)?;

        let processor = FrameProcessor::new(
            components,
            SpotMapper::new(config.grid_rows, config.grid_columns),
            self.store.clone(),
            self.encoder.clone(),
        )
        .with_process_size(config.process_size)
        .with_verbose(config.verbose);

        let running = Arc::new(AtomicBool::new(true));
        let watchdog_state = Arc::new(WatchdogState::new());
        let health = Arc::new(PipelineHealth::new(
            config.stall_timeout.unwrap_or_default(),
        ));
        let watchdog = match config.stall_timeout {
            Some(_) => Some(
                spawn_watchdog(
                    health.clone(),
                    running.clone(),
                    self.shutdown.clone(),
                    watchdog_state.clone(),
                )
                .map_err(|err| PipelineError::Initialization(err.into()))?,
            ),
            None => None,
        };

        let run = RunLoop {
            processor,
            source,
            frame_skip: u64::from(config.frame_skip.max(1)),
            frame_interval: Duration::try_from_secs_f32(1.0 / config.target_fps)
                .unwrap_or_default(),
            health,
            running: running.clone(),
            shutdown: self.shutdown.clone(),
            watchdog_state: watchdog_state.clone(),
            watchdog,
            join_timeout: config.source.join_timeout,
            state: state.clone(),
        };
        let worker = match telemetry::spawn_thread("parking-pipeline", move || run.run()) {
            Ok(worker) => worker,
            Err(err) => {
                running.store(false, Ordering::SeqCst);
                return Err(PipelineError::Initialization(err.into()));
            }
        };
        info!(
            "Pipeline started on {} ({} spots, every {} frame(s))",
            config.source.uri,
            config.spot_count(),
            config.frame_skip
        );

        Ok(PipelineHandle {
            state,
            running,
            watchdog: watchdog_state,
            worker: Mutex::new(Some(worker)),
            outcome: Mutex::new(None),
            store: self.store.clone(),
            encoder: self.encoder.clone(),
            stop_timeout: stop_timeout(config),
        })
    }
}

/// Longest a stop waits for the loop: one read, one recognizer call, the
/// capture join before and after an interrupt, and the watchdog join.
fn stop_timeout(config: &ParkingConfig) -> Duration {
    let recognition = config
        .recognition
        .as_ref()
        .map(|recognition| recognition.timeout)
        .unwrap_or_default();
    config.source.read_timeout + recognition + config.source.join_timeout * 3
}

/// Map a failed read to the pipeline error it stands for.
fn read_error(err: CaptureError) -> PipelineError {
    match err {
        CaptureError::Timeout(waited) => PipelineError::FrameTimeout(waited),
        other => PipelineError::SourceUnavailable(other),
    }
}

struct RunLoop {
    processor: FrameProcessor,
    source: FrameSource,
    frame_skip: u64,
    frame_interval: Duration,
    health: Arc<PipelineHealth>,
    running: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    watchdog_state: Arc<WatchdogState>,
    watchdog: Option<JoinHandle<()>>,
    join_timeout: Duration,
    state: Arc<Mutex<PipelineState>>,
}

impl RunLoop {
    fn run(mut self) -> PipelineOutcome {
        let _span = tracing::info_span!("parking.pipeline").entered();
        set_state(&self.state, PipelineState::Running);

        let mut outcome = PipelineOutcome::Graceful;
        let mut received: u64 = 0;
        let mut last_tick = Instant::now();
        let mut smoothed_fps: f32 = 0.0;

        while self.running.load(Ordering::Relaxed) && !self.shutdown.load(Ordering::Relaxed) {
            self.health.beat(HealthComponent::Processing);
            let frame = match self.source.try_read().map_err(read_error) {
                Ok(frame) => frame,
                Err(err @ PipelineError::FrameTimeout(_)) => {
                    debug!("{err}; backing off");
                    metrics::counter!("parking_frames_failed_total", "kind" => err.kind())
                        .increment(1);
                    thread::sleep(READ_BACKOFF);
                    continue;
                }
                Err(err) => {
                    metrics::counter!("parking_frames_failed_total", "kind" => err.kind())
                        .increment(1);
                    warn!("{:#}", anyhow::Error::from(err));
                    outcome = PipelineOutcome::SourceLost;
                    break;
                }
            };
            self.health.beat(HealthComponent::Capture);
            received = received.wrapping_add(1);
            if received % self.frame_skip != 0 {
                metrics::counter!("parking_frames_skipped_total").increment(1);
                continue;
            }

            if let Err(err) = self.processor.process_frame(&frame, received) {
                let encoding = matches!(err, PipelineError::Encoding(_));
                let err = anyhow::Error::from(err);
                if encoding {
                    error!("Frame #{received}: {err:#}");
                } else {
                    warn!("Frame #{received} skipped: {err:#}");
                }
            }
            let encoded = self
                .processor
                .encoder()
                .latest()
                .is_some_and(|latest| latest.frame_number == received);
            if encoded {
                self.health.beat(HealthComponent::Encoding);
            }

            let elapsed = last_tick.elapsed();
            if let Some(rest) = self.frame_interval.checked_sub(elapsed) {
                thread::sleep(rest);
            }
            let period = last_tick.elapsed().as_secs_f32();
            last_tick = Instant::now();
            if period > 0.0 {
                let instant = 1.0 / period;
                smoothed_fps = if smoothed_fps == 0.0 {
                    instant
                } else {
                    0.9 * smoothed_fps + 0.1 * instant
                };
                metrics::gauge!("parking_pipeline_fps").set(smoothed_fps as f64);
            }
        }

        set_state(&self.state, PipelineState::Stopping);
        self.running.store(false, Ordering::SeqCst);
        if self.watchdog_state.is_triggered() {
            outcome = PipelineOutcome::Stalled(
                self.watchdog_state
                    .reason()
                    .unwrap_or(HealthComponent::Processing),
            );
        }
        self.source.stop();
        if let Some(handle) = self.watchdog.take() {
            if !join_bounded(handle, self.join_timeout) {
                warn!("Watchdog thread did not exit within {:?}", self.join_timeout);
            }
        }
        drop(self.processor);
        set_state(&self.state, PipelineState::Stopped);
        info!("Pipeline stopped after {received} frames ({outcome:?})");
        outcome
    }
}

fn set_state(state: &Mutex<PipelineState>, next: PipelineState) {
    match state.lock() {
        Ok(mut guard) => *guard = next,
        Err(poisoned) => *poisoned.into_inner() = next,
    }
}

/// Control surface for a running pipeline.
pub struct PipelineHandle {
    state: Arc<Mutex<PipelineState>>,
    running: Arc<AtomicBool>,
    watchdog: Arc<WatchdogState>,
    worker: Mutex<Option<JoinHandle<PipelineOutcome>>>,
    outcome: Mutex<Option<PipelineOutcome>>,
    store: Arc<OccupancyStore>,
    encoder: Arc<FrameEncoder>,
    stop_timeout: Duration,
}

impl PipelineHandle {
    pub fn state(&self) -> PipelineState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Whether the pipeline thread has returned.
    pub fn is_finished(&self) -> bool {
        match self.worker.lock() {
            Ok(guard) => guard.as_ref().is_none_or(JoinHandle::is_finished),
            Err(_) => true,
        }
    }

    /// Stage reported by the watchdog, once it has fired.
    pub fn stalled(&self) -> Option<HealthComponent> {
        if self.watchdog.is_triggered() {
            self.watchdog.reason()
        } else {
            None
        }
    }

    /// Outcome of a finished run; `None` while it is still going.
    pub fn outcome(&self) -> Option<PipelineOutcome> {
        if self.is_finished() {
            self.collect(Duration::ZERO)
        } else {
            None
        }
    }

    /// Ask the loop to stop and wait a bounded time for it.
    ///
    /// Safe to call more than once; later calls return the first outcome. A
    /// loop that does not exit in time is detached and reported as stalled.
    pub fn stop(&self) -> PipelineOutcome {
        self.running.store(false, Ordering::SeqCst);
        self.collect(self.stop_timeout)
            .unwrap_or(PipelineOutcome::Stalled(HealthComponent::Processing))
    }

    fn collect(&self, timeout: Duration) -> Option<PipelineOutcome> {
        let mut outcome = match self.outcome.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if outcome.is_some() {
            return *outcome;
        }
        let worker = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let handle = worker?;
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("Pipeline thread did not stop within {timeout:?}; detaching it");
                let stalled = self.stalled().unwrap_or(HealthComponent::Processing);
                *outcome = Some(PipelineOutcome::Stalled(stalled));
                return *outcome;
            }
            thread::sleep(Duration::from_millis(5));
        }
        *outcome = Some(match handle.join() {
            Ok(result) => result,
            Err(_) => {
                error!("Pipeline thread panicked");
                set_state(&self.state, PipelineState::Stopped);
                PipelineOutcome::Crashed
            }
        });
        *outcome
    }

    pub fn store(&self) -> &Arc<OccupancyStore> {
        &self.store
    }

    pub fn encoder(&self) -> &Arc<FrameEncoder> {
        &self.encoder
    }

    /// Latest preview JPEG, if any frame has been encoded.
    pub fn latest_frame(&self) -> Option<Arc<[u8]>> {
        self.encoder.latest_frame()
    }

    pub fn get_status(&self) -> OccupancySnapshot {
        self.store.get_status()
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_timeouts_become_frame_timeouts() {
        let err = read_error(CaptureError::Timeout(Duration::from_millis(50)));
        assert!(matches!(err, PipelineError::FrameTimeout(waited) if waited.as_millis() == 50));
        assert_eq!(err.kind(), "frame_timeout");

        let err = read_error(CaptureError::EndOfStream);
        assert!(matches!(
            err,
            PipelineError::SourceUnavailable(CaptureError::EndOfStream)
        ));
    }

    #[test]
    fn stop_timeout_covers_interrupted_capture() {
        let mut config = ParkingConfig::new("lot.mp4", "m.pt");
        config.source.read_timeout = Duration::from_millis(100);
        config.source.join_timeout = Duration::from_millis(200);
        config.recognition = None;
        assert_eq!(stop_timeout(&config), Duration::from_millis(700));
    }
}
