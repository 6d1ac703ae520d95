//! Configuration parsing for the occupancy pipeline.
//!
//! CLI arguments are validated once into a `ParkingConfig` which the driver
//! and its stages use without re-reading flags or process state.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Result, anyhow, bail};
use clap::Args;
use ml_core::{DetectorConfig, DevicePreference};
use video_ingest::{SourceKind, SourceOptions};

use crate::{
    encoding::EncoderSettings,
    plates::{PlateConfig, PlateStrategy},
};

#[derive(Clone, Debug)]
/// Canonical configuration shared by every stage in the pipeline.
pub struct ParkingConfig {
    /// Capture source and acquisition queue settings.
    pub source: SourceOptions,
    /// Transport inferred from the source URI.
    pub source_kind: SourceKind,
    pub detector: DetectorConfig,
    /// Detections below this confidence are discarded before spot mapping.
    pub min_detection_confidence: f32,
    /// Plate recognition settings; `None` updates spots with status only.
    pub recognition: Option<RecognitionConfig>,
    pub grid_rows: u32,
    pub grid_columns: u32,
    /// Process every Nth captured frame.
    pub frame_skip: u32,
    pub target_fps: f32,
    /// Resize captured frames to this size before detection.
    pub process_size: Option<(u32, u32)>,
    pub encoder: EncoderSettings,
    /// Heartbeat age that counts as a stalled stage; `None` disables the watchdog.
    pub stall_timeout: Option<Duration>,
    /// Consecutive restarts allowed before the supervisor gives up.
    pub max_restarts: u32,
    /// Emit per-frame detail at info level.
    pub verbose: bool,
    pub telemetry: TelemetryOptions,
}

#[derive(Clone, Debug)]
pub struct RecognitionConfig {
    /// Tesseract language codes, joined with `+`.
    pub languages: Vec<String>,
    pub page_seg_mode: u8,
    /// Upper bound for a single recognizer invocation.
    pub timeout: Duration,
    pub plates: PlateConfig,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            languages: vec!["eng".to_string()],
            page_seg_mode: 11,
            timeout: Duration::from_secs(5),
            plates: PlateConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing and metrics export.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Serve Prometheus metrics on this address.
    pub metrics_addr: Option<SocketAddr>,
}

impl ParkingConfig {
    /// Defaults matching the reference deployment: 2 x 6 spots, every second
    /// frame, 30 fps pacing.
    pub fn new(source: impl Into<String>, model_path: impl Into<PathBuf>) -> Self {
        let source = SourceOptions::new(source);
        Self {
            source_kind: SourceKind::from_uri(&source.uri),
            source,
            detector: DetectorConfig::new(model_path),
            min_detection_confidence: crate::detection::DEFAULT_MIN_CONFIDENCE,
            recognition: Some(RecognitionConfig::default()),
            grid_rows: 2,
            grid_columns: 6,
            frame_skip: 2,
            target_fps: 30.0,
            process_size: None,
            encoder: EncoderSettings::default(),
            stall_timeout: Some(Duration::from_secs(10)),
            max_restarts: 5,
            verbose: false,
            telemetry: TelemetryOptions::default(),
        }
    }

    pub fn spot_count(&self) -> u32 {
        self.grid_rows * self.grid_columns
    }
}

/// CLI arguments accepted by the `run` subcommand.
#[derive(Debug, Args)]
pub struct ParkingCliArgs {
    /// Camera URI, device index or video file.
    #[arg(value_name = "SOURCE")]
    pub source: Option<String>,
    /// TorchScript model path.
    #[arg(value_name = "MODEL_PATH")]
    pub model_path: Option<PathBuf>,

    /// Source flag (overrides positional).
    #[arg(long = "source", value_name = "URI")]
    pub source_flag: Option<String>,
    /// Model path flag (overrides positional).
    #[arg(long = "model", value_name = "PATH")]
    pub model_flag: Option<PathBuf>,
    /// Capture width in pixels.
    #[arg(long = "width", value_name = "PX")]
    pub width: Option<u32>,
    /// Capture height in pixels.
    #[arg(long = "height", value_name = "PX")]
    pub height: Option<u32>,
    /// Resize frames to WIDTHxHEIGHT before detection.
    #[arg(long = "process-size", value_name = "WxH")]
    pub process_size: Option<String>,
    /// Frames buffered between capture and processing (1 or 2).
    #[arg(long = "queue-capacity", value_name = "N")]
    pub queue_capacity: Option<usize>,
    /// Maximum wait for a frame before backing off.
    #[arg(long = "read-timeout-ms", value_name = "MS")]
    pub read_timeout_ms: Option<u64>,

    /// Force CPU inference.
    #[arg(long = "cpu", action = clap::ArgAction::SetTrue)]
    pub use_cpu: bool,
    /// Square detector input size in pixels.
    #[arg(long = "detector-size", value_name = "PX")]
    pub detector_size: Option<u32>,
    /// Detector confidence threshold applied before NMS.
    #[arg(long = "model-confidence", value_name = "0-1")]
    pub model_confidence: Option<f32>,
    /// IoU threshold for non-maximum suppression.
    #[arg(long = "iou", value_name = "0-1")]
    pub iou: Option<f32>,
    /// Maximum detections kept per frame.
    #[arg(long = "max-detections", value_name = "N")]
    pub max_detections: Option<usize>,
    /// Detections below this confidence are ignored.
    #[arg(long = "min-confidence", value_name = "0-1")]
    pub min_confidence: Option<f32>,

    /// Disable plate recognition.
    #[arg(long = "no-plates", action = clap::ArgAction::SetTrue)]
    pub no_plates: bool,
    /// Plate assignment strategy.
    #[arg(long = "plate-strategy", value_enum)]
    pub plate_strategy: Option<PlateStrategy>,
    /// Recognition languages, comma separated.
    #[arg(long = "ocr-languages", value_name = "LANGS", value_delimiter = ',')]
    pub ocr_languages: Vec<String>,
    /// Minimum recognizer confidence for plate candidates.
    #[arg(long = "min-plate-confidence", value_name = "0-1")]
    pub min_plate_confidence: Option<f32>,
    /// Tesseract page segmentation mode.
    #[arg(long = "ocr-psm", value_name = "MODE")]
    pub ocr_psm: Option<u8>,
    /// Recognizer timeout per invocation.
    #[arg(long = "ocr-timeout-ms", value_name = "MS")]
    pub ocr_timeout_ms: Option<u64>,

    /// Spot grid rows.
    #[arg(long = "rows", value_name = "N")]
    pub rows: Option<u32>,
    /// Spot grid columns.
    #[arg(long = "columns", value_name = "N")]
    pub columns: Option<u32>,
    /// Process every Nth frame.
    #[arg(long = "frame-skip", value_name = "N")]
    pub frame_skip: Option<u32>,
    /// Target processing rate.
    #[arg(long = "fps", value_name = "FPS")]
    pub target_fps: Option<f32>,

    /// JPEG quality used by the preview encoder (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY")]
    pub jpeg_quality: Option<u8>,
    /// Preview downscale factor in (0, 1].
    #[arg(long = "jpeg-scale", value_name = "SCALE")]
    pub jpeg_scale: Option<f32>,

    /// Seconds without a heartbeat before a stage counts as stalled; 0 disables.
    #[arg(long = "stall-timeout", value_name = "SECS")]
    pub stall_timeout_secs: Option<u64>,
    /// Consecutive pipeline restarts before giving up.
    #[arg(long = "max-restarts", value_name = "N")]
    pub max_restarts: Option<u32>,
    /// Enable verbose logging (per-frame detections).
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
    /// Serve Prometheus metrics on this address.
    #[arg(long = "metrics-addr", value_name = "ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

impl TryFrom<ParkingCliArgs> for ParkingConfig {
    type Error = anyhow::Error;

    fn try_from(args: ParkingCliArgs) -> Result<Self> {
        let source = args.source_flag.or(args.source).ok_or_else(|| {
            anyhow!("Missing source. Provide --source <uri> or positional <source>.")
        })?;
        let model_path = args.model_flag.or(args.model_path).ok_or_else(|| {
            anyhow!("Missing model path. Provide --model <path> or positional <model-path>.")
        })?;
        let mut config = ParkingConfig::new(source, model_path);

        let width = args.width.unwrap_or(config.source.frame_size.0);
        let height = args.height.unwrap_or(config.source.frame_size.1);
        if width == 0 || height == 0 {
            bail!("Capture width and height must be positive integers");
        }
        config.source.frame_size = (width, height);

        if let Some(size) = args.process_size.as_deref() {
            config.process_size = Some(parse_size(size)?);
        }

        let queue_capacity = args.queue_capacity.unwrap_or(config.source.queue_capacity);
        if !(1..=2).contains(&queue_capacity) {
            bail!("--queue-capacity must be 1 or 2");
        }
        config.source.queue_capacity = queue_capacity;

        if let Some(ms) = args.read_timeout_ms {
            if ms == 0 {
                bail!("--read-timeout-ms must be at least 1");
            }
            config.source.read_timeout = Duration::from_millis(ms);
        }

        if args.use_cpu {
            config.detector.device = DevicePreference::Cpu;
        }
        if let Some(size) = args.detector_size {
            if size == 0 || size % 32 != 0 {
                bail!("--detector-size must be a positive multiple of 32");
            }
            config.detector.input_size = size;
        }
        config.detector.confidence =
            unit_interval("--model-confidence", args.model_confidence, config.detector.confidence)?;
        config.detector.iou_threshold =
            unit_interval("--iou", args.iou, config.detector.iou_threshold)?;
        if let Some(max) = args.max_detections {
            if max == 0 {
                bail!("--max-detections must be at least 1");
            }
            config.detector.max_detections = max;
        }
        config.min_detection_confidence = unit_interval(
            "--min-confidence",
            args.min_confidence,
            config.min_detection_confidence,
        )?;

        config.recognition = if args.no_plates {
            None
        } else {
            let mut recognition = RecognitionConfig::default();
            let languages: Vec<String> = args
                .ocr_languages
                .iter()
                .map(|lang| lang.trim().to_string())
                .filter(|lang| !lang.is_empty())
                .collect();
            if !languages.is_empty() {
                recognition.languages = languages;
            }
            if let Some(psm) = args.ocr_psm {
                if psm > 13 {
                    bail!("--ocr-psm must be between 0 and 13");
                }
                recognition.page_seg_mode = psm;
            }
            if let Some(ms) = args.ocr_timeout_ms {
                if ms == 0 {
                    bail!("--ocr-timeout-ms must be at least 1");
                }
                recognition.timeout = Duration::from_millis(ms);
            }
            recognition.plates.min_confidence = unit_interval(
                "--min-plate-confidence",
                args.min_plate_confidence,
                recognition.plates.min_confidence,
            )?;
            if let Some(strategy) = args.plate_strategy {
                recognition.plates.strategy = strategy;
            }
            Some(recognition)
        };

        config.grid_rows = args.rows.unwrap_or(config.grid_rows);
        config.grid_columns = args.columns.unwrap_or(config.grid_columns);
        if config.grid_rows == 0 || config.grid_columns == 0 {
            bail!("--rows and --columns must be at least 1");
        }

        config.frame_skip = args.frame_skip.unwrap_or(config.frame_skip);
        if config.frame_skip == 0 {
            bail!("--frame-skip must be at least 1");
        }
        config.target_fps = args.target_fps.unwrap_or(config.target_fps);
        if !(config.target_fps.is_finite() && config.target_fps > 0.0) {
            bail!("--fps must be a positive number");
        }

        config.encoder.quality = args.jpeg_quality.unwrap_or(config.encoder.quality);
        if !(1..=100).contains(&config.encoder.quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }
        config.encoder.scale = args.jpeg_scale.unwrap_or(config.encoder.scale);
        if !(config.encoder.scale > 0.0 && config.encoder.scale <= 1.0) {
            bail!("--jpeg-scale must be in (0, 1]");
        }

        if let Some(secs) = args.stall_timeout_secs {
            config.stall_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        config.max_restarts = args.max_restarts.unwrap_or(config.max_restarts);
        config.verbose = args.verbose;
        config.telemetry = TelemetryOptions {
            chrome_trace_path: args.chrome_trace,
            metrics_addr: args.metrics_addr,
        };

        Ok(config)
    }
}

fn unit_interval(flag: &str, value: Option<f32>, default: f32) -> Result<f32> {
    let value = value.unwrap_or(default);
    if !(0.0..=1.0).contains(&value) {
        bail!("{flag} must be between 0 and 1");
    }
    Ok(value)
}

fn parse_size(value: &str) -> Result<(u32, u32)> {
    let (w, h) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| anyhow!("--process-size must look like 320x240"))?;
    let w: u32 = w.trim().parse().map_err(|_| anyhow!("invalid width in {value:?}"))?;
    let h: u32 = h.trim().parse().map_err(|_| anyhow!("invalid height in {value:?}"))?;
    if w == 0 || h == 0 {
        bail!("--process-size dimensions must be positive");
    }
    Ok((w, h))
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: ParkingCliArgs,
    }

    fn parse(argv: &[&str]) -> Result<ParkingConfig> {
        let cli = TestCli::try_parse_from(std::iter::once("test").chain(argv.iter().copied()))?;
        ParkingConfig::try_from(cli.args)
    }

    #[test]
    fn defaults_match_reference_deployment() {
        let config = parse(&["http://10.0.0.2:4747/video", "best.torchscript"]).unwrap();
        assert_eq!(config.source_kind, SourceKind::Http);
        assert_eq!(config.spot_count(), 12);
        assert_eq!(config.frame_skip, 2);
        assert_eq!(config.target_fps, 30.0);
        assert_eq!(config.source.queue_capacity, 2);
        assert_eq!(config.encoder.quality, 85);
        assert!((config.min_detection_confidence - 0.3).abs() < 1e-6);
        let recognition = config.recognition.unwrap();
        assert_eq!(recognition.languages, vec!["eng"]);
        assert!((recognition.plates.min_confidence - 0.6).abs() < 1e-6);
        assert_eq!(recognition.plates.strategy, PlateStrategy::WholeFrame);
        assert_eq!(config.stall_timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn flags_override_positionals() {
        let config = parse(&[
            "0",
            "a.pt",
            "--source",
            "rtsp://cam/1",
            "--model",
            "b.pt",
            "--ocr-languages",
            "eng,deu",
            "--plate-strategy",
            "scoped",
            "--process-size",
            "320x240",
            "--stall-timeout",
            "0",
            "--cpu",
        ])
        .unwrap();
        assert_eq!(config.source.uri, "rtsp://cam/1");
        assert_eq!(config.source_kind, SourceKind::Rtsp);
        assert_eq!(config.detector.model_path, PathBuf::from("b.pt"));
        assert_eq!(config.detector.device, DevicePreference::Cpu);
        assert_eq!(config.process_size, Some((320, 240)));
        assert_eq!(config.stall_timeout, None);
        let recognition = config.recognition.unwrap();
        assert_eq!(recognition.languages, vec!["eng", "deu"]);
        assert_eq!(recognition.plates.strategy, PlateStrategy::Scoped);
    }

    #[test]
    fn no_plates_disables_recognition() {
        let config = parse(&["lot.mp4", "m.pt", "--no-plates"]).unwrap();
        assert!(config.recognition.is_none());
    }

    #[test]
    fn rejects_out_of_range_values() {
        for argv in [
            vec!["0", "m.pt", "--min-confidence", "1.5"],
            vec!["0", "m.pt", "--jpeg-quality", "0"],
            vec!["0", "m.pt", "--jpeg-scale", "1.2"],
            vec!["0", "m.pt", "--frame-skip", "0"],
            vec!["0", "m.pt", "--fps", "0"],
            vec!["0", "m.pt", "--queue-capacity", "3"],
            vec!["0", "m.pt", "--rows", "0"],
            vec!["0", "m.pt", "--detector-size", "100"],
            vec!["0", "m.pt", "--process-size", "320"],
        ] {
            assert!(parse(&argv).is_err(), "accepted {argv:?}");
        }
    }

    #[test]
    fn missing_source_or_model_is_an_error() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["0"]).is_err());
    }
}
