use std::time::Duration;

use thiserror::Error;
use video_ingest::CaptureError;

/// Failures surfaced by the occupancy pipeline.
///
/// Only `SourceUnavailable` and `Initialization` end a run; the per-frame
/// kinds are logged and the frame's update is skipped.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("video source unavailable")]
    SourceUnavailable(#[source] CaptureError),
    #[error("no frame received within {0:?}")]
    FrameTimeout(Duration),
    #[error("detection failed")]
    DetectionFailure(#[source] anyhow::Error),
    #[error("plate recognition failed")]
    RecognitionFailure(#[source] anyhow::Error),
    #[error("frame encoding failed")]
    Encoding(#[source] anyhow::Error),
    #[error("pipeline initialisation failed")]
    Initialization(#[source] anyhow::Error),
}

impl PipelineError {
    /// Label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::SourceUnavailable(_) => "source_unavailable",
            PipelineError::FrameTimeout(_) => "frame_timeout",
            PipelineError::DetectionFailure(_) => "detection",
            PipelineError::RecognitionFailure(_) => "recognition",
            PipelineError::Encoding(_) => "encoding",
            PipelineError::Initialization(_) => "initialization",
        }
    }
}
