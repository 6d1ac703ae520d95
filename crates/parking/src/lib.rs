//! Parking occupancy monitor.
//!
//! Frames from a [`video_ingest::FrameSource`] go through detection, spot
//! mapping and plate recognition into a shared [`OccupancyStore`]; annotated
//! frames are kept as JPEGs in a [`FrameEncoder`] for pull-based streaming.

pub mod annotation;
pub mod detection;
pub mod encoding;
pub mod error;
pub mod occupancy;
pub mod pipeline;
pub mod plates;
pub mod spots;

pub use detection::DetectionEngine;
pub use encoding::{EncodedFrame, EncoderSettings, FrameEncoder};
pub use error::PipelineError;
pub use occupancy::{
    OccupancySnapshot, OccupancyStore, Spot, SpotStatus, SpotUpdate, UpdateBatch, UpdateSummary,
};
pub use pipeline::{
    FrameProcessor, FrameReport, HealthComponent, ParkingCliArgs, ParkingConfig,
    PipelineComponents, PipelineDriver, PipelineHandle, PipelineOutcome, PipelineState,
};
pub use plates::{PlateConfig, PlateRecognizer, PlateStrategy};
pub use spots::{SpotId, SpotMapper};
