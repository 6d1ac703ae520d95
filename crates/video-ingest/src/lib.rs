//! Frame acquisition for the parking monitor.
//!
//! A [`FrameSource`] owns one capture backend and runs it on a dedicated
//! thread, handing frames to the consumer through a small drop-oldest queue so
//! a slow consumer always sees the freshest frame and the producer never
//! blocks.

#[cfg(feature = "opencv")]
mod camera;
mod capture;
mod ffmpeg;
mod queue;
mod source;
mod types;

#[cfg(feature = "opencv")]
pub use camera::OpenCvCapture;
pub use capture::{CaptureBackend, CaptureInterrupt};
pub use ffmpeg::FfmpegCapture;
pub use queue::DropOldestQueue;
pub use source::{FrameSource, SourceKind, SourceOptions, join_bounded};
pub use types::{CaptureError, Frame, FrameFormat};
