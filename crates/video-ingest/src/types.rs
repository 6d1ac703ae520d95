use std::time::Duration;

use anyhow::{Error, anyhow};
use thiserror::Error;

/// Raw frame captured from a video source.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

impl Frame {
    /// Wrap a tightly packed BGR8 buffer, checking it matches the dimensions.
    pub fn from_bgr(
        data: Vec<u8>,
        width: u32,
        height: u32,
        timestamp_ms: i64,
    ) -> Result<Self, CaptureError> {
        let expected = (width as usize) * (height as usize) * 3;
        if data.len() != expected {
            return Err(CaptureError::Other(anyhow!(
                "unexpected frame buffer size: got {} bytes, expected {expected}",
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp_ms,
            format: FrameFormat::Bgr8,
        })
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("no frame received within {0:?}")]
    Timeout(Duration),
    #[error("video source reached end of stream")]
    EndOfStream,
    #[error(transparent)]
    Other(#[from] Error),
}
