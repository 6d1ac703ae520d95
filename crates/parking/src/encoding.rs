//! JPEG encoding of annotated frames into a small pull-based history.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    time::Instant,
};

use anyhow::{Result, anyhow};
use image::{RgbImage, codecs::jpeg::JpegEncoder, imageops::FilterType};

pub const DEFAULT_JPEG_QUALITY: u8 = 85;
pub const DEFAULT_SCALE: f32 = 0.7;
pub const DEFAULT_HISTORY: usize = 3;

/// Encoded frame ready to be served to stream consumers.
#[derive(Clone, Debug)]
pub struct EncodedFrame {
    pub jpeg: Arc<[u8]>,
    pub timestamp_ms: i64,
    pub frame_number: u64,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct EncoderSettings {
    /// JPEG quality, 1-100.
    pub quality: u8,
    /// Downscale factor in `(0, 1]`.
    pub scale: f32,
    pub history: usize,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            quality: DEFAULT_JPEG_QUALITY,
            scale: DEFAULT_SCALE,
            history: DEFAULT_HISTORY,
        }
    }
}

/// Single writer, many readers. Reads clone an `Arc` under a short lock.
pub struct FrameEncoder {
    settings: EncoderSettings,
    history: Mutex<VecDeque<EncodedFrame>>,
}

impl FrameEncoder {
    pub fn new(settings: EncoderSettings) -> Self {
        let settings = EncoderSettings {
            quality: settings.quality.clamp(1, 100),
            scale: if settings.scale > 0.0 && settings.scale <= 1.0 {
                settings.scale
            } else {
                DEFAULT_SCALE
            },
            history: settings.history.max(1),
        };
        Self {
            settings,
            history: Mutex::new(VecDeque::with_capacity(settings.history)),
        }
    }

    pub fn settings(&self) -> EncoderSettings {
        self.settings
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<EncodedFrame>> {
        match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Downscale, compress and append to the history, evicting the oldest entry
    /// when full.
    pub fn encode(
        &self,
        frame: &RgbImage,
        timestamp_ms: i64,
        frame_number: u64,
    ) -> Result<EncodedFrame> {
        let start = Instant::now();
        let (width, height) = frame.dimensions();
        let target_w = scaled_edge(width, self.settings.scale);
        let target_h = scaled_edge(height, self.settings.scale);
        let scaled;
        let image = if (target_w, target_h) == (width, height) {
            frame
        } else {
            scaled = image::imageops::resize(frame, target_w, target_h, FilterType::Triangle);
            &scaled
        };

        let mut buffer = Vec::new();
        JpegEncoder::new_with_quality(&mut buffer, self.settings.quality)
            .encode_image(image)
            .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;

        let encoded = EncodedFrame {
            jpeg: buffer.into(),
            timestamp_ms,
            frame_number,
            width: target_w,
            height: target_h,
        };
        {
            let mut history = self.lock();
            history.push_back(encoded.clone());
            while history.len() > self.settings.history {
                history.pop_front();
            }
        }
        metrics::histogram!("parking_stage_latency_seconds", "stage" => "encoding")
            .record(start.elapsed().as_secs_f64());
        Ok(encoded)
    }

    /// Most recent frame; never blocks on encoding.
    pub fn latest(&self) -> Option<EncodedFrame> {
        self.lock().back().cloned()
    }

    /// JPEG bytes of the most recent frame.
    pub fn latest_frame(&self) -> Option<Arc<[u8]>> {
        self.latest().map(|frame| frame.jpeg)
    }

    /// Buffered frames, oldest first.
    pub fn history(&self) -> Vec<EncodedFrame> {
        self.lock().iter().cloned().collect()
    }

    pub fn get(&self, frame_number: u64) -> Option<EncodedFrame> {
        self.lock()
            .iter()
            .find(|frame| frame.frame_number == frame_number)
            .cloned()
    }
}

fn scaled_edge(edge: u32, scale: f32) -> u32 {
    // Truncate like integer percentage scaling, tolerating f32 rounding.
    ((edge as f64 * scale as f64 + 1e-3) as u32).max(1)
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new(EncoderSettings::default())
    }
}
