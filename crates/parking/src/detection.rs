use anyhow::{Result, anyhow};
use image::RgbImage;
use ml_core::{Detection, Detector};
use tracing::debug;
use video_ingest::Frame;

/// Detections below this confidence never reach spot mapping.
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.3;

/// Frame-level wrapper around a [`Detector`] backend.
pub struct DetectionEngine {
    detector: Box<dyn Detector>,
    min_confidence: f32,
}

impl DetectionEngine {
    pub fn new(detector: Box<dyn Detector>) -> Self {
        Self {
            detector,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn min_confidence(&self) -> f32 {
        self.min_confidence
    }

    /// Detect on a captured frame.
    pub fn detect(&self, frame: &Frame) -> Result<Vec<Detection>> {
        let image = frame_to_rgb(frame)?;
        self.detect_image(&image)
    }

    /// Detect on an already converted RGB image.
    pub fn detect_image(&self, image: &RgbImage) -> Result<Vec<Detection>> {
        let raw = self.detector.detect(image)?;
        let total = raw.len();
        let kept: Vec<Detection> = raw
            .into_iter()
            .filter(|det| det.confidence >= self.min_confidence && det.bbox.is_valid())
            .collect();
        if kept.len() < total {
            debug!(
                "Discarded {} of {total} detections below {:.2} confidence",
                total - kept.len(),
                self.min_confidence
            );
        }
        Ok(kept)
    }
}

/// Convert a packed BGR frame into an RGB image.
pub fn frame_to_rgb(frame: &Frame) -> Result<RgbImage> {
    let mut rgb = Vec::with_capacity(frame.data.len());
    for chunk in frame.data.chunks_exact(3) {
        rgb.extend_from_slice(&[chunk[2], chunk[1], chunk[0]]);
    }
    RgbImage::from_raw(frame.width, frame.height, rgb)
        .ok_or_else(|| anyhow!("failed to convert frame into image buffer"))
}

#[cfg(test)]
mod tests {
    use ml_core::{BoundingBox, DetectionClass};

    use super::*;

    struct Fixed(Vec<Detection>);

    impl Detector for Fixed {
        fn detect(&self, _image: &RgbImage) -> Result<Vec<Detection>> {
            Ok(self.0.clone())
        }
    }

    fn det(confidence: f32) -> Detection {
        Detection::new(
            BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            DetectionClass::Occupied,
            confidence,
        )
    }

    #[test]
    fn drops_low_confidence_and_degenerate_boxes() {
        let degenerate = Detection::new(
            BoundingBox::new(5.0, 5.0, 5.0, 9.0),
            DetectionClass::Empty,
            0.9,
        );
        let engine = DetectionEngine::new(Box::new(Fixed(vec![
            det(0.29),
            det(0.3),
            det(0.95),
            degenerate,
        ])));
        let frame = Frame::from_bgr(vec![0; 4 * 4 * 3], 4, 4, 0).unwrap();
        let kept = engine.detect(&frame).unwrap();
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|d| d.confidence >= 0.3));
    }

    #[test]
    fn converts_bgr_to_rgb() {
        let frame = Frame::from_bgr(vec![1, 2, 3, 4, 5, 6], 2, 1, 0).unwrap();
        let rgb = frame_to_rgb(&frame).unwrap();
        assert_eq!(rgb.as_raw(), &vec![3, 2, 1, 6, 5, 4]);
    }
}
