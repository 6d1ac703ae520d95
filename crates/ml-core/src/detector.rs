use std::path::PathBuf;

use anyhow::Result;
use image::RgbImage;

/// Axis-aligned box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Build from a centre point and size, as emitted by YOLO heads.
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Non-degenerate: `x1 < x2` and `y1 < y2`.
    pub fn is_valid(&self) -> bool {
        self.x1 < self.x2 && self.y1 < self.y2
    }

    pub fn iou(&self, other: &Self) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);
        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self {
            x1: self.x1 * sx,
            y1: self.y1 * sy,
            x2: self.x2 * sx,
            y2: self.y2 * sy,
        }
    }

    pub fn clamped(&self, width: f32, height: f32) -> Self {
        Self {
            x1: self.x1.clamp(0.0, width),
            y1: self.y1.clamp(0.0, height),
            x2: self.x2.clamp(0.0, width),
            y2: self.y2.clamp(0.0, height),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionClass {
    Empty,
    Occupied,
}

impl DetectionClass {
    /// The parking model is trained with class 0 = empty, 1 = occupied.
    pub fn from_class_id(class_id: i64) -> Self {
        if class_id == 1 {
            DetectionClass::Occupied
        } else {
            DetectionClass::Empty
        }
    }
}

/// Single detection returned by a detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class: DetectionClass,
    pub confidence: f32,
}

impl Detection {
    pub fn new(bbox: BoundingBox, class: DetectionClass, confidence: f32) -> Self {
        Self {
            bbox,
            class,
            confidence,
        }
    }
}

/// Object detection capability.
///
/// Implementations resolve their device and weights at construction; `detect`
/// returns boxes in the pixel space of `image`.
pub trait Detector: Send {
    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>>;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>> {
        (**self).detect(image)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Use CUDA when available, CPU otherwise.
    #[default]
    Auto,
    Cpu,
}

#[derive(Clone, Debug)]
pub struct DetectorConfig {
    pub model_path: PathBuf,
    pub device: DevicePreference,
    /// Square model input edge in pixels.
    pub input_size: u32,
    pub confidence: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

impl DetectorConfig {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            device: DevicePreference::Auto,
            input_size: 640,
            confidence: 0.25,
            iou_threshold: 0.45,
            max_detections: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        assert!((b.iou(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn from_center_round_trips_size() {
        let b = BoundingBox::from_center(50.0, 40.0, 20.0, 10.0);
        assert_eq!(b, BoundingBox::new(40.0, 35.0, 60.0, 45.0));
        assert!(b.is_valid());
        assert!(!BoundingBox::new(5.0, 0.0, 5.0, 10.0).is_valid());
    }

    #[test]
    fn class_mapping() {
        assert_eq!(DetectionClass::from_class_id(1), DetectionClass::Occupied);
        assert_eq!(DetectionClass::from_class_id(0), DetectionClass::Empty);
        assert_eq!(DetectionClass::from_class_id(7), DetectionClass::Empty);
    }
}
