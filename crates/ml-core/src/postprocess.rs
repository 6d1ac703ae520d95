//! Decoding of raw YOLO prediction rows into detections.

use crate::detector::{BoundingBox, Detection, DetectionClass};

/// Decode prediction rows laid out as `[cx, cy, w, h, score_0, score_1, ...]`.
///
/// The class is the arg-max score; rows whose best score is below
/// `confidence` or whose box is degenerate are skipped.
pub fn decode_predictions(rows: &[Vec<f32>], confidence: f32) -> Vec<Detection> {
    let mut detections = Vec::new();
    for row in rows {
        if row.len() < 5 {
            continue;
        }
        let (class_id, score) = row[4..]
            .iter()
            .copied()
            .enumerate()
            .fold((0usize, f32::MIN), |best, (idx, score)| {
                if score > best.1 { (idx, score) } else { best }
            });
        if score < confidence {
            continue;
        }
        let bbox = BoundingBox::from_center(row[0], row[1], row[2], row[3]);
        if !bbox.is_valid() {
            continue;
        }
        detections.push(Detection::new(
            bbox,
            DetectionClass::from_class_id(class_id as i64),
            score,
        ));
    }
    detections
}

/// Class-agnostic non-maximum suppression keeping at most `max_detections`.
pub fn non_max_suppression(
    mut detections: Vec<Detection>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(max_detections.min(detections.len()));
    for candidate in detections {
        if kept.len() >= max_detections {
            break;
        }
        if kept
            .iter()
            .all(|existing| existing.bbox.iou(&candidate.bbox) <= iou_threshold)
        {
            kept.push(candidate);
        }
    }
    kept
}

/// Map boxes from model input space back to frame space, clamped to the frame.
pub fn rescale(detections: &mut [Detection], from: (u32, u32), to: (u32, u32)) {
    if from.0 == 0 || from.1 == 0 {
        return;
    }
    let sx = to.0 as f32 / from.0 as f32;
    let sy = to.1 as f32 / from.1 as f32;
    for det in detections {
        det.bbox = det.bbox.scaled(sx, sy).clamped(to.0 as f32, to.1 as f32);
    }
}
