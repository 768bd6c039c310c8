//! Detection capability and YOLO output decoding

use crate::error::VisionError;
use pairguard_core::{BoundingBox, Detection, Frame};
use std::cmp::Ordering;

/// IoU above which two same-class boxes are treated as one object
pub const NMS_IOU_THRESHOLD: f32 = 0.45;

/// Shared object detector: image in, detections out. May be slow; always called from a
/// blocking context.
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;

    fn infer(&self, frame: &Frame) -> Result<Vec<Detection>, VisionError>;
}

/// Decode a `[1, 4 + C, N]` YOLO head. Boxes are `cx, cy, w, h` in model input pixels and
/// are scaled back to frame pixels with `scale = (frame_w / input_w, frame_h / input_h)`.
pub fn decode_yolo_output(
    shape: &[usize],
    data: &[f32],
    confidence_floor: f32,
    scale: (f32, f32),
) -> Result<Vec<Detection>, VisionError> {
    let (rows, anchors) = match shape {
        [1, rows, anchors] => (*rows, *anchors),
        [rows, anchors] => (*rows, *anchors),
        _ => {
            return Err(VisionError::Model(format!(
                "unexpected output shape {:?}",
                shape
            )))
        }
    };
    if rows <= 4 {
        return Err(VisionError::Model(format!("output has no class rows ({:?})", shape)));
    }
    if data.len() < rows * anchors {
        return Err(VisionError::Model(format!(
            "output holds {} values, shape {:?} needs {}",
            data.len(),
            shape,
            rows * anchors
        )));
    }
    let at = |row: usize, anchor: usize| data[row * anchors + anchor];

    let mut detections = Vec::new();
    for anchor in 0..anchors {
        let mut best_class = 0;
        let mut best_score = f32::MIN;
        for class in 0..rows - 4 {
            let score = at(4 + class, anchor);
            if score > best_score {
                best_score = score;
                best_class = class;
            }
        }
        if !best_score.is_finite() || best_score < confidence_floor {
            continue;
        }
        let (cx, cy, w, h) = (at(0, anchor), at(1, anchor), at(2, anchor), at(3, anchor));
        if ![cx, cy, w, h].iter().all(|v| v.is_finite()) || w <= 0.0 || h <= 0.0 {
            continue;
        }
        let bbox = BoundingBox::new(
            (cx - w / 2.0) * scale.0,
            (cy - h / 2.0) * scale.1,
            (cx + w / 2.0) * scale.0,
            (cy + h / 2.0) * scale.1,
        );
        detections.push(Detection::new(best_class as u32, best_score, bbox));
    }
    Ok(non_max_suppression(detections, NMS_IOU_THRESHOLD))
}

/// Per-class greedy non-maximum suppression, highest confidence first
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.retain(|d| d.confidence.is_finite());
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });

    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let overlaps = keep.iter().any(|kept| {
            kept.class_id == candidate.class_id && kept.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !overlaps {
            keep.push(candidate);
        }
    }
    keep
}
