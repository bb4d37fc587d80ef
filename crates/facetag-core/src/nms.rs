//! Greedy non-maximum suppression.

use crate::types::{BoundingBox, Detection};

/// Intersection-over-Union of two boxes. A zero-area union yields 0.
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.left.max(b.left);
    let y1 = a.top.max(b.top);
    let x2 = a.right().min(b.right());
    let y2 = a.bottom().min(b.bottom());

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union_area = a.area() + b.area() - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}

/// Keep a candidate only if its IoU with every already-kept box is at or
/// below `iou_threshold`. Candidates are visited in descending score order;
/// equal scores keep their input order. Output is in acceptance order.
pub fn suppress(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<Detection> = Vec::new();
    for candidate in detections {
        if keep
            .iter()
            .all(|kept| iou(&kept.bbox, &candidate.bbox) <= iou_threshold)
        {
            keep.push(candidate);
        }
    }

    keep
}
