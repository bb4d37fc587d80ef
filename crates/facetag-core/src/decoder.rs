//! Multi-stride head decoding.
//!
//! Turns raw per-stride score/box/landmark tensors into candidate detections
//! in original-image coordinates, using the variant's head table.

use crate::detector::DetectorError;
use crate::heads::{BoxEncoding, ModelVariant, StrideHead};
use crate::letterbox::Letterbox;
use crate::network::HeadOutputs;
use crate::types::{BoundingBox, Detection, Landmarks};

/// Boxes whose clamped width or height is at or below this are dropped.
const MIN_BOX_SIDE: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeParams {
    pub confidence_threshold: f32,
    /// Hard cap applied to the score-sorted candidates before suppression.
    pub max_candidates: usize,
}

/// Decode all strides, sort by descending score (stable) and truncate to the cap.
pub fn decode(
    outputs: &HeadOutputs,
    variant: &ModelVariant,
    letterbox: &Letterbox,
    params: &DecodeParams,
) -> Result<Vec<Detection>, DetectorError> {
    let mut candidates = Vec::new();
    for head in &variant.heads {
        decode_stride(
            outputs,
            variant,
            head,
            letterbox,
            params.confidence_threshold,
            &mut candidates,
        )?;
    }

    let raw = candidates.len();
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    candidates.truncate(params.max_candidates);
    if raw > candidates.len() {
        tracing::debug!(
            raw,
            kept = candidates.len(),
            "candidate cap reached; keeping highest scores"
        );
    }

    Ok(candidates)
}

fn head_tensor<'a>(
    outputs: &'a HeadOutputs,
    name: &str,
    expected: usize,
    stride: u32,
) -> Result<&'a [f32], DetectorError> {
    let tensor = outputs.get(name).ok_or_else(|| {
        DetectorError::DecodeShapeMismatch(format!("stride {stride}: tensor {name} missing"))
    })?;
    if tensor.data.len() != expected {
        return Err(DetectorError::DecodeShapeMismatch(format!(
            "stride {stride}: tensor {name} has {} values (shape {:?}), expected {expected}",
            tensor.data.len(),
            tensor.shape
        )));
    }
    Ok(&tensor.data)
}

fn decode_stride(
    outputs: &HeadOutputs,
    variant: &ModelVariant,
    head: &StrideHead,
    letterbox: &Letterbox,
    threshold: f32,
    out: &mut Vec<Detection>,
) -> Result<(), DetectorError> {
    let anchors = variant.anchor_count(head);
    let scores = head_tensor(outputs, &head.score, anchors, head.stride)?;
    let boxes = head_tensor(outputs, &head.bbox, anchors * 4, head.stride)?;
    let kps = match &head.landmarks {
        Some(name) => Some(head_tensor(outputs, name, anchors * 10, head.stride)?),
        None => None,
    };

    let stride = head.stride as f32;

    for idx in 0..anchors {
        let score = variant.score_activation.apply(scores[idx]);
        // Negated comparison also drops NaN.
        if !(score >= threshold) {
            continue;
        }

        let (ax, ay) = variant.anchor_center(head, idx);
        let b = &boxes[idx * 4..idx * 4 + 4];

        let (x1, y1, x2, y2, unit) = match variant.box_encoding {
            BoxEncoding::DistanceToEdges => (
                ax - b[0] * stride,
                ay - b[1] * stride,
                ax + b[2] * stride,
                ay + b[3] * stride,
                stride,
            ),
            BoxEncoding::CenterOffset { variances: [v0, v1] } => {
                let size = head.anchor_sizes[idx % variant.anchors_per_cell];
                let cx = ax + b[0] * v0 * size;
                let cy = ay + b[1] * v0 * size;
                let w = size * (b[2] * v1).exp();
                let h = size * (b[3] * v1).exp();
                (cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0, v0 * size)
            }
        };

        let (sx1, sy1) = letterbox.to_source(x1, y1);
        let (sx2, sy2) = letterbox.to_source(x2, y2);
        let bbox = BoundingBox::from_corners(sx1, sy1, sx2, sy2)
            .clamp_to(letterbox.source_width, letterbox.source_height);
        if !(bbox.width > MIN_BOX_SIDE && bbox.height > MIN_BOX_SIDE) {
            continue;
        }

        let landmarks = kps.map(|k| {
            let k = &k[idx * 10..idx * 10 + 10];
            let points: Landmarks = std::array::from_fn(|i| {
                letterbox.to_source(ax + k[i * 2] * unit, ay + k[i * 2 + 1] * unit)
            });
            points
        });

        out.push(Detection {
            bbox,
            score,
            landmarks,
        });
    }

    Ok(())
}

/// Builders for synthetic head tensors in the layout a variant expects.
#[cfg(test)]
pub(crate) mod test_support {
    use crate::heads::ModelVariant;
    use crate::network::{HeadOutputs, HeadTensor};
    use std::collections::HashMap;

    pub struct SyntheticHeads<'a> {
        variant: &'a ModelVariant,
        tensors: HashMap<String, Vec<f32>>,
    }

    impl<'a> SyntheticHeads<'a> {
        pub fn new(variant: &'a ModelVariant) -> Self {
            let mut tensors = HashMap::new();
            for head in &variant.heads {
                let n = variant.anchor_count(head);
                tensors.insert(head.score.clone(), vec![0.0; n]);
                tensors.insert(head.bbox.clone(), vec![0.0; n * 4]);
                if let Some(k) = &head.landmarks {
                    tensors.insert(k.clone(), vec![0.0; n * 10]);
                }
            }
            Self { variant, tensors }
        }

        /// Anchor index of the cell whose centre is nearest `(x, y)` on the canvas.
        pub fn anchor_near(&self, head_idx: usize, x: f32, y: f32) -> usize {
            let head = &self.variant.heads[head_idx];
            let grid = self.variant.grid_size(head);
            let s = head.stride as f32;
            let col = ((x / s).round() as usize).min(grid - 1);
            let row = ((y / s).round() as usize).min(grid - 1);
            (row * grid + col) * self.variant.anchors_per_cell
        }

        /// Write a distance-to-edges box (canvas corners) at `anchor`.
        pub fn place(
            &mut self,
            head_idx: usize,
            anchor: usize,
            corners: (f32, f32, f32, f32),
            raw_score: f32,
            landmarks: Option<[(f32, f32); 5]>,
        ) {
            let head = &self.variant.heads[head_idx];
            let (ax, ay) = self.variant.anchor_center(head, anchor);
            let s = head.stride as f32;
            let (x1, y1, x2, y2) = corners;

            self.tensors.get_mut(&head.score).unwrap()[anchor] = raw_score;
            let b = &mut self.tensors.get_mut(&head.bbox).unwrap()[anchor * 4..anchor * 4 + 4];
            b.copy_from_slice(&[(ax - x1) / s, (ay - y1) / s, (x2 - ax) / s, (y2 - ay) / s]);

            if let (Some(points), Some(name)) = (landmarks, &head.landmarks) {
                let k = &mut self.tensors.get_mut(name).unwrap()[anchor * 10..anchor * 10 + 10];
                for (i, (lx, ly)) in points.iter().enumerate() {
                    k[i * 2] = (lx - ax) / s;
                    k[i * 2 + 1] = (ly - ay) / s;
                }
            }
        }

        pub fn set_raw(&mut self, name: &str, index: usize, value: f32) {
            self.tensors.get_mut(name).unwrap()[index] = value;
        }

        pub fn build(&self) -> HeadOutputs {
            let mut outputs = HeadOutputs::new();
            for (name, data) in &self.tensors {
                outputs.insert(name.clone(), HeadTensor::new(vec![data.len()], data.clone()));
            }
            outputs
        }
    }
}
