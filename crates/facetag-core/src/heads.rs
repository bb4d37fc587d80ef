//! Versioned per-model-variant output head mapping.
//!
//! A detector export is described by an explicit table: which tensor holds
//! the scores, boxes and landmarks of every stride, how scores are activated
//! and how boxes are parametrized. The variant is selected by its declared id,
//! never inferred from tensor names at runtime.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Activation applied to raw score-head values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreActivation {
    /// Export already emits probabilities.
    Identity,
    Sigmoid,
}

impl ScoreActivation {
    pub fn apply(self, raw: f32) -> f32 {
        match self {
            ScoreActivation::Identity => raw,
            ScoreActivation::Sigmoid => 1.0 / (1.0 + (-raw).exp()),
        }
    }
}

/// Box-head parametrization relative to the anchor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BoxEncoding {
    /// SCRFD: anchor at `(col·s, row·s)`, box head holds distances to the
    /// left/top/right/bottom edges in stride units; keypoints are offsets in
    /// stride units.
    DistanceToEdges,
    /// RetinaFace: anchor at `((col+0.5)·s, (row+0.5)·s)` with a square prior
    /// of `anchor_sizes[k]`; box head holds `(dx, dy, dw, dh)` scaled by the
    /// variances, width/height through `exp`.
    CenterOffset { variances: [f32; 2] },
}

impl BoxEncoding {
    fn anchor_offset(self) -> f32 {
        match self {
            BoxEncoding::DistanceToEdges => 0.0,
            BoxEncoding::CenterOffset { .. } => 0.5,
        }
    }
}

/// Named output tensors for one stride.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrideHead {
    pub stride: u32,
    pub score: String,
    pub bbox: String,
    #[serde(default)]
    pub landmarks: Option<String>,
    /// Prior sizes per anchor in a cell (`CenterOffset` only).
    #[serde(default)]
    pub anchor_sizes: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVariant {
    pub id: String,
    pub input_size: u32,
    pub anchors_per_cell: usize,
    pub score_activation: ScoreActivation,
    pub box_encoding: BoxEncoding,
    pub heads: Vec<StrideHead>,
}

impl ModelVariant {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| ConfigError::Invalid(format!("variant {}: {msg}", self.id));

        if self.input_size == 0 || self.anchors_per_cell == 0 || self.heads.is_empty() {
            return Err(invalid("input size, anchors per cell and heads must be non-empty".into()));
        }
        for head in &self.heads {
            if head.stride == 0 || self.input_size % head.stride != 0 {
                return Err(invalid(format!(
                    "stride {} does not divide input size {}",
                    head.stride, self.input_size
                )));
            }
            if matches!(self.box_encoding, BoxEncoding::CenterOffset { .. })
                && head.anchor_sizes.len() != self.anchors_per_cell
            {
                return Err(invalid(format!(
                    "stride {} needs {} anchor sizes, got {}",
                    head.stride,
                    self.anchors_per_cell,
                    head.anchor_sizes.len()
                )));
            }
        }
        Ok(())
    }

    /// Cells per side of the stride's grid.
    pub fn grid_size(&self, head: &StrideHead) -> usize {
        (self.input_size / head.stride) as usize
    }

    pub fn anchor_count(&self, head: &StrideHead) -> usize {
        let g = self.grid_size(head);
        g * g * self.anchors_per_cell
    }

    /// Canvas-space anchor centre for flat anchor index `idx` (row-major,
    /// `anchors_per_cell` consecutive entries per cell).
    pub fn anchor_center(&self, head: &StrideHead, idx: usize) -> (f32, f32) {
        let grid = self.grid_size(head);
        let cell = idx / self.anchors_per_cell;
        let offset = self.box_encoding.anchor_offset();
        let s = head.stride as f32;
        (
            ((cell % grid) as f32 + offset) * s,
            ((cell / grid) as f32 + offset) * s,
        )
    }

    /// Every tensor name this variant reads.
    pub fn tensor_names(&self) -> impl Iterator<Item = &str> {
        self.heads.iter().flat_map(|h| {
            [Some(h.score.as_str()), Some(h.bbox.as_str()), h.landmarks.as_deref()]
                .into_iter()
                .flatten()
        })
    }
}

fn scrfd_heads(score: [&str; 3], bbox: [&str; 3], kps: [&str; 3]) -> Vec<StrideHead> {
    [8u32, 16, 32]
        .into_iter()
        .enumerate()
        .map(|(i, stride)| StrideHead {
            stride,
            score: score[i].to_string(),
            bbox: bbox[i].to_string(),
            landmarks: Some(kps[i].to_string()),
            anchor_sizes: Vec::new(),
        })
        .collect()
}

fn builtin_variants() -> Vec<ModelVariant> {
    let named = scrfd_heads(
        ["score_8", "score_16", "score_32"],
        ["bbox_8", "bbox_16", "bbox_32"],
        ["kps_8", "kps_16", "kps_32"],
    );

    vec![
        // insightface buffalo_l det_10g.onnx
        ModelVariant {
            id: "scrfd_10g_bnkps".into(),
            input_size: 640,
            anchors_per_cell: 2,
            score_activation: ScoreActivation::Identity,
            box_encoding: BoxEncoding::DistanceToEdges,
            heads: scrfd_heads(
                ["448", "471", "494"],
                ["451", "474", "497"],
                ["454", "477", "500"],
            ),
        },
        ModelVariant {
            id: "scrfd_named_bnkps".into(),
            input_size: 640,
            anchors_per_cell: 2,
            score_activation: ScoreActivation::Identity,
            box_encoding: BoxEncoding::DistanceToEdges,
            heads: named.clone(),
        },
        ModelVariant {
            id: "scrfd_named_logits".into(),
            input_size: 640,
            anchors_per_cell: 2,
            score_activation: ScoreActivation::Sigmoid,
            box_encoding: BoxEncoding::DistanceToEdges,
            heads: named,
        },
        ModelVariant {
            id: "retinaface_mnet25".into(),
            input_size: 640,
            anchors_per_cell: 2,
            score_activation: ScoreActivation::Sigmoid,
            box_encoding: BoxEncoding::CenterOffset { variances: [0.1, 0.2] },
            heads: [(8u32, [16.0f32, 32.0]), (16, [64.0, 128.0]), (32, [256.0, 512.0])]
                .into_iter()
                .map(|(stride, sizes)| StrideHead {
                    stride,
                    score: format!("score_{stride}"),
                    bbox: format!("bbox_{stride}"),
                    landmarks: Some(format!("landmark_{stride}")),
                    anchor_sizes: sizes.to_vec(),
                })
                .collect(),
        },
    ]
}

#[derive(Deserialize)]
struct VariantFile {
    #[serde(default, rename = "variant")]
    variants: Vec<ModelVariant>,
}

/// Lookup table of known detector variants.
#[derive(Debug, Clone)]
pub struct VariantRegistry {
    variants: Vec<ModelVariant>,
}

impl Default for VariantRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl VariantRegistry {
    pub fn builtin() -> Self {
        Self {
            variants: builtin_variants(),
        }
    }

    /// Add or replace variants from TOML (`[[variant]]` tables).
    pub fn extend_from_toml(&mut self, src: &str) -> Result<usize, ConfigError> {
        let file: VariantFile = toml::from_str(src)?;
        let count = file.variants.len();
        for variant in file.variants {
            variant.validate()?;
            tracing::info!(id = %variant.id, strides = variant.heads.len(), "registered detector variant");
            self.variants.retain(|v| v.id != variant.id);
            self.variants.push(variant);
        }
        Ok(count)
    }

    pub fn extend_from_file(&mut self, path: &Path) -> Result<usize, ConfigError> {
        let src = std::fs::read_to_string(path)?;
        self.extend_from_toml(&src)
    }

    pub fn get(&self, id: &str) -> Result<&ModelVariant, ConfigError> {
        self.variants
            .iter()
            .find(|v| v.id == id)
            .ok_or_else(|| ConfigError::UnknownVariant(id.to_string()))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.variants.iter().map(|v| v.id.as_str())
    }
}
