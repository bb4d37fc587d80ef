//! Face detector service.
//!
//! Letterboxes the photo, runs the multi-stride detector network, decodes the
//! heads described by the selected model variant and suppresses duplicates.

use crate::config::PipelineConfig;
use crate::decoder::{decode, DecodeParams};
use crate::heads::ModelVariant;
use crate::letterbox::letterbox;
use crate::network::{DetectorNetwork, OnnxModel};
use crate::nms::suppress;
use crate::types::Detection;
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("detector unavailable: {0}")]
    Unavailable(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("decode shape mismatch: {0}")]
    DecodeShapeMismatch(String),
    #[error("image has no pixels")]
    EmptyImage,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectParams {
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub max_detections: usize,
}

impl Default for DetectParams {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for DetectParams {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            nms_threshold: config.nms_threshold,
            max_detections: config.max_detections,
        }
    }
}

/// Result of one detector pass over a photo.
#[derive(Debug, Clone, Default)]
pub struct DetectionRun {
    /// Surviving detections in acceptance order.
    pub detections: Vec<Detection>,
    /// Candidates entering suppression (after the cap).
    pub candidates: usize,
    /// Set when the network output did not match the variant's head table.
    pub warning: Option<String>,
}

pub struct FaceDetector {
    network: Arc<dyn DetectorNetwork>,
    variant: ModelVariant,
    params: DetectParams,
}

impl FaceDetector {
    /// Bind a network to a variant. Fails if the network is known not to
    /// expose a tensor the variant reads.
    pub fn new(
        network: Arc<dyn DetectorNetwork>,
        variant: ModelVariant,
        params: DetectParams,
    ) -> Result<Self, DetectorError> {
        variant
            .validate()
            .map_err(|e| DetectorError::Unavailable(e.to_string()))?;

        let outputs = network.output_names();
        if !outputs.is_empty() {
            if let Some(missing) = variant
                .tensor_names()
                .find(|name| !outputs.iter().any(|o| o == name))
            {
                return Err(DetectorError::Unavailable(format!(
                    "model does not expose tensor {missing} required by variant {} (outputs: {outputs:?})",
                    variant.id
                )));
            }
        }

        Ok(Self {
            network,
            variant,
            params,
        })
    }

    /// Load an ONNX detector from disk and bind it to `variant`.
    pub fn load(
        model_path: &str,
        variant: ModelVariant,
        params: DetectParams,
        intra_threads: usize,
    ) -> Result<Self, DetectorError> {
        if !OnnxModel::exists(model_path) {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }
        let model = OnnxModel::load(model_path, intra_threads)?;
        tracing::info!(path = model_path, variant = %variant.id, "detector ready");
        Self::new(Arc::new(model), variant, params)
    }

    pub fn variant(&self) -> &ModelVariant {
        &self.variant
    }

    /// Detect faces in an RGB image.
    ///
    /// A head shape mismatch is not an error: the run carries zero
    /// detections and a warning instead.
    pub fn detect(&self, image: &RgbImage) -> Result<DetectionRun, DetectorError> {
        let (input, lb) = letterbox(image, self.variant.input_size)?;
        let outputs = self.network.infer(input.view())?;

        let params = DecodeParams {
            confidence_threshold: self.params.confidence_threshold,
            max_candidates: self.params.max_detections,
        };

        let candidates = match decode(&outputs, &self.variant, &lb, &params) {
            Ok(c) => c,
            Err(DetectorError::DecodeShapeMismatch(detail)) => {
                tracing::warn!(
                    variant = %self.variant.id,
                    %detail,
                    "detector outputs do not match variant head table; no candidates"
                );
                return Ok(DetectionRun {
                    detections: Vec::new(),
                    candidates: 0,
                    warning: Some(detail),
                });
            }
            Err(e) => return Err(e),
        };

        let count = candidates.len();
        let detections = suppress(candidates, self.params.nms_threshold);
        tracing::debug!(candidates = count, kept = detections.len(), "detection complete");

        Ok(DetectionRun {
            detections,
            candidates: count,
            warning: None,
        })
    }
}
