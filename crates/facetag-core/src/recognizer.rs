//! ArcFace identity encoder.
//!
//! Extracts 512-dimensional identity embeddings from landmark-aligned face
//! crops, using the w600k_r50 ArcFace model.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::crop::{crop_resized, pixel_region, to_nchw};
use crate::network::{EmbeddingNetwork, OnnxModel};
use crate::types::{Detection, Embedding};
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // NOT 128.0 — ArcFace uses symmetric normalization
pub const IDENTITY_EMBEDDING_DIM: usize = 512;
pub const IDENTITY_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} — download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("crop of {width}x{height} is below the {min}px minimum")]
    DegenerateCrop { width: u32, height: u32, min: u32 },
    #[error("expected {expected}-dim embedding, got {actual}")]
    UnexpectedDimension { expected: usize, actual: usize },
    #[error("embedding has zero norm")]
    ZeroNorm,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Validate the network output length and L2-normalize it.
pub(crate) fn finish_embedding(
    raw: Vec<f32>,
    expected: usize,
    version: &str,
) -> Result<Embedding, RecognizerError> {
    if raw.len() != expected {
        return Err(RecognizerError::UnexpectedDimension {
            expected,
            actual: raw.len(),
        });
    }
    Embedding::normalized(raw, version).ok_or(RecognizerError::ZeroNorm)
}

pub struct IdentityEncoder {
    network: Arc<dyn EmbeddingNetwork>,
    min_crop_px: u32,
}

impl IdentityEncoder {
    pub fn new(network: Arc<dyn EmbeddingNetwork>, min_crop_px: u32) -> Self {
        Self {
            network,
            min_crop_px,
        }
    }

    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str, min_crop_px: u32, intra_threads: usize) -> Result<Self, RecognizerError> {
        if !OnnxModel::exists(model_path) {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }
        let model = OnnxModel::load(model_path, intra_threads)?;
        Ok(Self::new(Arc::new(model), min_crop_px))
    }

    /// The 112×112 network input for a detection: aligned when landmarks
    /// exist, otherwise the clamped box resized.
    pub fn face_crop(&self, image: &RgbImage, detection: &Detection) -> Result<RgbImage, RecognizerError> {
        match &detection.landmarks {
            Some(landmarks) => {
                // Degenerate boxes are rejected even when alignment is possible.
                pixel_region(image, &detection.bbox, self.min_crop_px)?;
                Ok(alignment::align_face(image, landmarks))
            }
            None => crop_resized(image, &detection.bbox, self.min_crop_px, ALIGNED_SIZE, ALIGNED_SIZE),
        }
    }

    pub fn extract(&self, image: &RgbImage, detection: &Detection) -> Result<Embedding, RecognizerError> {
        let crop = self.face_crop(image, detection)?;
        let input = Self::preprocess(&crop);
        let raw = self.network.embed(input.view())?;
        finish_embedding(raw, IDENTITY_EMBEDDING_DIM, IDENTITY_MODEL_VERSION)
    }

    fn preprocess(aligned_face: &RgbImage) -> ndarray::Array4<f32> {
        to_nchw(aligned_face, [ARCFACE_MEAN; 3], [ARCFACE_STD; 3])
    }
}
