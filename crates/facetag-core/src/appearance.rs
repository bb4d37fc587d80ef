//! Appearance (clothing/body) encoder.
//!
//! Produces a 256-dimensional re-identification embedding from a body crop
//! derived from the face box, or from a person box supplied by the caller.

use crate::config::ConfigError;
use crate::crop::{crop_resized, to_nchw};
use crate::network::{EmbeddingNetwork, OnnxModel};
use crate::recognizer::{finish_embedding, RecognizerError};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const APPEARANCE_INPUT_WIDTH: u32 = 128;
pub const APPEARANCE_INPUT_HEIGHT: u32 = 256;
pub const APPEARANCE_EMBEDDING_DIM: usize = 256;
pub const APPEARANCE_MODEL_VERSION: &str = "osnet_x1_0";

// ImageNet statistics in 0..255 pixel units.
const IMAGENET_MEAN: [f32; 3] = [123.675, 116.28, 103.53];
const IMAGENET_STD: [f32; 3] = [58.395, 57.12, 57.375];

/// Dilation of the face box into a body region, in multiples of the face size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BodyCrop {
    /// Total body width as a multiple of the face width, centred on the face.
    pub width_factor: f32,
    /// Extension above the face top, in face heights.
    pub above_factor: f32,
    /// Extension below the face bottom, in face heights.
    pub below_factor: f32,
}

impl Default for BodyCrop {
    fn default() -> Self {
        Self {
            width_factor: 3.0,
            above_factor: 0.5,
            below_factor: 5.0,
        }
    }
}

impl BodyCrop {
    /// Unclamped body region for a face box.
    pub fn region(&self, face: &BoundingBox) -> BoundingBox {
        let cx = face.left + face.width / 2.0;
        let half_w = face.width * self.width_factor / 2.0;
        BoundingBox::from_corners(
            cx - half_w,
            face.top - face.height * self.above_factor,
            cx + half_w,
            face.bottom() + face.height * self.below_factor,
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ok = self.width_factor > 0.0 && self.above_factor >= 0.0 && self.below_factor >= 0.0;
        if !ok {
            return Err(ConfigError::Invalid(format!("body crop factors out of range: {self:?}")));
        }
        Ok(())
    }
}

pub struct AppearanceEncoder {
    network: Arc<dyn EmbeddingNetwork>,
    body_crop: BodyCrop,
    min_crop_px: u32,
}

impl AppearanceEncoder {
    pub fn new(network: Arc<dyn EmbeddingNetwork>, body_crop: BodyCrop, min_crop_px: u32) -> Self {
        Self {
            network,
            body_crop,
            min_crop_px,
        }
    }

    pub fn load(
        model_path: &str,
        body_crop: BodyCrop,
        min_crop_px: u32,
        intra_threads: usize,
    ) -> Result<Self, RecognizerError> {
        if !OnnxModel::exists(model_path) {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }
        let model = OnnxModel::load(model_path, intra_threads)?;
        Ok(Self::new(Arc::new(model), body_crop, min_crop_px))
    }

    /// Body region used for a face: the caller's person box if given,
    /// otherwise the dilated face box.
    pub fn body_region(&self, face: &BoundingBox, person: Option<&BoundingBox>) -> BoundingBox {
        person.copied().unwrap_or_else(|| self.body_crop.region(face))
    }

    pub fn extract(
        &self,
        image: &RgbImage,
        face: &BoundingBox,
        person: Option<&BoundingBox>,
    ) -> Result<Embedding, RecognizerError> {
        let region = self.body_region(face, person);
        let crop = crop_resized(
            image,
            &region,
            self.min_crop_px,
            APPEARANCE_INPUT_WIDTH,
            APPEARANCE_INPUT_HEIGHT,
        )?;
        let input = to_nchw(&crop, IMAGENET_MEAN, IMAGENET_STD);
        let raw = self.network.embed(input.view())?;
        finish_embedding(raw, APPEARANCE_EMBEDDING_DIM, APPEARANCE_MODEL_VERSION)
    }
}
