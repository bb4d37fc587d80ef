//! Per-face embedding extraction.
//!
//! Each embedding is extracted independently; a failure of one never discards
//! the other.

use crate::appearance::AppearanceEncoder;
use crate::recognizer::IdentityEncoder;
use crate::types::{BoundingBox, Detection, Embedding};
use image::RgbImage;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaceEmbeddings {
    pub identity: Option<Embedding>,
    pub appearance: Option<Embedding>,
}

pub struct EmbeddingExtractor {
    identity: IdentityEncoder,
    appearance: Option<AppearanceEncoder>,
}

impl EmbeddingExtractor {
    /// `appearance` is optional: without it faces carry identity embeddings only.
    pub fn new(identity: IdentityEncoder, appearance: Option<AppearanceEncoder>) -> Self {
        Self {
            identity,
            appearance,
        }
    }

    pub fn has_appearance(&self) -> bool {
        self.appearance.is_some()
    }

    pub fn extract(
        &self,
        image: &RgbImage,
        detection: &Detection,
        person: Option<&BoundingBox>,
    ) -> FaceEmbeddings {
        let identity = match self.identity.extract(image, detection) {
            Ok(e) => Some(e),
            Err(e) => {
                tracing::warn!(error = %e, bbox = ?detection.bbox, "identity embedding failed");
                None
            }
        };

        let appearance = self.appearance.as_ref().and_then(|encoder| {
            match encoder.extract(image, &detection.bbox, person) {
                Ok(e) => Some(e),
                Err(e) => {
                    tracing::warn!(error = %e, bbox = ?detection.bbox, "appearance embedding failed");
                    None
                }
            }
        });

        FaceEmbeddings {
            identity,
            appearance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appearance::{BodyCrop, APPEARANCE_EMBEDDING_DIM};
    use crate::network::EmbeddingNetwork;
    use crate::recognizer::{RecognizerError, IDENTITY_EMBEDDING_DIM};
    use ndarray::ArrayView4;
    use std::sync::Arc;

    struct Constant(usize);

    impl EmbeddingNetwork for Constant {
        fn embed(&self, _input: ArrayView4<'_, f32>) -> Result<Vec<f32>, RecognizerError> {
            Ok(vec![1.0; self.0])
        }
    }

    struct Broken;

    impl EmbeddingNetwork for Broken {
        fn embed(&self, _input: ArrayView4<'_, f32>) -> Result<Vec<f32>, RecognizerError> {
            Err(RecognizerError::InferenceFailed("boom".into()))
        }
    }

    fn detection() -> Detection {
        Detection {
            bbox: BoundingBox::from_corners(80.0, 40.0, 120.0, 90.0),
            score: 0.9,
            landmarks: None,
        }
    }

    #[test]
    fn test_both_embeddings() {
        let extractor = EmbeddingExtractor::new(
            IdentityEncoder::new(Arc::new(Constant(IDENTITY_EMBEDDING_DIM)), 8),
            Some(AppearanceEncoder::new(
                Arc::new(Constant(APPEARANCE_EMBEDDING_DIM)),
                BodyCrop::default(),
                8,
            )),
        );
        let out = extractor.extract(&RgbImage::new(200, 300), &detection(), None);
        assert_eq!(out.identity.unwrap().dim(), IDENTITY_EMBEDDING_DIM);
        assert_eq!(out.appearance.unwrap().dim(), APPEARANCE_EMBEDDING_DIM);
    }

    #[test]
    fn test_appearance_failure_keeps_identity() {
        let extractor = EmbeddingExtractor::new(
            IdentityEncoder::new(Arc::new(Constant(IDENTITY_EMBEDDING_DIM)), 8),
            Some(AppearanceEncoder::new(Arc::new(Broken), BodyCrop::default(), 8)),
        );
        let out = extractor.extract(&RgbImage::new(200, 300), &detection(), None);
        assert!(out.identity.is_some());
        assert!(out.appearance.is_none());
    }

    #[test]
    fn test_identity_failure_keeps_appearance() {
        let extractor = EmbeddingExtractor::new(
            IdentityEncoder::new(Arc::new(Broken), 8),
            Some(AppearanceEncoder::new(
                Arc::new(Constant(APPEARANCE_EMBEDDING_DIM)),
                BodyCrop::default(),
                8,
            )),
        );
        let out = extractor.extract(&RgbImage::new(200, 300), &detection(), None);
        assert!(out.identity.is_none());
        assert!(out.appearance.is_some());
    }
}
