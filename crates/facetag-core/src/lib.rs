//! facetag-core — Face detection and recognition pipeline.
//!
//! Decodes multi-stride detector heads (SCRFD, RetinaFace) into face boxes,
//! extracts ArcFace identity and body appearance embeddings, fuses them and
//! matches against a per-tag gallery. Inference runs via ONNX Runtime behind
//! the traits in [`network`].

pub mod alignment;
pub mod appearance;
pub mod config;
pub mod crop;
pub mod decoder;
pub mod detector;
pub mod extractor;
pub mod fusion;
pub mod gallery;
pub mod heads;
pub mod letterbox;
pub mod matcher;
pub mod network;
pub mod nms;
pub mod pose;
pub mod recognizer;
pub mod types;

pub use config::{ConfigError, PipelineConfig};
pub use detector::{DetectionRun, DetectorError, FaceDetector};
pub use extractor::{EmbeddingExtractor, FaceEmbeddings};
pub use fusion::{FusionConfig, FusionPolicy};
pub use gallery::{GalleryStore, GalleryUpdate};
pub use heads::{ModelVariant, VariantRegistry};
pub use matcher::{CosineMatcher, MatchOutcome, Matcher, RecognitionContext};
pub use recognizer::RecognizerError;
pub use types::{
    BoundingBox, Detection, Embedding, EventId, Face, FaceId, FaceState, GalleryEntry, Photo,
    PhotoId, TagId,
};
