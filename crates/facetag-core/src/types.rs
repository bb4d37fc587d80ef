use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::matcher::MatchOutcome;
use crate::pose::{self, Pose};

/// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
pub type Landmarks = [(f32, f32); 5];

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Photo identity, owned by the surrounding application.
    PhotoId
);
string_id!(
    /// Tag (person) identity a gallery entry belongs to.
    TagId
);
string_id!(
    /// Event scope that tags and gallery entries live in.
    EventId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaceId(pub Uuid);

impl FaceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FaceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Error, Debug)]
pub enum PhotoError {
    #[error("pixel buffer holds {actual} bytes, expected {expected} for {width}x{height} RGB8")]
    InvalidPixelBuffer {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// An input photo: identity plus decoded RGB8 pixels.
#[derive(Debug, Clone)]
pub struct Photo {
    pub id: PhotoId,
    pub image: RgbImage,
}

impl Photo {
    pub fn new(id: impl Into<PhotoId>, image: RgbImage) -> Self {
        Self {
            id: id.into(),
            image,
        }
    }

    /// Wrap a raw packed RGB8 buffer with its declared dimensions.
    pub fn from_rgb8(
        id: impl Into<PhotoId>,
        width: u32,
        height: u32,
        bytes: Vec<u8>,
    ) -> Result<Self, PhotoError> {
        let expected = width as usize * height as usize * 3;
        let actual = bytes.len();
        let image = RgbImage::from_raw(width, height, bytes).filter(|_| actual == expected);
        match image {
            Some(image) => Ok(Self::new(id, image)),
            None => Err(PhotoError::InvalidPixelBuffer {
                width,
                height,
                expected,
                actual,
            }),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Axis-aligned box in original-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            left: x1,
            top: y1,
            width: x2 - x1,
            height: y2 - y1,
        }
    }

    pub fn right(&self) -> f32 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.top + self.height
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Clamp to `[0, width] × [0, height]`.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        let x1 = self.left.clamp(0.0, w);
        let y1 = self.top.clamp(0.0, h);
        let x2 = self.right().clamp(0.0, w);
        let y2 = self.bottom().clamp(0.0, h);
        Self::from_corners(x1, y1, x2.max(x1), y2.max(y1))
    }

    pub fn contains_within(&self, width: u32, height: u32) -> bool {
        self.left >= 0.0
            && self.top >= 0.0
            && self.right() <= width as f32
            && self.bottom() <= height as f32
    }
}

/// Candidate detection, transient between decoding and suppression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub score: f32,
    pub landmarks: Option<Landmarks>,
}

/// Face embedding vector, tagged with the model or fusion policy that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Producer of the vector (e.g., "w600k_r50", "weighted_concat/v1:0.800:0.200").
    pub model_version: Option<String>,
}

impl Embedding {
    /// L2-normalize `values`. Returns `None` for a zero or non-finite norm.
    pub fn normalized(values: Vec<f32>, model_version: impl Into<String>) -> Option<Self> {
        let norm: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if !norm.is_finite() || norm <= f32::EPSILON {
            return None;
        }
        Some(Self {
            values: values.into_iter().map(|x| x / norm).collect(),
            model_version: Some(model_version.into()),
        })
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Vectors of different length or with a zero
    /// norm score 0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return 0.0;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }
}

/// Head pose angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseAngles {
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
}

impl From<Pose> for PoseAngles {
    fn from(p: Pose) -> Self {
        Self {
            yaw: p.yaw,
            pitch: p.pitch,
            roll: p.roll,
        }
    }
}

/// Lifecycle of a Face record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaceState {
    /// Record created ahead of detection by a caller that tracks queued photos.
    /// Detection itself emits faces in `Detected`.
    Pending,
    Detected,
    Embedded,
    EmbeddingFailed,
    Matched,
    Unmatched,
    ManuallyResolved,
}

impl FaceState {
    pub fn can_transition_to(self, next: FaceState) -> bool {
        use FaceState::*;
        matches!(
            (self, next),
            (_, ManuallyResolved)
                | (Pending, Detected)
                | (Detected, Embedded)
                | (Detected, EmbeddingFailed)
                | (Embedded, Matched)
                | (Embedded, Unmatched)
                | (EmbeddingFailed, Unmatched)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FaceState::Matched | FaceState::Unmatched | FaceState::ManuallyResolved
        )
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FaceStateError {
    #[error("illegal face state transition {from:?} -> {to:?}")]
    IllegalTransition { from: FaceState, to: FaceState },
}

/// Persisted face record: one per surviving detection per photo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Face {
    pub id: FaceId,
    pub photo: PhotoId,
    pub bbox: BoundingBox,
    pub landmarks: Option<Landmarks>,
    pub pose: Option<PoseAngles>,
    pub score: f32,
    pub identity_embedding: Option<Embedding>,
    pub appearance_embedding: Option<Embedding>,
    pub fused_embedding: Option<Embedding>,
    pub fused_score: Option<f32>,
    pub recognized_tag: Option<TagId>,
    pub state: FaceState,
}

impl Face {
    pub fn from_detection(photo: PhotoId, detection: &Detection) -> Self {
        Self {
            id: FaceId::new(),
            photo,
            bbox: detection.bbox,
            landmarks: detection.landmarks,
            pose: detection
                .landmarks
                .as_ref()
                .and_then(pose::estimate_pose)
                .map(PoseAngles::from),
            score: detection.score,
            identity_embedding: None,
            appearance_embedding: None,
            fused_embedding: None,
            fused_score: None,
            recognized_tag: None,
            state: FaceState::Detected,
        }
    }

    /// The detection this face was built from.
    pub fn detection(&self) -> Detection {
        Detection {
            bbox: self.bbox,
            score: self.score,
            landmarks: self.landmarks,
        }
    }

    pub fn advance(&mut self, next: FaceState) -> Result<(), FaceStateError> {
        if !self.state.can_transition_to(next) {
            return Err(FaceStateError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Apply an automatic match decision. Ignored once a human has resolved the face.
    pub fn record_match(&mut self, outcome: &MatchOutcome) -> Result<(), FaceStateError> {
        if self.state == FaceState::ManuallyResolved {
            return Ok(());
        }
        match outcome {
            MatchOutcome::Matched { tag, .. } => {
                self.advance(FaceState::Matched)?;
                self.recognized_tag = Some(tag.clone());
            }
            MatchOutcome::Ambiguous { .. } | MatchOutcome::Unmatched { .. } => {
                self.advance(FaceState::Unmatched)?;
                self.recognized_tag = None;
            }
        }
        self.fused_score = outcome.best_similarity();
        Ok(())
    }

    /// Human override; authoritative over automatic matching.
    pub fn resolve_manually(&mut self, tag: Option<TagId>) {
        self.recognized_tag = tag;
        self.state = FaceState::ManuallyResolved;
    }
}

/// Durable, per-tag representative embedding used as a recognition target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub id: Uuid,
    pub tag: TagId,
    pub event: EventId,
    pub embedding: Embedding,
    pub source_face: FaceId,
    pub created_at: DateTime<Utc>,
}
