//! Pipeline configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config.

use crate::appearance::BodyCrop;
use crate::fusion::FusionConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("unknown detector variant: {0}")]
    UnknownVariant(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub detector_variant: String,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    /// Candidates kept after the score sort, before suppression.
    pub max_detections: usize,
    pub min_crop_px: u32,
    pub body_crop: BodyCrop,
    pub fusion: FusionConfig,
    pub match_threshold: f32,
    pub ambiguity_margin: f32,
    pub gallery_capacity: usize,
    pub outlier_threshold: f32,
    /// Automatic matches at or above this similarity are fed back into the gallery.
    pub auto_enroll_threshold: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detector_variant: "scrfd_10g_bnkps".into(),
            confidence_threshold: 0.3,
            nms_threshold: 0.4,
            max_detections: 150,
            min_crop_px: 8,
            body_crop: BodyCrop::default(),
            fusion: FusionConfig::default(),
            match_threshold: 0.6,
            ambiguity_margin: 0.02,
            gallery_capacity: 20,
            outlier_threshold: 0.3,
            auto_enroll_threshold: 0.75,
        }
    }
}

fn check_range(name: &str, value: f32, lo: f32, hi: f32) -> Result<(), ConfigError> {
    if !(lo..=hi).contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} = {value} is outside [{lo}, {hi}]"
        )));
    }
    Ok(())
}

impl PipelineConfig {
    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(src)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let src = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&src)?;
        tracing::info!(path = %path.display(), variant = %config.detector_variant, "loaded pipeline config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("confidence_threshold", self.confidence_threshold, 0.0, 1.0)?;
        check_range("nms_threshold", self.nms_threshold, 0.0, 1.0)?;
        check_range("match_threshold", self.match_threshold, -1.0, 1.0)?;
        check_range("ambiguity_margin", self.ambiguity_margin, 0.0, 2.0)?;
        check_range("outlier_threshold", self.outlier_threshold, -1.0, 1.0)?;
        check_range("auto_enroll_threshold", self.auto_enroll_threshold, -1.0, 1.0)?;

        if self.max_detections == 0 {
            return Err(ConfigError::Invalid("max_detections must be at least 1".into()));
        }
        if self.gallery_capacity == 0 {
            return Err(ConfigError::Invalid("gallery_capacity must be at least 1".into()));
        }
        self.body_crop.validate()?;
        self.fusion.validate()?;
        Ok(())
    }
}
