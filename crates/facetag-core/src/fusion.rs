//! Fusion of identity and appearance embeddings into one comparable vector.
//!
//! `WeightedConcat` scales each unit block by the square root of its weight
//! before concatenating and renormalizing, so the cosine of two fused vectors
//! is the weighted mean of the per-block cosines.

use crate::config::ConfigError;
use crate::types::Embedding;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionPolicy {
    WeightedConcat,
    IdentityOnly,
}

impl FusionPolicy {
    fn name(self) -> &'static str {
        match self {
            FusionPolicy::WeightedConcat => "weighted_concat",
            FusionPolicy::IdentityOnly => "identity_only",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub policy: FusionPolicy,
    pub identity_weight: f32,
    pub appearance_weight: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            policy: FusionPolicy::WeightedConcat,
            identity_weight: 0.8,
            appearance_weight: 0.2,
        }
    }
}

impl FusionConfig {
    /// Version string stored on fused embeddings; vectors from different
    /// versions are never compared.
    pub fn version(&self) -> String {
        match self.policy {
            FusionPolicy::IdentityOnly => format!("{}/v1", self.policy.name()),
            FusionPolicy::WeightedConcat => format!(
                "{}/v1:{:.3}:{:.3}",
                self.policy.name(),
                self.identity_weight,
                self.appearance_weight
            ),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let (wi, wa) = (self.identity_weight, self.appearance_weight);
        if !(wi.is_finite() && wa.is_finite()) || wi <= 0.0 || wa < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "fusion weights must be finite with identity > 0 and appearance >= 0, got {wi}/{wa}"
            )));
        }
        // The version string carries three decimals; finer weights would
        // share a version with vectors fused differently.
        if !(on_version_grid(wi) && on_version_grid(wa)) {
            return Err(ConfigError::Invalid(format!(
                "fusion weights must have at most 3 decimals, got {wi}/{wa}"
            )));
        }
        Ok(())
    }

    /// Fuse per-face embeddings. No identity embedding means no fused vector.
    ///
    /// A missing appearance embedding contributes a zero block, which lowers
    /// the achievable similarity against gallery entries that have one.
    pub fn fuse(
        &self,
        identity: Option<&Embedding>,
        appearance: Option<&Embedding>,
        appearance_dim: usize,
    ) -> Option<Embedding> {
        let identity = identity?;
        match self.policy {
            FusionPolicy::IdentityOnly => {
                Embedding::normalized(identity.values.clone(), self.version())
            }
            FusionPolicy::WeightedConcat => {
                let si = self.identity_weight.sqrt();
                let sa = self.appearance_weight.sqrt();
                let mut values = Vec::with_capacity(identity.dim() + appearance_dim);
                values.extend(identity.values.iter().map(|v| v * si));
                match appearance {
                    Some(app) if app.dim() == appearance_dim => {
                        values.extend(app.values.iter().map(|v| v * sa))
                    }
                    _ => values.resize(identity.dim() + appearance_dim, 0.0),
                }
                Embedding::normalized(values, self.version())
            }
        }
    }
}

fn on_version_grid(weight: f32) -> bool {
    let scaled = f64::from(weight) * 1000.0;
    (scaled - scaled.round()).abs() < 1e-3
}
