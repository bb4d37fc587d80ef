//! facetag-engine — Runs the face pipeline for many photos at once.
//!
//! Inference is confined to a pool of worker threads sharing lazily loaded
//! models; async callers submit photos and await results under a per-photo
//! deadline. Gallery maintenance runs as its own task.

pub mod config;
pub mod engine;
pub mod maintainer;
pub mod model_handle;

pub use config::EngineConfig;
pub use engine::{DetectionStatus, Engine, EngineError, PhotoAnalysis};
pub use maintainer::{spawn_maintainer, MaintainerHandle, MaintainerStats};
pub use model_handle::ModelHandle;
