use facetag_core::{ConfigError, PipelineConfig, VariantRegistry};
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Detector model file name inside `model_dir`.
    pub detector_model: String,
    /// ArcFace model file name inside `model_dir`.
    pub identity_model: String,
    /// Appearance model file name; faces get no appearance embedding if it is absent.
    pub appearance_model: String,
    /// Inference worker threads.
    pub worker_threads: usize,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
    /// Per-photo detection budget in milliseconds.
    pub detection_timeout_ms: u64,
    /// Per-photo embedding budget in milliseconds.
    pub embedding_timeout_ms: u64,
    /// Optional pipeline TOML file.
    pub pipeline_config: Option<PathBuf>,
    /// Optional TOML file with extra detector variants.
    pub variants_file: Option<PathBuf>,
    /// Overrides applied on top of the pipeline file.
    pub detector_variant: Option<String>,
    pub match_threshold: Option<f32>,
}

pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facetag/models")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            detector_model: "det_10g.onnx".into(),
            identity_model: "w600k_r50.onnx".into(),
            appearance_model: "osnet_x1_0.onnx".into(),
            worker_threads: 2,
            intra_threads: 2,
            detection_timeout_ms: 10_000,
            embedding_timeout_ms: 10_000,
            pipeline_config: None,
            variants_file: None,
            detector_variant: None,
            match_threshold: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `FACETAG_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            model_dir: std::env::var("FACETAG_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_dir),
            detector_model: env_string("FACETAG_DETECTOR_MODEL", defaults.detector_model),
            identity_model: env_string("FACETAG_IDENTITY_MODEL", defaults.identity_model),
            appearance_model: env_string("FACETAG_APPEARANCE_MODEL", defaults.appearance_model),
            worker_threads: env_usize("FACETAG_WORKER_THREADS", defaults.worker_threads).max(1),
            intra_threads: env_usize("FACETAG_INTRA_THREADS", defaults.intra_threads).max(1),
            detection_timeout_ms: env_u64("FACETAG_DETECTION_TIMEOUT_MS", defaults.detection_timeout_ms),
            embedding_timeout_ms: env_u64("FACETAG_EMBEDDING_TIMEOUT_MS", defaults.embedding_timeout_ms),
            pipeline_config: std::env::var("FACETAG_PIPELINE_CONFIG").ok().map(PathBuf::from),
            variants_file: std::env::var("FACETAG_VARIANTS").ok().map(PathBuf::from),
            detector_variant: std::env::var("FACETAG_DETECTOR_VARIANT").ok(),
            match_threshold: std::env::var("FACETAG_MATCH_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }

    fn model_path(&self, file: &str) -> String {
        self.model_dir.join(file).to_string_lossy().into_owned()
    }

    pub fn detector_model_path(&self) -> String {
        self.model_path(&self.detector_model)
    }

    pub fn identity_model_path(&self) -> String {
        self.model_path(&self.identity_model)
    }

    pub fn appearance_model_path(&self) -> String {
        self.model_path(&self.appearance_model)
    }

    pub fn detection_timeout(&self) -> Duration {
        Duration::from_millis(self.detection_timeout_ms)
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_millis(self.embedding_timeout_ms)
    }

    /// Pipeline settings: the TOML file if configured, else defaults, with
    /// environment overrides applied and validated.
    pub fn load_pipeline(&self) -> Result<PipelineConfig, ConfigError> {
        let mut pipeline = match &self.pipeline_config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(variant) = &self.detector_variant {
            pipeline.detector_variant = variant.clone();
        }
        if let Some(threshold) = self.match_threshold {
            pipeline.match_threshold = threshold;
        }
        pipeline.validate()?;
        Ok(pipeline)
    }

    /// Built-in detector variants plus any from the variants file.
    pub fn load_variants(&self) -> Result<VariantRegistry, ConfigError> {
        let mut registry = VariantRegistry::builtin();
        if let Some(path) = &self.variants_file {
            let added = registry.extend_from_file(path)?;
            tracing::info!(path = %path.display(), added, "loaded detector variants");
        }
        Ok(registry)
    }
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
