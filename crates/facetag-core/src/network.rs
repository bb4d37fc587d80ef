//! Inference seams: the detector and embedding networks are opaque functions
//! from an input tensor to output tensors. `OnnxModel` backs both with ONNX
//! Runtime; tests substitute synthetic implementations.

use crate::detector::DetectorError;
use crate::recognizer::RecognizerError;
use ndarray::ArrayView4;
use ort::session::Session;
use ort::value::TensorRef;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// One raw output tensor copied out of the inference runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl HeadTensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self { shape, data }
    }
}

/// Detector outputs keyed by tensor name.
#[derive(Debug, Clone, Default)]
pub struct HeadOutputs {
    tensors: HashMap<String, HeadTensor>,
}

impl HeadOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: HeadTensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&HeadTensor> {
        self.tensors.get(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

/// Multi-head face detector network: letterboxed NCHW canvas in, named head tensors out.
pub trait DetectorNetwork: Send + Sync {
    fn infer(&self, input: ArrayView4<'_, f32>) -> Result<HeadOutputs, DetectorError>;

    /// Names of the tensors the network produces, when known up front.
    fn output_names(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Embedding network: preprocessed NCHW crop in, raw (unnormalized) vector out.
pub trait EmbeddingNetwork: Send + Sync {
    fn embed(&self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>, RecognizerError>;
}

/// ONNX Runtime session shared across worker threads.
///
/// `Session::run` needs exclusive access, so calls are serialized per model.
pub struct OnnxModel {
    session: Mutex<Session>,
    path: String,
    output_names: Vec<String>,
}

impl OnnxModel {
    pub fn load(model_path: &str, intra_threads: usize) -> Result<Self, ort::Error> {
        let session = Session::builder()?
            .with_intra_threads(intra_threads.max(1))?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded ONNX model"
        );

        Ok(Self {
            session: Mutex::new(session),
            path: model_path.to_string(),
            output_names,
        })
    }

    pub fn exists(model_path: &str) -> bool {
        Path::new(model_path).exists()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn run_all(&self, input: ArrayView4<'_, f32>) -> Result<Vec<HeadTensor>, String> {
        let mut session = self
            .session
            .lock()
            .map_err(|e| format!("session lock poisoned: {e}"))?;
        let tensor = TensorRef::from_array_view(input).map_err(|e| e.to_string())?;
        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(|e| e.to_string())?;

        let extracted: Result<Vec<HeadTensor>, String> = self
            .output_names
            .iter()
            .map(|name| {
                let value = outputs
                    .get(name.as_str())
                    .ok_or_else(|| format!("missing output {name}"))?;
                let (shape, data) = value
                    .try_extract_tensor::<f32>()
                    .map_err(|e| format!("{name}: {e}"))?;
                Ok(HeadTensor {
                    shape: shape.iter().map(|&d| d.max(0) as usize).collect(),
                    data: data.to_vec(),
                })
            })
            .collect();
        extracted
    }
}

impl DetectorNetwork for OnnxModel {
    fn infer(&self, input: ArrayView4<'_, f32>) -> Result<HeadOutputs, DetectorError> {
        let tensors = self.run_all(input).map_err(DetectorError::InferenceFailed)?;
        let mut outputs = HeadOutputs::new();
        for (name, tensor) in self.output_names.iter().zip(tensors) {
            outputs.insert(name.clone(), tensor);
        }
        Ok(outputs)
    }

    fn output_names(&self) -> Vec<String> {
        self.output_names.clone()
    }
}

impl EmbeddingNetwork for OnnxModel {
    fn embed(&self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>, RecognizerError> {
        let mut tensors = self.run_all(input).map_err(RecognizerError::InferenceFailed)?;
        if tensors.is_empty() {
            return Err(RecognizerError::InferenceFailed("model has no outputs".into()));
        }
        Ok(tensors.swap_remove(0).data)
    }
}
