//! FaceNet-style face embedder via ONNX Runtime.
//!
//! Takes the preprocessed colour face crop, resizes it to 160×160 RGB, scales
//! pixels to [0, 1] and returns the raw 512-dimensional output vector.

use std::path::Path;
use std::sync::Mutex;

use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use thiserror::Error;

use crate::types::Embedding;

const FACENET_INPUT_SIZE: u32 = 160;
const FACENET_EMBEDDING_DIM: usize = 512;
const FACENET_MODEL_VERSION: &str = "facenet_vggface2";

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("empty face crop")]
    EmptyInput,
    #[error("embedder session lock poisoned")]
    Poisoned,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Deep identity embedding model.
pub trait FaceEmbedder: Send + Sync {
    fn embed(&self, face: &DynamicImage) -> Result<Embedding, EmbedderError>;

    fn name(&self) -> &str;
}

pub struct FaceNetEmbedder {
    session: Mutex<Session>,
}

impl FaceNetEmbedder {
    /// Load the embedding ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, EmbedderError> {
        if !model_path.exists() {
            return Err(EmbedderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded FaceNet model"
        );

        Ok(Self { session: Mutex::new(session) })
    }
}

impl FaceEmbedder for FaceNetEmbedder {
    fn embed(&self, face: &DynamicImage) -> Result<Embedding, EmbedderError> {
        if face.width() == 0 || face.height() == 0 {
            return Err(EmbedderError::EmptyInput);
        }
        let input = preprocess(&face.to_rgb8());

        let mut session = self.session.lock().map_err(|_| EmbedderError::Poisoned)?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != FACENET_EMBEDDING_DIM {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {FACENET_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(EmbedderError::InferenceFailed("non-finite embedding values".into()));
        }

        Ok(Embedding {
            values: raw.to_vec(),
            model_version: Some(FACENET_MODEL_VERSION.to_string()),
        })
    }

    fn name(&self) -> &str {
        FACENET_MODEL_VERSION
    }
}

/// RGB crop → 1×3×160×160 tensor in [0, 1].
fn preprocess(face: &RgbImage) -> Array4<f32> {
    let size = FACENET_INPUT_SIZE;
    let resized = image::imageops::resize(face, size, size, FilterType::Triangle);
    let mut tensor = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
    for (x, y, px) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = px.0[c] as f32 / 255.0;
        }
    }
    tensor
}
