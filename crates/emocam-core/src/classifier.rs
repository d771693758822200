//! Emotion classification.
//!
//! [`EmotionClassifier`] is a stateless scoring function: a 48×48×1 tile in,
//! a 7-way distribution out. [`OnnxEmotionClassifier`] runs an exported
//! convolutional network via ONNX Runtime.

use crate::preprocess::{NormalizedTile, TILE_SIZE};
use crate::types::{EmotionScores, ScoresError, NUM_EMOTIONS};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("unexpected model layout: {0}")]
    ModelLayout(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("malformed scores: {0}")]
    Scores(#[from] ScoresError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scores one normalized face tile against the seven emotion classes.
pub trait EmotionClassifier {
    fn classify(&mut self, tile: &NormalizedTile) -> Result<EmotionScores, ClassifierError>;
}

/// Emotion classifier backed by an ONNX export of the trained network.
///
/// Input `[1, 48, 48, 1]` (NHWC, values in [0, 1]); output 7 class scores.
pub struct OnnxEmotionClassifier {
    session: Session,
}

impl OnnxEmotionClassifier {
    /// Load the classifier from the given path.
    pub fn load(model_path: &Path) -> Result<Self, ClassifierError> {
        if !model_path.exists() {
            return Err(ClassifierError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        if session.inputs().len() != 1 || session.outputs().is_empty() {
            return Err(ClassifierError::ModelLayout(format!(
                "expected 1 input and at least 1 output, got {} and {}",
                session.inputs().len(),
                session.outputs().len()
            )));
        }

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            tile = TILE_SIZE,
            classes = NUM_EMOTIONS,
            "loaded emotion classifier"
        );

        Ok(Self { session })
    }
}

impl EmotionClassifier for OnnxEmotionClassifier {
    fn classify(&mut self, tile: &NormalizedTile) -> Result<EmotionScores, ClassifierError> {
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(tile.as_array().view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::InferenceFailed(format!("class scores: {e}")))?;

        Ok(EmotionScores::from_model_output(raw)?)
    }
}
