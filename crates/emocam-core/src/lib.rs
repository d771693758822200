//! emocam-core: Face localization, region preprocessing and emotion classification.
//!
//! Uses SCRFD for face localization and a 48×48 grayscale CNN for emotion
//! classification, both running via ONNX Runtime for CPU inference.

pub mod buffers;
pub mod classifier;
pub mod dataset;
pub mod localizer;
pub mod overlay;
pub mod preprocess;
pub mod regions;
pub mod types;

pub use buffers::{BufferTracker, TrackedBuffer};
pub use classifier::{EmotionClassifier, OnnxEmotionClassifier};
pub use localizer::{FaceLocalizer, ScrfdLocalizer};
pub use preprocess::{NormalizedTile, RegionPreprocessor, TILE_SIZE};
pub use regions::{classify_regions, ClassifiedRegions};
pub use types::{DetectionResult, Emotion, EmotionScores, FaceCorners, FaceRegion, FrameDetections};

/// Default directory for the bundled ONNX models.
pub fn default_model_dir() -> std::path::PathBuf {
    std::env::var("EMOCAM_MODEL_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("/usr/share/emocam/models"))
}
