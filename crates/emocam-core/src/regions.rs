//! Per-frame region loop: clip → prepare → classify.

use crate::classifier::EmotionClassifier;
use crate::preprocess::RegionPreprocessor;
use crate::types::{DetectionResult, FaceCorners, FaceRegion};

/// Results for one frame plus counts of regions that produced none.
#[derive(Debug, Default)]
pub struct ClassifiedRegions {
    /// Classified faces, in localizer order.
    pub results: Vec<DetectionResult>,
    /// Regions off-frame or too small to sample.
    pub skipped: usize,
    /// Regions whose classification failed.
    pub failed: usize,
}

/// Classify every localized face in an RGB frame.
///
/// A region that falls outside the frame, cannot be sampled, or fails
/// classification is left out; the rest of the frame is unaffected.
pub fn classify_regions<C>(
    rgb: &[u8],
    width: u32,
    height: u32,
    faces: &[FaceCorners],
    padding: f32,
    preprocessor: &RegionPreprocessor,
    classifier: &mut C,
) -> ClassifiedRegions
where
    C: EmotionClassifier + ?Sized,
{
    let mut out = ClassifiedRegions {
        results: Vec::with_capacity(faces.len()),
        ..ClassifiedRegions::default()
    };

    for (index, face) in faces.iter().enumerate() {
        let Some(region) = FaceRegion::from_corners(face, padding).clip_to(width, height) else {
            tracing::debug!(region = index, "face region outside frame; skipped");
            out.skipped += 1;
            continue;
        };

        let Some(tile) = preprocessor.prepare(rgb, width, height, &region) else {
            tracing::debug!(region = index, "region undetectable; skipped");
            out.skipped += 1;
            continue;
        };

        match classifier.classify(&tile) {
            Ok(scores) => out.results.push(DetectionResult::new(region, scores)),
            Err(e) => {
                tracing::warn!(region = index, error = %e, "classification failed; region skipped");
                out.failed += 1;
            }
        }
    }

    out
}
