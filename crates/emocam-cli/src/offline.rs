//! Offline runs of the detection pipeline: single images and dataset evaluation.

use emocam_core::dataset::Dataset;
use emocam_core::types::NUM_EMOTIONS;
use emocam_core::{
    classify_regions, BufferTracker, Emotion, EmotionClassifier, FaceLocalizer, FrameDetections,
    RegionPreprocessor,
};
use image::RgbImage;

/// Run one detection cycle over a decoded image.
///
/// Regions that fall outside the image, are undetectable, or fail
/// classification are left out of the result.
pub fn detect_image(
    image: &RgbImage,
    localizer: &mut dyn FaceLocalizer,
    classifier: &mut dyn EmotionClassifier,
    preprocessor: &RegionPreprocessor,
    padding: f32,
) -> anyhow::Result<FrameDetections> {
    let (width, height) = image.dimensions();
    let rgb = image.as_raw();
    let faces = localizer.locate(rgb, width, height)?;

    let classified = classify_regions(rgb, width, height, &faces, padding, preprocessor, classifier);
    tracing::debug!(
        faces = faces.len(),
        classified = classified.results.len(),
        skipped = classified.skipped,
        failed = classified.failed,
        "image processed"
    );

    Ok(FrameDetections {
        sequence: 1,
        width,
        height,
        results: classified.results,
    })
}

/// Per-class hit counts for a labeled evaluation run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Tally {
    pub correct: [usize; NUM_EMOTIONS],
    pub total: [usize; NUM_EMOTIONS],
    pub failed: usize,
}

impl Tally {
    pub fn record(&mut self, expected: Emotion, predicted: Emotion) {
        self.total[expected.index()] += 1;
        if expected == predicted {
            self.correct[expected.index()] += 1;
        }
    }

    pub fn evaluated(&self) -> usize {
        self.total.iter().sum()
    }

    /// Overall accuracy in [0, 1]; zero when nothing was evaluated.
    pub fn accuracy(&self) -> f32 {
        ratio(self.correct.iter().sum(), self.evaluated())
    }

    pub fn class_accuracy(&self, emotion: Emotion) -> Option<f32> {
        let total = self.total[emotion.index()];
        (total > 0).then(|| ratio(self.correct[emotion.index()], total))
    }
}

fn ratio(numerator: usize, denominator: usize) -> f32 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f32 / denominator as f32
    }
}

/// Classify up to `limit` samples and tally predictions against labels.
pub fn evaluate(
    dataset: &Dataset,
    classifier: &mut dyn EmotionClassifier,
    tracker: &BufferTracker,
    limit: Option<usize>,
) -> Tally {
    let count = limit.map_or(dataset.len(), |n| n.min(dataset.len()));
    let mut tally = Tally::default();

    for index in 0..count {
        let Some(tile) = dataset.tile(index, tracker) else {
            tally.failed += 1;
            continue;
        };
        match classifier.classify(&tile) {
            Ok(scores) => tally.record(dataset.samples[index].label, scores.dominant().0),
            Err(e) => {
                tracing::warn!(sample = index, error = %e, "classification failed");
                tally.failed += 1;
            }
        }
    }

    tally
}

#[cfg(test)]
mod tests {
    use super::*;
    use emocam_core::classifier::ClassifierError;
    use emocam_core::dataset::Sample;
    use emocam_core::localizer::LocalizerError;
    use emocam_core::{EmotionScores, FaceCorners, NormalizedTile, TILE_SIZE};

    /// Bright tiles are Happy, dark tiles are Sad.
    struct BrightnessClassifier;

    impl EmotionClassifier for BrightnessClassifier {
        fn classify(&mut self, tile: &NormalizedTile) -> Result<EmotionScores, ClassifierError> {
            let mean = tile.values().sum::<f32>() / (TILE_SIZE * TILE_SIZE) as f32;
            let mut raw = [0.0f32; NUM_EMOTIONS];
            raw[Emotion::Happy.index()] = mean;
            raw[Emotion::Sad.index()] = 1.0 - mean;
            Ok(EmotionScores::from_model_output(&raw)?)
        }
    }

    struct FixedLocalizer(Vec<FaceCorners>);

    impl FaceLocalizer for FixedLocalizer {
        fn locate(&mut self, _rgb: &[u8], _w: u32, _h: u32) -> Result<Vec<FaceCorners>, LocalizerError> {
            Ok(self.0.clone())
        }
    }

    fn sample(label: Emotion, value: u8) -> Sample {
        Sample {
            label,
            pixels: vec![value; TILE_SIZE * TILE_SIZE],
        }
    }

    #[test]
    fn test_detect_image_bright_face() {
        let image = RgbImage::from_pixel(100, 100, image::Rgb([240, 240, 240]));
        let mut localizer = FixedLocalizer(vec![
            FaceCorners {
                top_left: (30.0, 30.0),
                bottom_right: (60.0, 60.0),
                confidence: 0.9,
            },
            FaceCorners {
                top_left: (150.0, 150.0),
                bottom_right: (190.0, 190.0),
                confidence: 0.8,
            },
        ]);
        let tracker = BufferTracker::new();
        let preprocessor = RegionPreprocessor::new(tracker.clone());

        let detections =
            detect_image(&image, &mut localizer, &mut BrightnessClassifier, &preprocessor, 20.0).unwrap();

        assert_eq!((detections.width, detections.height), (100, 100));
        assert_eq!(detections.results.len(), 1);
        assert_eq!(detections.results[0].dominant.0, Emotion::Happy);
        assert_eq!(detections.results[0].region.width, 50.0);
        assert_eq!(tracker.live(), 0);
    }

    #[test]
    fn test_evaluate_tallies_per_class() {
        let dataset = Dataset {
            split: "PublicTest".into(),
            samples: vec![
                sample(Emotion::Happy, 250),
                sample(Emotion::Happy, 10),
                sample(Emotion::Sad, 5),
                sample(Emotion::Angry, 5),
            ],
            skipped: 0,
        };
        let tracker = BufferTracker::new();
        let tally = evaluate(&dataset, &mut BrightnessClassifier, &tracker, None);

        assert_eq!(tally.evaluated(), 4);
        assert_eq!(tally.accuracy(), 0.5);
        assert_eq!(tally.class_accuracy(Emotion::Happy), Some(0.5));
        assert_eq!(tally.class_accuracy(Emotion::Sad), Some(1.0));
        assert_eq!(tally.class_accuracy(Emotion::Angry), Some(0.0));
        assert_eq!(tally.class_accuracy(Emotion::Fear), None);
        assert_eq!(tracker.live(), 0);
    }

    #[test]
    fn test_evaluate_respects_limit() {
        let dataset = Dataset {
            split: "PublicTest".into(),
            samples: vec![sample(Emotion::Happy, 250); 5],
            skipped: 0,
        };
        let tally = evaluate(&dataset, &mut BrightnessClassifier, &BufferTracker::new(), Some(2));
        assert_eq!(tally.evaluated(), 2);
        assert_eq!(tally.accuracy(), 1.0);
    }

    #[test]
    fn test_empty_tally() {
        let tally = Tally::default();
        assert_eq!(tally.accuracy(), 0.0);
        assert_eq!(tally.evaluated(), 0);
    }
}
