use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// Number of emotion classes produced by the classifier.
pub const NUM_EMOTIONS: usize = 7;

/// Allowed deviation of a probability sum from 1.0.
pub const DISTRIBUTION_TOLERANCE: f32 = 1e-3;

/// Emotion categories, in the fixed order of the classifier's output vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Emotion {
    Angry,
    Disgust,
    Fear,
    Happy,
    Sad,
    Surprise,
    Neutral,
}

impl Emotion {
    /// All labels in output-vector order. Tie-breaks scan this left to right.
    pub const ALL: [Emotion; NUM_EMOTIONS] = [
        Emotion::Angry,
        Emotion::Disgust,
        Emotion::Fear,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Surprise,
        Emotion::Neutral,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn label(self) -> &'static str {
        match self {
            Emotion::Angry => "Angry",
            Emotion::Disgust => "Disgust",
            Emotion::Fear => "Fear",
            Emotion::Happy => "Happy",
            Emotion::Sad => "Sad",
            Emotion::Surprise => "Surprise",
            Emotion::Neutral => "Neutral",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Raw localizer output: opposite corners of a face box in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceCorners {
    pub top_left: (f32, f32),
    pub bottom_right: (f32, f32),
    pub confidence: f32,
}

/// Axis-aligned face box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl FaceRegion {
    /// Build a region from localizer corners, widening both axes by `padding`
    /// pixels to absorb localization undershoot.
    pub fn from_corners(corners: &FaceCorners, padding: f32) -> Self {
        let (x1, y1) = corners.top_left;
        let (x2, y2) = corners.bottom_right;
        Self {
            x: x1,
            y: y1,
            width: x2 - x1 + padding,
            height: y2 - y1 + padding,
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    /// True if all coordinates are finite and the box has positive area.
    pub fn is_valid(&self) -> bool {
        [self.x, self.y, self.width, self.height]
            .iter()
            .all(|v| v.is_finite())
            && self.width > 0.0
            && self.height > 0.0
    }

    /// Intersect with a `frame_width` × `frame_height` frame.
    ///
    /// Returns `None` if the region is non-finite or does not overlap the frame.
    pub fn clip_to(&self, frame_width: u32, frame_height: u32) -> Option<Self> {
        if !self.is_valid() {
            return None;
        }
        let x1 = self.x.max(0.0);
        let y1 = self.y.max(0.0);
        let x2 = self.right().min(frame_width as f32);
        let y2 = self.bottom().min(frame_height as f32);

        let clipped = Self {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        };
        clipped.is_valid().then_some(clipped)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScoresError {
    #[error("expected {expected} class scores, got {actual}")]
    WrongLength { expected: usize, actual: usize },
    #[error("non-finite score at index {0}")]
    NonFinite(usize),
}

/// Probability per emotion, indexed in [`Emotion::ALL`] order.
///
/// Always a valid distribution: every entry in [0, 1], summing to 1 within
/// [`DISTRIBUTION_TOLERANCE`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmotionScores([f32; NUM_EMOTIONS]);

impl EmotionScores {
    /// Validate a raw classifier output vector.
    ///
    /// Values that already form a probability distribution are kept as-is.
    /// Probabilities whose sum drifts from 1 are rescaled by their sum,
    /// keeping their ratios. Anything outside [0, 1] is treated as logits
    /// and normalized with softmax.
    pub fn from_model_output(raw: &[f32]) -> Result<Self, ScoresError> {
        if raw.len() != NUM_EMOTIONS {
            return Err(ScoresError::WrongLength {
                expected: NUM_EMOTIONS,
                actual: raw.len(),
            });
        }
        if let Some(idx) = raw.iter().position(|v| !v.is_finite()) {
            return Err(ScoresError::NonFinite(idx));
        }

        let mut values = [0.0f32; NUM_EMOTIONS];
        values.copy_from_slice(raw);

        if is_distribution(&values) {
            Ok(Self(values))
        } else if let Some(total) = probability_mass(&values) {
            tracing::trace!(?values, total, "classifier probabilities rescaled");
            Ok(Self(values.map(|v| v / total)))
        } else {
            tracing::trace!(?values, "classifier output is not a distribution; applying softmax");
            Ok(Self(softmax(&values)))
        }
    }

    pub fn get(&self, emotion: Emotion) -> f32 {
        self.0[emotion.index()]
    }

    pub fn as_array(&self) -> &[f32; NUM_EMOTIONS] {
        &self.0
    }

    /// (emotion, probability) pairs in fixed label order.
    pub fn iter(&self) -> impl Iterator<Item = (Emotion, f32)> + '_ {
        Emotion::ALL.iter().map(move |&e| (e, self.0[e.index()]))
    }

    pub fn sum(&self) -> f32 {
        self.0.iter().sum()
    }

    /// The strictly maximal entry; on ties the first label in order wins.
    pub fn dominant(&self) -> (Emotion, f32) {
        let mut best = (Emotion::ALL[0], self.0[0]);
        for (emotion, p) in self.iter().skip(1) {
            if p > best.1 {
                best = (emotion, p);
            }
        }
        best
    }
}

impl Serialize for EmotionScores {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(NUM_EMOTIONS))?;
        for (emotion, p) in self.iter() {
            map.serialize_entry(emotion.label(), &p)?;
        }
        map.end()
    }
}

fn is_distribution(values: &[f32; NUM_EMOTIONS]) -> bool {
    values.iter().all(|&v| (0.0..=1.0).contains(&v))
        && (values.iter().sum::<f32>() - 1.0).abs() <= DISTRIBUTION_TOLERANCE
}

/// Sum of the values when all lie in [0, 1] and the sum is positive.
fn probability_mass(values: &[f32; NUM_EMOTIONS]) -> Option<f32> {
    let total: f32 = values.iter().sum();
    (values.iter().all(|&v| (0.0..=1.0).contains(&v)) && total > 0.0).then_some(total)
}

fn softmax(logits: &[f32; NUM_EMOTIONS]) -> [f32; NUM_EMOTIONS] {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut out = [0.0f32; NUM_EMOTIONS];
    let mut total = 0.0f32;
    for (o, &l) in out.iter_mut().zip(logits.iter()) {
        *o = (l - max).exp();
        total += *o;
    }
    for o in out.iter_mut() {
        *o /= total;
    }
    out
}

/// One classified face.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionResult {
    pub region: FaceRegion,
    pub scores: EmotionScores,
    pub dominant: (Emotion, f32),
}

impl DetectionResult {
    pub fn new(region: FaceRegion, scores: EmotionScores) -> Self {
        Self {
            region,
            dominant: scores.dominant(),
            scores,
        }
    }

    /// Overlay label, e.g. `"Happy (70.0%)"`.
    pub fn label(&self) -> String {
        let (emotion, p) = self.dominant;
        format!("{emotion} ({:.1}%)", p * 100.0)
    }
}

/// Detections published for a single frame. Each new value fully replaces the last.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FrameDetections {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub results: Vec<DetectionResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(values: [f32; NUM_EMOTIONS]) -> EmotionScores {
        EmotionScores::from_model_output(&values).unwrap()
    }

    #[test]
    fn test_emotion_order() {
        let labels: Vec<&str> = Emotion::ALL.iter().map(|e| e.label()).collect();
        assert_eq!(
            labels,
            ["Angry", "Disgust", "Fear", "Happy", "Sad", "Surprise", "Neutral"]
        );
        assert_eq!(Emotion::from_index(3), Some(Emotion::Happy));
        assert_eq!(Emotion::from_index(7), None);
    }

    #[test]
    fn test_region_from_corners_adds_padding() {
        let corners = FaceCorners {
            top_left: (10.0, 20.0),
            bottom_right: (50.0, 70.0),
            confidence: 0.9,
        };
        let region = FaceRegion::from_corners(&corners, 20.0);
        assert_eq!(region.x, 10.0);
        assert_eq!(region.y, 20.0);
        assert_eq!(region.width, 60.0);
        assert_eq!(region.height, 70.0);
    }

    #[test]
    fn test_clip_inside_frame_unchanged() {
        let region = FaceRegion { x: 10.0, y: 10.0, width: 20.0, height: 20.0 };
        assert_eq!(region.clip_to(100, 100), Some(region));
    }

    #[test]
    fn test_clip_overhanging_region() {
        let region = FaceRegion { x: -10.0, y: 90.0, width: 30.0, height: 30.0 };
        let clipped = region.clip_to(100, 100).unwrap();
        assert_eq!(clipped, FaceRegion { x: 0.0, y: 90.0, width: 20.0, height: 10.0 });
    }

    #[test]
    fn test_clip_outside_frame() {
        let region = FaceRegion { x: 120.0, y: 10.0, width: 20.0, height: 20.0 };
        assert!(region.clip_to(100, 100).is_none());
    }

    #[test]
    fn test_clip_rejects_non_finite_and_empty() {
        let nan = FaceRegion { x: f32::NAN, y: 0.0, width: 10.0, height: 10.0 };
        assert!(nan.clip_to(100, 100).is_none());
        let flat = FaceRegion { x: 0.0, y: 0.0, width: 0.0, height: 10.0 };
        assert!(flat.clip_to(100, 100).is_none());
        let any = FaceRegion { x: 0.0, y: 0.0, width: 10.0, height: 10.0 };
        assert!(any.clip_to(0, 0).is_none());
    }

    #[test]
    fn test_scores_keep_valid_distribution() {
        let s = scores([0.05, 0.02, 0.03, 0.70, 0.10, 0.05, 0.05]);
        assert_eq!(s.get(Emotion::Happy), 0.70);
        assert!((s.sum() - 1.0).abs() < DISTRIBUTION_TOLERANCE);
    }

    #[test]
    fn test_scores_rescale_drifted_probabilities() {
        // Sums to 0.99: the ratios survive, softmax would flatten Happy to ~24%.
        let s = scores([0.05, 0.02, 0.03, 0.70, 0.10, 0.05, 0.04]);
        assert!((s.sum() - 1.0).abs() < DISTRIBUTION_TOLERANCE);
        assert!((s.get(Emotion::Happy) - 0.70 / 0.99).abs() < 1e-5);
        assert!((s.get(Emotion::Angry) - 0.05 / 0.99).abs() < 1e-5);

        let result = DetectionResult::new(FaceRegion { x: 0.0, y: 0.0, width: 10.0, height: 10.0 }, s);
        assert_eq!(result.label(), "Happy (70.7%)");
    }

    #[test]
    fn test_scores_all_zero_falls_back_to_uniform() {
        let s = scores([0.0; NUM_EMOTIONS]);
        assert!((s.sum() - 1.0).abs() < DISTRIBUTION_TOLERANCE);
        assert_eq!(s.dominant().0, Emotion::Angry);
    }

    #[test]
    fn test_scores_softmax_for_logits() {
        let s = scores([2.0, -1.0, 0.5, 4.0, 0.0, 1.0, 3.0]);
        assert!((s.sum() - 1.0).abs() < DISTRIBUTION_TOLERANCE);
        assert!(s.iter().all(|(_, p)| (0.0..=1.0).contains(&p)));
        assert_eq!(s.dominant().0, Emotion::Happy);
    }

    #[test]
    fn test_scores_reject_wrong_length() {
        let err = EmotionScores::from_model_output(&[0.5, 0.5]).unwrap_err();
        assert_eq!(err, ScoresError::WrongLength { expected: 7, actual: 2 });
    }

    #[test]
    fn test_scores_reject_non_finite() {
        let err = EmotionScores::from_model_output(&[0.1, f32::NAN, 0.1, 0.1, 0.1, 0.1, 0.1])
            .unwrap_err();
        assert_eq!(err, ScoresError::NonFinite(1));
    }

    #[test]
    fn test_dominant_tie_takes_first_label() {
        let s = scores([0.1, 0.1, 0.3, 0.3, 0.1, 0.1, 0.0]);
        assert_eq!(s.dominant(), (Emotion::Fear, 0.3));
    }

    #[test]
    fn test_dominant_uniform_is_angry() {
        let p = 1.0 / 7.0;
        let s = scores([p; NUM_EMOTIONS]);
        assert_eq!(s.dominant().0, Emotion::Angry);
    }

    #[test]
    fn test_dominant_last_label() {
        let s = scores([0.0, 0.0, 0.0, 0.0, 0.0, 0.4, 0.6]);
        assert_eq!(s.dominant(), (Emotion::Neutral, 0.6));
    }

    #[test]
    fn test_detection_label_format() {
        let region = FaceRegion { x: 40.0, y: 40.0, width: 20.0, height: 20.0 };
        let result = DetectionResult::new(region, scores([0.05, 0.02, 0.03, 0.70, 0.10, 0.05, 0.05]));
        assert_eq!(result.dominant, (Emotion::Happy, 0.70));
        assert_eq!(result.label(), "Happy (70.0%)");
    }

    #[test]
    fn test_scores_serialize_in_label_order() {
        let s = scores([0.05, 0.02, 0.03, 0.70, 0.10, 0.05, 0.05]);
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.starts_with("{\"Angry\":0.05,\"Disgust\":0.02"));
        assert!(json.ends_with("\"Neutral\":0.05}"));
    }
}
