//! Face localization.
//!
//! [`FaceLocalizer`] is the black-box detection capability the capture loop
//! drives once per frame. [`ScrfdLocalizer`] implements it with an SCRFD
//! model via ONNX Runtime: letterboxed RGB input, anchor-free decoding over
//! three strides and NMS post-processing.

use crate::types::FaceCorners;
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgb};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum LocalizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("unexpected model layout: {0}")]
    ModelLayout(String),
    #[error("invalid frame: expected {expected} RGB bytes, got {actual}")]
    InvalidFrame { expected: usize, actual: usize },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates faces in an RGB24 frame.
pub trait FaceLocalizer {
    /// Return face corners in frame pixel coordinates, in detection order.
    fn locate(&mut self, rgb: &[u8], width: u32, height: u32)
        -> Result<Vec<FaceCorners>, LocalizerError>;
}

/// Scale and padding applied when letterboxing a frame into the model input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
    scaled_width: u32,
    scaled_height: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, target: u32) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let scaled_width = ((width as f32 * scale).round() as u32).clamp(1, target);
        let scaled_height = ((height as f32 * scale).round() as u32).clamp(1, target);
        Self {
            scale,
            pad_x: (target - scaled_width) / 2,
            pad_y: (target - scaled_height) / 2,
            scaled_width,
            scaled_height,
        }
    }

    /// Map a point from model input space back to frame space.
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// SCRFD-based face localizer.
pub struct ScrfdLocalizer {
    session: Session,
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdLocalizer {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, LocalizerError> {
        if !model_path.exists() {
            return Err(LocalizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded SCRFD localizer"
        );

        if output_names.len() < 6 {
            return Err(LocalizerError::ModelLayout(format!(
                "SCRFD needs score and bbox outputs for 3 strides, got {} outputs",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            stride_indices,
        })
    }

    /// Letterbox an RGB frame into a BGR NCHW tensor normalized for SCRFD.
    fn preprocess(rgb: &[u8], width: u32, height: u32, letterbox: &Letterbox) -> Array4<f32> {
        let size = SCRFD_INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        let Some(view) = ImageBuffer::<Rgb<u8>, &[u8]>::from_raw(width, height, rgb) else {
            return tensor;
        };
        let scaled = imageops::resize(
            &view,
            letterbox.scaled_width,
            letterbox.scaled_height,
            FilterType::Triangle,
        );

        for (x, y, px) in scaled.enumerate_pixels() {
            let tx = (x + letterbox.pad_x) as usize;
            let ty = (y + letterbox.pad_y) as usize;
            let [r, g, b] = px.0;
            tensor[[0, 0, ty, tx]] = (b as f32 - SCRFD_MEAN) / SCRFD_STD;
            tensor[[0, 1, ty, tx]] = (g as f32 - SCRFD_MEAN) / SCRFD_STD;
            tensor[[0, 2, ty, tx]] = (r as f32 - SCRFD_MEAN) / SCRFD_STD;
        }

        tensor
    }
}

impl FaceLocalizer for ScrfdLocalizer {
    fn locate(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<FaceCorners>, LocalizerError> {
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }
        let expected = width as usize * height as usize * 3;
        if rgb.len() < expected {
            return Err(LocalizerError::InvalidFrame {
                expected,
                actual: rgb.len(),
            });
        }

        let letterbox = Letterbox::fit(width, height, SCRFD_INPUT_SIZE);
        let input = Self::preprocess(&rgb[..expected], width, height, &letterbox);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx].try_extract_tensor::<f32>().map_err(|e| {
                LocalizerError::InferenceFailed(format!("scores stride {stride}: {e}"))
            })?;
            let (_, bboxes) = outputs[bbox_idx].try_extract_tensor::<f32>().map_err(|e| {
                LocalizerError::InferenceFailed(format!("bboxes stride {stride}: {e}"))
            })?;

            candidates.extend(decode_stride(
                scores,
                bboxes,
                stride,
                &letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Map stride slots to output tensors, by name (`score_8`, `bbox_8`, ...) when
/// the export uses them, otherwise positionally: `[0-2]` scores, `[3-5]` boxes.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?)))
        .collect();

    match named {
        Some(found) => [found[0], found[1], found[2]],
        None => {
            tracing::debug!(?names, "SCRFD output names not recognized; using positional mapping");
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

/// Decode candidate boxes for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<FaceCorners> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut found = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }
        let Some(offsets) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_x = (cell % grid) as f32 * s;
        let anchor_y = (cell / grid) as f32 * s;

        let top_left = letterbox.to_frame(anchor_x - offsets[0] * s, anchor_y - offsets[1] * s);
        let bottom_right = letterbox.to_frame(anchor_x + offsets[2] * s, anchor_y + offsets[3] * s);

        found.push(FaceCorners {
            top_left,
            bottom_right,
            confidence: score,
        });
    }
    found
}

/// Non-Maximum Suppression; survivors are ordered by confidence, highest first.
fn nms(mut candidates: Vec<FaceCorners>, iou_threshold: f32) -> Vec<FaceCorners> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<FaceCorners> = Vec::new();
    for candidate in candidates {
        if keep.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &FaceCorners, b: &FaceCorners) -> f32 {
    let inter_w = (a.bottom_right.0.min(b.bottom_right.0) - a.top_left.0.max(b.top_left.0)).max(0.0);
    let inter_h = (a.bottom_right.1.min(b.bottom_right.1) - a.top_left.1.max(b.top_left.1)).max(0.0);
    let inter = inter_w * inter_h;

    let area = |c: &FaceCorners| {
        (c.bottom_right.0 - c.top_left.0).max(0.0) * (c.bottom_right.1 - c.top_left.1).max(0.0)
    };
    let union = area(a) + area(b) - inter;

    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corners(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> FaceCorners {
        FaceCorners {
            top_left: (x1, y1),
            bottom_right: (x2, y2),
            confidence,
        }
    }

    #[test]
    fn test_iou_identical() {
        let a = corners(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = corners(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = corners(20.0, 20.0, 30.0, 30.0, 1.0);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn test_iou_half_overlap() {
        let a = corners(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = corners(5.0, 0.0, 15.0, 10.0, 1.0);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_best_of_overlapping() {
        let result = nms(
            vec![
                corners(5.0, 5.0, 105.0, 105.0, 0.8),
                corners(200.0, 200.0, 250.0, 250.0, 0.7),
                corners(0.0, 0.0, 100.0, 100.0, 0.9),
            ],
            0.4,
        );
        let confidences: Vec<f32> = result.iter().map(|c| c.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.7]);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(Vec::new(), 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_landscape() {
        let lb = Letterbox::fit(640, 480, 640);
        assert_eq!(lb.scale, 1.0);
        assert_eq!((lb.scaled_width, lb.scaled_height), (640, 480));
        assert_eq!((lb.pad_x, lb.pad_y), (0, 80));
        assert_eq!(lb.to_frame(100.0, 180.0), (100.0, 100.0));
    }

    #[test]
    fn test_letterbox_roundtrip_small_frame() {
        let lb = Letterbox::fit(320, 240, 640);
        let (fx, fy) = (100.0f32, 50.0f32);
        let mapped = (fx * lb.scale + lb.pad_x as f32, fy * lb.scale + lb.pad_y as f32);
        let (rx, ry) = lb.to_frame(mapped.0, mapped.1);
        assert!((rx - fx).abs() < 0.1 && (ry - fy).abs() < 0.1);
    }

    #[test]
    fn test_decode_stride_single_anchor() {
        let lb = Letterbox::fit(640, 640, 640);
        let grid = 640 / 32;
        let mut scores = vec![0.0f32; grid * grid * 2];
        let mut bboxes = vec![0.0f32; grid * grid * 2 * 4];
        // anchor cell (row 2, col 3), first anchor
        let idx = (2 * grid + 3) * 2;
        scores[idx] = 0.9;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 2.0, 2.0]);

        let found = decode_stride(&scores, &bboxes, 32, &lb, 0.5);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].top_left, (96.0 - 32.0, 64.0 - 32.0));
        assert_eq!(found[0].bottom_right, (96.0 + 64.0, 64.0 + 64.0));
    }

    #[test]
    fn test_preprocess_pads_with_zero() {
        let lb = Letterbox::fit(64, 32, SCRFD_INPUT_SIZE);
        let rgb = vec![255u8; 64 * 32 * 3];
        let tensor = ScrfdLocalizer::preprocess(&rgb, 64, 32, &lb);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        let center = tensor[[0, 1, 320, 320]];
        assert!((center - (255.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-5);
    }

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = [
            "bbox_8", "score_8", "bbox_16", "score_16", "bbox_32", "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(discover_output_indices(&names), [(1, 0), (3, 2), (5, 4)]);
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_output_indices(&names), [(0, 3), (1, 4), (2, 5)]);
    }
}
