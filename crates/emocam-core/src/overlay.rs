//! Overlay rendering: bounding boxes, dominant-emotion labels and
//! per-emotion probability bars drawn onto a frame-sized surface.

use crate::types::{DetectionResult, FaceRegion};
pub use ab_glyph::FontArc;
use ab_glyph::PxScale;
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::Path;
use thiserror::Error;

/// Straight (non-premultiplied) RGBA color.
pub type Color = [u8; 4];

pub const YELLOW: Color = [255, 255, 0, 255];
const LABEL_PLATE: Color = [0, 0, 0, 128];
const BAR_TRACK: Color = [85, 85, 85, 255];
const BAR_FILL: Color = [76, 175, 80, 255];
const PANEL_BACKGROUND: Color = [0, 0, 0, 179];
const WHITE: Color = [255, 255, 255, 255];

#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("failed to read font {path}: {source}")]
    FontRead {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid font file: {0}")]
    InvalidFont(String),
}

/// A drawing target sized to the frame. Coordinates are frame pixels.
pub trait OverlaySurface {
    fn size(&self) -> (u32, u32);
    fn clear(&mut self);
    fn stroke_rect(&mut self, rect: &FaceRegion, color: Color, line_width: u32);
    fn fill_rect(&mut self, rect: &FaceRegion, color: Color);
    /// Draw `text` with its top-left corner at (`x`, `y`).
    fn fill_text(&mut self, text: &str, x: f32, y: f32, color: Color);
    fn text_width(&self, text: &str) -> f32;
}

#[derive(Debug, Clone)]
pub struct OverlayStyle {
    pub box_color: Color,
    pub line_width: u32,
    pub font_px: f32,
    pub label_height: f32,
    /// Draw the per-emotion probability panel beside each face.
    pub probability_bars: bool,
    pub bar_width: f32,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            box_color: YELLOW,
            line_width: 2,
            font_px: 16.0,
            label_height: 20.0,
            probability_bars: false,
            bar_width: 120.0,
        }
    }
}

/// Clear `surface` and draw every detection onto it.
pub fn render_overlay<S: OverlaySurface + ?Sized>(
    surface: &mut S,
    results: &[DetectionResult],
    style: &OverlayStyle,
) {
    surface.clear();

    for result in results {
        let region = result.region;
        surface.stroke_rect(&region, style.box_color, style.line_width);

        let label = result.label();
        let plate = FaceRegion {
            x: region.x,
            y: region.y - style.label_height,
            width: surface.text_width(&label) + 10.0,
            height: style.label_height,
        };
        surface.fill_rect(&plate, LABEL_PLATE);
        let text_y = plate.y + (style.label_height - style.font_px) / 2.0;
        surface.fill_text(&label, region.x + 5.0, text_y, style.box_color);

        if style.probability_bars {
            draw_probability_panel(surface, result, style);
        }
    }
}

fn draw_probability_panel<S: OverlaySurface + ?Sized>(
    surface: &mut S,
    result: &DetectionResult,
    style: &OverlayStyle,
) {
    let row_height = style.font_px + 10.0;
    let x = result.region.right() + 10.0;
    let mut y = result.region.y;

    let panel = FaceRegion {
        x,
        y,
        width: style.bar_width + 20.0,
        height: row_height * result.scores.as_array().len() as f32 + 10.0,
    };
    surface.fill_rect(&panel, PANEL_BACKGROUND);

    for (emotion, p) in result.scores.iter() {
        let line = format!("{emotion} {:.1}%", p * 100.0);
        surface.fill_text(&line, x + 10.0, y + 4.0, WHITE);

        let track = FaceRegion {
            x: x + 10.0,
            y: y + style.font_px + 4.0,
            width: style.bar_width,
            height: 6.0,
        };
        surface.fill_rect(&track, BAR_TRACK);
        if p > 0.0 {
            surface.fill_rect(
                &FaceRegion {
                    width: style.bar_width * p,
                    ..track
                },
                BAR_FILL,
            );
        }
        y += row_height;
    }
}

/// Render `results` onto a fresh transparent `width` × `height` image.
pub fn render_to_image(
    width: u32,
    height: u32,
    results: &[DetectionResult],
    style: &OverlayStyle,
    font: Option<&FontArc>,
) -> RgbaImage {
    let mut surface = ImageSurface::new(width, height);
    if let Some(font) = font {
        surface = surface.with_font(font.clone(), style.font_px);
    }
    render_overlay(&mut surface, results, style);
    surface.into_image()
}

/// RGBA image surface, transparent when cleared. Text needs a font; without
/// one only boxes, plates and bars are drawn.
pub struct ImageSurface {
    image: RgbaImage,
    font: Option<FontArc>,
    font_px: f32,
}

impl ImageSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::new(width, height),
            font: None,
            font_px: OverlayStyle::default().font_px,
        }
    }

    pub fn with_font(mut self, font: FontArc, font_px: f32) -> Self {
        self.font = Some(font);
        self.font_px = font_px;
        self
    }

    /// Load a TrueType/OpenType font for label text.
    pub fn load_font(path: &Path) -> Result<FontArc, OverlayError> {
        let bytes = std::fs::read(path).map_err(|source| OverlayError::FontRead {
            path: path.display().to_string(),
            source,
        })?;
        FontArc::try_from_vec(bytes).map_err(|e| OverlayError::InvalidFont(e.to_string()))
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }

    /// Alpha-composite the overlay onto `base` (same size as the frame).
    pub fn composite_onto(&self, base: &mut RgbaImage) {
        image::imageops::overlay(base, &self.image, 0, 0);
    }

    /// Clip a region to the image; `None` if nothing is left to draw.
    fn pixel_rect(&self, region: &FaceRegion) -> Option<Rect> {
        let clipped = region.clip_to(self.image.width(), self.image.height())?;
        let x = clipped.x.round() as i32;
        let y = clipped.y.round() as i32;
        let width = (clipped.width.round() as u32).max(1);
        let height = (clipped.height.round() as u32).max(1);
        Some(Rect::at(x, y).of_size(width, height))
    }
}

impl OverlaySurface for ImageSurface {
    fn size(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    fn clear(&mut self) {
        self.image.pixels_mut().for_each(|p| *p = Rgba([0, 0, 0, 0]));
    }

    fn stroke_rect(&mut self, rect: &FaceRegion, color: Color, line_width: u32) {
        for inset in 0..line_width {
            let inner = FaceRegion {
                x: rect.x + inset as f32,
                y: rect.y + inset as f32,
                width: rect.width - 2.0 * inset as f32,
                height: rect.height - 2.0 * inset as f32,
            };
            if let Some(r) = self.pixel_rect(&inner) {
                draw_hollow_rect_mut(&mut self.image, r, Rgba(color));
            }
        }
    }

    fn fill_rect(&mut self, rect: &FaceRegion, color: Color) {
        if let Some(r) = self.pixel_rect(rect) {
            draw_filled_rect_mut(&mut self.image, r, Rgba(color));
        }
    }

    fn fill_text(&mut self, text: &str, x: f32, y: f32, color: Color) {
        if let Some(font) = &self.font {
            draw_text_mut(
                &mut self.image,
                Rgba(color),
                x.round() as i32,
                y.round() as i32,
                PxScale::from(self.font_px),
                font,
                text,
            );
        }
    }

    fn text_width(&self, text: &str) -> f32 {
        match &self.font {
            Some(font) => text_size(PxScale::from(self.font_px), font, text).0 as f32,
            None => text.chars().count() as f32 * self.font_px * 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EmotionScores;

    #[derive(Debug, PartialEq)]
    enum Op {
        Clear,
        Stroke(FaceRegion),
        Fill(FaceRegion),
        Text(String),
    }

    #[derive(Default)]
    struct RecordingSurface {
        ops: Vec<Op>,
    }

    impl OverlaySurface for RecordingSurface {
        fn size(&self) -> (u32, u32) {
            (100, 100)
        }
        fn clear(&mut self) {
            self.ops.push(Op::Clear);
        }
        fn stroke_rect(&mut self, rect: &FaceRegion, _color: Color, _line_width: u32) {
            self.ops.push(Op::Stroke(*rect));
        }
        fn fill_rect(&mut self, rect: &FaceRegion, _color: Color) {
            self.ops.push(Op::Fill(*rect));
        }
        fn fill_text(&mut self, text: &str, _x: f32, _y: f32, _color: Color) {
            self.ops.push(Op::Text(text.to_string()));
        }
        fn text_width(&self, text: &str) -> f32 {
            text.len() as f32
        }
    }

    fn happy_face(x: f32) -> DetectionResult {
        let scores =
            EmotionScores::from_model_output(&[0.05, 0.02, 0.03, 0.70, 0.10, 0.05, 0.05]).unwrap();
        DetectionResult::new(FaceRegion { x, y: 40.0, width: 20.0, height: 20.0 }, scores)
    }

    #[test]
    fn test_clears_before_drawing() {
        let mut surface = RecordingSurface::default();
        render_overlay(&mut surface, &[], &OverlayStyle::default());
        assert_eq!(surface.ops, vec![Op::Clear]);
    }

    #[test]
    fn test_box_plate_and_label_per_face() {
        let mut surface = RecordingSurface::default();
        let results = vec![happy_face(10.0), happy_face(60.0)];
        render_overlay(&mut surface, &results, &OverlayStyle::default());

        assert_eq!(surface.ops[0], Op::Clear);
        assert_eq!(surface.ops[1], Op::Stroke(results[0].region));
        assert_eq!(
            surface.ops[2],
            Op::Fill(FaceRegion { x: 10.0, y: 20.0, width: 23.0, height: 20.0 })
        );
        assert_eq!(surface.ops[3], Op::Text("Happy (70.0%)".to_string()));
        assert_eq!(surface.ops[4], Op::Stroke(results[1].region));
        assert_eq!(surface.ops.len(), 7);
    }

    #[test]
    fn test_probability_panel_lists_every_emotion() {
        let mut surface = RecordingSurface::default();
        let style = OverlayStyle {
            probability_bars: true,
            ..OverlayStyle::default()
        };
        render_overlay(&mut surface, &[happy_face(10.0)], &style);

        let texts: Vec<&str> = surface
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts.len(), 8);
        assert_eq!(texts[1], "Angry 5.0%");
        assert_eq!(texts[4], "Happy 70.0%");
        assert_eq!(texts[7], "Neutral 5.0%");
    }

    #[test]
    fn test_rendering_leaves_results_untouched() {
        let results = vec![happy_face(10.0)];
        let before = (results[0].region, results[0].scores);
        let mut surface = ImageSurface::new(100, 100);
        render_overlay(&mut surface, &results, &OverlayStyle::default());
        assert_eq!((results[0].region, results[0].scores), before);
    }

    #[test]
    fn test_image_surface_draws_outline() {
        let mut surface = ImageSurface::new(100, 100);
        render_overlay(&mut surface, &[happy_face(40.0)], &OverlayStyle::default());
        let img = surface.image();
        assert_eq!(img.get_pixel(40, 50).0, YELLOW);
        assert_eq!(img.get_pixel(41, 50).0, YELLOW);
        assert_eq!(img.get_pixel(50, 50).0, [0, 0, 0, 0]);
    }

    #[test]
    fn test_image_surface_clear_resets() {
        let mut surface = ImageSurface::new(100, 100);
        render_overlay(&mut surface, &[happy_face(40.0)], &OverlayStyle::default());
        render_overlay(&mut surface, &[], &OverlayStyle::default());
        assert!(surface.image().pixels().all(|p| p.0 == [0, 0, 0, 0]));
    }

    #[test]
    fn test_offscreen_shapes_are_skipped() {
        let mut surface = ImageSurface::new(50, 50);
        surface.fill_rect(&FaceRegion { x: 80.0, y: 80.0, width: 10.0, height: 10.0 }, WHITE);
        surface.stroke_rect(&FaceRegion { x: -30.0, y: -30.0, width: 10.0, height: 10.0 }, WHITE, 2);
        assert!(surface.image().pixels().all(|p| p.0 == [0, 0, 0, 0]));
    }

    #[test]
    fn test_composite_onto_base() {
        let mut surface = ImageSurface::new(10, 10);
        surface.fill_rect(&FaceRegion { x: 0.0, y: 0.0, width: 5.0, height: 5.0 }, YELLOW);
        let mut base = RgbaImage::from_pixel(10, 10, Rgba([0, 0, 255, 255]));
        surface.composite_onto(&mut base);
        assert_eq!(base.get_pixel(1, 1).0, YELLOW);
        assert_eq!(base.get_pixel(8, 8).0, [0, 0, 255, 255]);
    }

    #[test]
    fn test_render_to_image_without_font() {
        let img = render_to_image(80, 60, &[happy_face(40.0)], &OverlayStyle::default(), None);
        assert_eq!(img.dimensions(), (80, 60));
        assert_eq!(img.get_pixel(40, 50).0, YELLOW);
        assert_eq!(img.get_pixel(0, 0).0, [0, 0, 0, 0]);
    }

    #[test]
    fn test_missing_font_reports_path() {
        let err = ImageSurface::load_font(Path::new("/nonexistent/font.ttf")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/font.ttf"));
    }
}
