use crate::engine::EngineHandle;
use emocam_core::overlay::{self, FontArc, OverlayStyle};
use emocam_core::FrameDetections;
use std::path::{Path, PathBuf};
use zbus::interface;

/// D-Bus interface for the emocam detection daemon.
///
/// Bus name: org.emocam.Detector1
/// Object path: /org/emocam/Detector1
pub struct DetectorService {
    pub engine: EngineHandle,
    pub font: Option<FontArc>,
    pub style: OverlayStyle,
}

impl DetectorService {
    fn status_json(&self) -> serde_json::Value {
        let state = self.engine.state();
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "state": state.name(),
            "status": state.status_message(),
            "stats": self.engine.stats(),
            "live_buffers": self.engine.live_buffers(),
        })
    }
}

#[interface(name = "org.emocam.Detector1")]
impl DetectorService {
    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.status_json().to_string())
    }

    /// Latest published detections for one frame.
    async fn detections(&self) -> zbus::fdo::Result<String> {
        serde_json::to_string(self.engine.latest().as_ref())
            .map_err(|e| zbus::fdo::Error::Failed(format!("failed to encode detections: {e}")))
    }

    /// Render the latest detections onto a transparent frame-sized PNG.
    async fn save_overlay(&self, path: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(path, "save_overlay requested");
        let latest = self.engine.latest();
        if latest.width == 0 || latest.height == 0 {
            return Err(zbus::fdo::Error::Failed(
                "no frame has been processed yet".into(),
            ));
        }

        let style = self.style.clone();
        let font = self.font.clone();
        let out = PathBuf::from(path);
        let faces = latest.results.len();
        tokio::task::spawn_blocking(move || write_overlay(&latest, &style, font.as_ref(), &out))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("overlay task failed: {e}")))?
            .map_err(|e| {
                tracing::warn!(path, error = %e, "failed to write overlay");
                zbus::fdo::Error::Failed(format!("failed to write {path}: {e}"))
            })?;

        tracing::info!(path, faces, "overlay written");
        Ok(true)
    }
}

/// Rasterize `detections` and encode them to `path`.
fn write_overlay(
    detections: &FrameDetections,
    style: &OverlayStyle,
    font: Option<&FontArc>,
    path: &Path,
) -> Result<(), image::ImageError> {
    let image = overlay::render_to_image(
        detections.width,
        detections.height,
        &detections.results,
        style,
        font,
    );
    image.save(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::{spawn_engine, LoopSettings, OnnxCameraBackend, PipelineState};
    use std::time::{Duration, Instant};

    fn failing_service() -> DetectorService {
        let config = Config {
            model_dir: "/nonexistent/models".into(),
            ..Config::default()
        };
        let engine = spawn_engine(OnnxCameraBackend::from_config(&config), LoopSettings::default());
        let deadline = Instant::now() + Duration::from_secs(5);
        while !matches!(engine.state(), PipelineState::Failed(_)) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        DetectorService {
            engine,
            font: None,
            style: OverlayStyle::default(),
        }
    }

    #[tokio::test]
    async fn test_status_reports_model_failure() {
        let service = failing_service();
        let status: serde_json::Value = serde_json::from_str(&service.status().await.unwrap()).unwrap();

        assert_eq!(status["state"], "failed");
        let message = status["status"].as_str().unwrap();
        assert!(message.starts_with("Error: face localizer: model file not found"), "{message}");
        assert!(message.contains("/nonexistent/models/det_500m.onnx"), "{message}");
        assert_eq!(status["live_buffers"], 0);
        assert_eq!(status["stats"]["cycles"], 0);
        service.engine.shutdown();
    }

    #[tokio::test]
    async fn test_detections_empty_before_first_frame() {
        let service = failing_service();
        let json: serde_json::Value = serde_json::from_str(&service.detections().await.unwrap()).unwrap();
        assert_eq!(json["sequence"], 0);
        assert_eq!(json["results"].as_array().unwrap().len(), 0);

        assert!(service.save_overlay("/tmp/emocam-overlay-test.png").await.is_err());
        service.engine.shutdown();
    }

    #[test]
    fn test_write_overlay_png() {
        let scores = emocam_core::EmotionScores::from_model_output(&[0.05, 0.02, 0.03, 0.70, 0.10, 0.05, 0.05]).unwrap();
        let region = emocam_core::FaceRegion {
            x: 10.0,
            y: 10.0,
            width: 30.0,
            height: 30.0,
        };
        let detections = FrameDetections {
            sequence: 4,
            width: 64,
            height: 48,
            results: vec![emocam_core::DetectionResult::new(region, scores)],
        };
        let path = std::env::temp_dir().join(format!("emocam-overlay-{}.png", std::process::id()));

        write_overlay(&detections, &OverlayStyle::default(), None, &path).unwrap();

        let written = image::open(&path).unwrap().to_rgba8();
        assert_eq!(written.dimensions(), (64, 48));
        assert_eq!(written.get_pixel(0, 0).0[3], 0, "background stays transparent");
        assert_eq!(written.get_pixel(10, 30).0, overlay::YELLOW, "left edge of the face box");
        let _ = std::fs::remove_file(&path);
    }
}
