use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Slowest accepted detection rate: one cycle every 100 seconds.
pub const MIN_TARGET_FPS: f32 = 0.01;

/// Daemon configuration: defaults, then an optional TOML file named by
/// `EMOCAM_CONFIG`, then `EMOCAM_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Localizer model file name, relative to `model_dir` unless absolute.
    pub localizer_model: String,
    /// Classifier model file name, relative to `model_dir` unless absolute.
    pub classifier_model: String,
    /// Serve detections from a still image instead of the camera.
    pub still_image: Option<PathBuf>,
    /// Detection cycles per second.
    pub target_fps: f32,
    /// Pixels added to each axis of a localized face box.
    pub region_padding: f32,
    /// Requested capture resolution.
    pub frame_width: u32,
    pub frame_height: u32,
    /// TrueType font for overlay labels. Labels are omitted without one.
    pub font_path: Option<PathBuf>,
}

/// Keys accepted in the TOML file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    model_dir: Option<PathBuf>,
    localizer_model: Option<String>,
    classifier_model: Option<String>,
    still_image: Option<PathBuf>,
    target_fps: Option<f32>,
    region_padding: Option<f32>,
    frame_width: Option<u32>,
    frame_height: Option<u32>,
    font_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            model_dir: emocam_core::default_model_dir(),
            localizer_model: "det_500m.onnx".to_string(),
            classifier_model: "emotion_fer.onnx".to_string(),
            still_image: None,
            target_fps: 30.0,
            region_padding: 20.0,
            frame_width: 640,
            frame_height: 480,
            font_path: None,
        }
    }
}

impl Config {
    /// Load configuration from `EMOCAM_CONFIG` and `EMOCAM_*` environment variables.
    pub fn load() -> Result<Self> {
        let file = match std::env::var("EMOCAM_CONFIG") {
            Ok(path) => Some(
                std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config file {path}"))?,
            ),
            Err(_) => None,
        };
        Self::from_sources(file.as_deref(), |key| std::env::var(key).ok())
    }

    /// Merge defaults, TOML text, and an environment lookup.
    pub fn from_sources(
        file: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut config = Self::default();

        if let Some(text) = file {
            let parsed: FileConfig = toml::from_str(text).context("malformed config file")?;
            config.apply_file(parsed);
        }

        if let Some(v) = env("EMOCAM_CAMERA_DEVICE") {
            config.camera_device = v;
        }
        if let Some(v) = env("EMOCAM_MODEL_DIR") {
            config.model_dir = PathBuf::from(v);
        }
        if let Some(v) = env("EMOCAM_STILL_IMAGE") {
            config.still_image = Some(PathBuf::from(v));
        }
        if let Some(v) = env("EMOCAM_FONT_PATH") {
            config.font_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env("EMOCAM_TARGET_FPS") {
            config.target_fps = v
                .parse()
                .with_context(|| format!("EMOCAM_TARGET_FPS is not a number: {v}"))?;
        }
        if let Some(v) = env("EMOCAM_REGION_PADDING") {
            config.region_padding = v
                .parse()
                .with_context(|| format!("EMOCAM_REGION_PADDING is not a number: {v}"))?;
        }

        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) {
        let FileConfig {
            camera_device,
            model_dir,
            localizer_model,
            classifier_model,
            still_image,
            target_fps,
            region_padding,
            frame_width,
            frame_height,
            font_path,
        } = file;

        if let Some(v) = camera_device {
            self.camera_device = v;
        }
        if let Some(v) = model_dir {
            self.model_dir = v;
        }
        if let Some(v) = localizer_model {
            self.localizer_model = v;
        }
        if let Some(v) = classifier_model {
            self.classifier_model = v;
        }
        if still_image.is_some() {
            self.still_image = still_image;
        }
        if let Some(v) = target_fps {
            self.target_fps = v;
        }
        if let Some(v) = region_padding {
            self.region_padding = v;
        }
        if let Some(v) = frame_width {
            self.frame_width = v;
        }
        if let Some(v) = frame_height {
            self.frame_height = v;
        }
        if font_path.is_some() {
            self.font_path = font_path;
        }
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.target_fps.is_finite() && self.target_fps >= MIN_TARGET_FPS,
            "target_fps must be at least {MIN_TARGET_FPS}, got {}",
            self.target_fps
        );
        anyhow::ensure!(
            self.region_padding.is_finite() && self.region_padding >= 0.0,
            "region_padding must be non-negative, got {}",
            self.region_padding
        );
        anyhow::ensure!(
            self.frame_width > 0 && self.frame_height > 0,
            "frame size must be non-zero, got {}x{}",
            self.frame_width,
            self.frame_height
        );
        Ok(())
    }

    /// Path to the face localizer model.
    pub fn localizer_model_path(&self) -> PathBuf {
        self.model_path(&self.localizer_model)
    }

    /// Path to the emotion classifier model.
    pub fn classifier_model_path(&self) -> PathBuf {
        self.model_path(&self.classifier_model)
    }

    fn model_path(&self, name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.model_dir.join(path)
        }
    }
}
