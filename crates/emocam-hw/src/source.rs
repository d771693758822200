//! Frame sources consumed by the detection loop.

use crate::camera::CameraError;
use crate::frame::Frame;
use std::path::Path;

/// Anything that can hand the detection loop an RGB frame per tick.
pub trait FrameSource {
    /// Whether the source currently has frame data available.
    fn is_ready(&self) -> bool;

    /// Frame dimensions as (width, height).
    fn dimensions(&self) -> (u32, u32);

    /// Grab the current frame. `Ok(None)` means nothing is available this
    /// tick and the caller should try again on the next one.
    fn capture(&mut self) -> Result<Option<Frame>, CameraError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }

    fn dimensions(&self) -> (u32, u32) {
        (**self).dimensions()
    }

    fn capture(&mut self) -> Result<Option<Frame>, CameraError> {
        (**self).capture()
    }
}

/// Repeats one decoded image as an endless frame stream.
pub struct StillImageSource {
    image: image::RgbImage,
    sequence: u32,
}

impl StillImageSource {
    pub fn new(image: image::RgbImage) -> Self {
        Self { image, sequence: 0 }
    }

    /// Decode an image file from disk.
    pub fn open(path: &Path) -> Result<Self, CameraError> {
        let image = image::open(path)
            .map_err(|e| CameraError::DeviceNotFound(format!("{}: {e}", path.display())))?
            .to_rgb8();

        tracing::info!(
            path = %path.display(),
            width = image.width(),
            height = image.height(),
            "opened still image source"
        );
        Ok(Self::new(image))
    }
}

impl FrameSource for StillImageSource {
    fn is_ready(&self) -> bool {
        self.image.width() > 0 && self.image.height() > 0
    }

    fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    fn capture(&mut self) -> Result<Option<Frame>, CameraError> {
        if !self.is_ready() {
            return Ok(None);
        }
        let frame = Frame::from_image(&self.image, self.sequence);
        self.sequence = self.sequence.wrapping_add(1);
        Ok(Some(frame))
    }
}
