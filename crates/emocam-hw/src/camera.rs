//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use crate::source::FrameSource;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, converted to RGB).
    Yuyv,
    /// Packed RGB24 (3 bytes/pixel, used as-is).
    Rgb3,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"RGB3") {
            Some(Self::Rgb3)
        } else {
            None
        }
    }
}

/// V4L2 camera device handle.
///
/// The capture stream is started on the first `capture` and kept open
/// until the camera is dropped, which releases the device.
pub struct Camera {
    device: Device,
    stream: Option<MmapStream<'static>>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0") and
    /// negotiate the requested resolution.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                CameraError::PermissionDenied(format!("{device_path}: {e}"))
            }
            _ if e.to_string().contains("busy") || e.to_string().contains("EBUSY") => {
                CameraError::DeviceBusy
            }
            _ => CameraError::DeviceNotFound(format!("{device_path}: {e}")),
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        // Try YUYV first (near-universal on webcams), then native RGB.
        let mut negotiated = None;
        for wanted in [b"YUYV", b"RGB3"] {
            let mut fmt = device.format().map_err(|e| {
                CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
            })?;
            fmt.fourcc = FourCC::new(wanted);
            fmt.width = width;
            fmt.height = height;

            let applied = device.set_format(&fmt).map_err(|e| {
                CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
            })?;
            if let Some(pixel_format) = PixelFormat::from_fourcc(applied.fourcc) {
                negotiated = Some((applied, pixel_format));
                break;
            }
        }

        let Some((fmt, pixel_format)) = negotiated else {
            return Err(CameraError::FormatNegotiationFailed(
                "device offers neither YUYV nor RGB3".to_string(),
            ));
        };

        tracing::info!(
            width = fmt.width,
            height = fmt.height,
            fourcc = ?fmt.fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            stream: None,
            width: fmt.width,
            height: fmt.height,
            device_path: device_path.to_string(),
            fourcc: fmt.fourcc,
            pixel_format,
        })
    }

    /// Capture a single RGB frame.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        if self.stream.is_none() {
            let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4)
                .map_err(|e| {
                    CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
                })?;
            tracing::debug!(device = %self.device_path, "capture stream started");
            self.stream = Some(stream);
        }

        let (width, height, pixel_format) = (self.width, self.height, self.pixel_format);
        let Some(stream) = self.stream.as_mut() else {
            return Err(CameraError::CaptureFailed("capture stream unavailable".to_string()));
        };

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let rgb = match pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height),
            PixelFormat::Rgb3 => frame::rgb_passthrough(buf, width, height),
        }
        .map_err(|e| CameraError::CaptureFailed(format!("{pixel_format:?} conversion failed: {e}")))?;

        Ok(Frame {
            data: rgb,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence: meta.sequence,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl FrameSource for Camera {
    fn is_ready(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn capture(&mut self) -> Result<Option<Frame>, CameraError> {
        self.capture_frame().map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_device() {
        let err = Camera::open("/dev/video-nonexistent", 640, 480).err().unwrap();
        assert!(matches!(err, CameraError::DeviceNotFound(_)));
        assert!(err.to_string().contains("/dev/video-nonexistent"));
    }

    #[test]
    fn test_fourcc_mapping() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"RGB3")), Some(PixelFormat::Rgb3));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), None);
    }
}
