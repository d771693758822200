//! emocam-hw: Hardware abstraction for camera capture.
//!
//! Provides V4L2-based webcam access with YUYV→RGB conversion, plus a
//! still-image source for running the pipeline without a camera.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use source::{FrameSource, StillImageSource};
