//! emolens-hw: camera capture for the emotion pipeline.
//!
//! Provides V4L2-based streaming capture and grayscale frame conversion.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameSource, PixelFormat};
pub use frame::{Frame, FrameError};
