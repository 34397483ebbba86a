mod v4l_capture;

pub use v4l_capture::{discover_devices, WebcamDevice};

use anyhow::Result;
use image::RgbImage;

/// Trait for camera capture sources
///
/// Sources live on their own capture thread and need not be `Send`.
pub trait CaptureSource {
    /// Capture a single frame, blocking until one arrives
    fn capture_frame(&mut self) -> Result<RgbImage>;

    /// Get the resolution of captured frames
    fn resolution(&self) -> (u32, u32);
}

/// A physical input that can be opened on a capture thread
pub trait CaptureDevice: Send + Sync {
    /// Human-readable device name
    fn name(&self) -> &str;

    /// Open the device and start streaming
    fn open(&self) -> Result<Box<dyn CaptureSource>>;
}
