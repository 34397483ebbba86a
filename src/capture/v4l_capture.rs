use super::{CaptureDevice, CaptureSource};
use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{ApiBackend, CameraIndex, RequestedFormat, RequestedFormatType, Resolution};
use nokhwa::Camera;

pub struct WebcamCapture {
    camera: Camera,
}

impl WebcamCapture {
    pub fn new(device_index: u32, width: u32, height: u32) -> Result<Self> {
        tracing::info!(
            "Initializing webcam {} at {}x{}",
            device_index,
            width,
            height
        );

        let index = CameraIndex::Index(device_index);
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::HighestResolution(
            Resolution::new(width, height),
        ));

        let mut camera = Camera::new(index, requested).context("Failed to open camera")?;

        camera
            .open_stream()
            .context("Failed to open camera stream")?;

        let resolution = camera.resolution();
        tracing::info!(
            "Webcam {} streaming at {}x{}",
            device_index,
            resolution.width(),
            resolution.height()
        );

        Ok(Self { camera })
    }
}

impl CaptureSource for WebcamCapture {
    fn capture_frame(&mut self) -> Result<RgbImage> {
        let frame = self.camera.frame().context("Failed to capture frame")?;

        let decoded = frame
            .decode_image::<RgbFormat>()
            .context("Failed to decode frame")?;

        Ok(decoded)
    }

    fn resolution(&self) -> (u32, u32) {
        let resolution = self.camera.resolution();
        (resolution.width(), resolution.height())
    }
}

impl Drop for WebcamCapture {
    fn drop(&mut self) {
        if let Err(e) = self.camera.stop_stream() {
            tracing::warn!("Failed to stop camera stream: {}", e);
        }
    }
}

/// A webcam found during discovery; opened lazily on its capture thread
#[derive(Debug, Clone)]
pub struct WebcamDevice {
    pub index: u32,
    pub name: String,
    pub width: u32,
    pub height: u32,
}

impl CaptureDevice for WebcamDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> Result<Box<dyn CaptureSource>> {
        let capture = WebcamCapture::new(self.index, self.width, self.height)
            .with_context(|| format!("Failed to open camera '{}'", self.name))?;
        Ok(Box::new(capture))
    }
}

/// True when `name` contains any exclusion pattern (case-insensitive)
pub fn is_excluded(name: &str, exclude: &[String]) -> bool {
    let name = name.to_lowercase();
    exclude
        .iter()
        .filter(|pattern| !pattern.is_empty())
        .any(|pattern| name.contains(&pattern.to_lowercase()))
}

/// Enumerate video inputs, skipping excluded names and anything not addressable by index
pub fn discover_devices(exclude: &[String], width: u32, height: u32) -> Result<Vec<WebcamDevice>> {
    let cameras = nokhwa::query(ApiBackend::Auto).map_err(|e| anyhow!("Failed to query cameras: {e}"))?;

    let mut devices = Vec::new();
    for info in cameras {
        let name = info.human_name();
        if is_excluded(&name, exclude) {
            tracing::info!("Skipping excluded camera '{}'", name);
            continue;
        }

        let index = match info.index().as_index() {
            Ok(index) => index,
            Err(e) => {
                tracing::warn!("Skipping camera '{}' without a numeric index: {}", name, e);
                continue;
            }
        };

        tracing::info!("Found camera {}: '{}'", index, name);
        devices.push(WebcamDevice {
            index,
            name,
            width,
            height,
        });
    }

    Ok(devices)
}
