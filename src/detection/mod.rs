mod landmarks;
mod preprocess;
pub mod types;
mod worker;

pub use types::{FaceDetector, FaceObservation};
pub use worker::{DetectionWorker, SpawnError};

use anyhow::Result;
use landmarks::LandmarkDetector;

/// Create the default face detector (ONNX landmark model)
pub fn create_default_detector(model_path: &str) -> Result<Box<dyn FaceDetector>> {
    let detector = LandmarkDetector::new(model_path)?;
    Ok(Box::new(detector))
}
