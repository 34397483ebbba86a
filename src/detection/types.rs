use anyhow::Result;
use image::RgbImage;

/// A single face found in a frame
///
/// An eye only counts as visible when both its contour and its pupil were
/// located.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FaceObservation {
    pub left_eye: bool,
    pub left_pupil: bool,
    pub right_eye: bool,
    pub right_pupil: bool,

    /// Landmark confidence in [0, 1], if the backend reports one
    pub confidence: Option<f32>,
}

impl FaceObservation {
    /// Observation where each eye is either fully visible or not at all
    pub fn new(left_visible: bool, right_visible: bool, confidence: f32) -> Self {
        Self {
            left_eye: left_visible,
            left_pupil: left_visible,
            right_eye: right_visible,
            right_pupil: right_visible,
            confidence: Some(confidence),
        }
    }

    pub fn left_eye_visible(&self) -> bool {
        self.left_eye && self.left_pupil
    }

    pub fn right_eye_visible(&self) -> bool {
        self.right_eye && self.right_pupil
    }

    /// Confidence clamped to [0, 1]; missing or non-finite values read as 0
    pub fn confidence(&self) -> f32 {
        match self.confidence {
            Some(c) if c.is_finite() => c.clamp(0.0, 1.0),
            _ => 0.0,
        }
    }
}

/// Trait for face detectors
/// Allows swapping between different backends (ONNX landmark models, test doubles, etc.)
pub trait FaceDetector: Send {
    /// Find faces in a frame
    ///
    /// # Returns
    /// * Zero or more observations, best candidate first
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<FaceObservation>>;

    /// Backend identifier for logging
    fn name(&self) -> &'static str;
}
