use super::preprocess::Preprocessor;
use super::types::{FaceDetector, FaceObservation};
use anyhow::{anyhow, bail, Context, Result};
use image::RgbImage;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{Tensor, Value};
use std::path::Path;

/// Values per detected face: box (4), five keypoints (10), score (1)
const ROW_LEN: usize = 15;

/// Faces scoring below this are discarded
const SCORE_THRESHOLD: f32 = 0.6;

/// Face landmark detector backed by an ONNX model
///
/// The model must emit decoded detections shaped `[N, 15]` (or `[1, N, 15]`)
/// in model-input pixels, one row per face:
/// `x, y, w, h, right_eye(x, y), left_eye(x, y), nose(x, y),
/// mouth_right(x, y), mouth_left(x, y), score`.
pub struct LandmarkDetector {
    session: Session,
    preprocessor: Preprocessor,
    score_threshold: f32,
}

impl LandmarkDetector {
    /// Load a landmark model from an ONNX file
    ///
    /// # Default Configuration
    /// - Input size: 320x320 (faces only need to be found, not measured)
    /// - Score threshold: 0.6
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let path = model_path.as_ref();

        tracing::info!("Loading face landmark model from {}", path.display());

        let session = Session::builder()
            .map_err(|e| anyhow!("ORT session builder: {e}"))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| anyhow!("ORT optimization level: {e}"))?
            .with_intra_threads(2)
            .map_err(|e| anyhow!("ORT intra threads: {e}"))?
            .commit_from_file(path)
            .map_err(|e| anyhow!("ORT load model: {e}"))
            .with_context(|| format!("Failed to load model from {}", path.display()))?;

        tracing::info!("Face landmark model loaded successfully");

        Ok(Self {
            session,
            preprocessor: Preprocessor::new(320, 320),
            score_threshold: SCORE_THRESHOLD,
        })
    }
}

impl FaceDetector for LandmarkDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<FaceObservation>> {
        let _span = tracing::debug_span!("face_detect").entered();

        let prepared = self.preprocessor.preprocess(frame);
        let shape = prepared.tensor.shape().to_vec();
        let data = prepared.tensor.into_raw_vec().into_boxed_slice();
        let input = Tensor::from_array((shape, data))
            .map(Value::from)
            .map_err(|e| anyhow!("ORT tensor: {e}"))?;

        let _infer_span = tracing::debug_span!("inference").entered();
        let outputs = self
            .session
            .run(ort::inputs![input])
            .map_err(|e| anyhow!("ORT run failed: {e}"))?;
        drop(_infer_span);

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| anyhow!("ORT extract: {e}"))?;

        let rows = match shape.len() {
            3 if shape[0] == 1 && shape[2] as usize == ROW_LEN => shape[1] as usize,
            2 if shape[1] as usize == ROW_LEN => shape[0] as usize,
            _ => bail!("Unexpected landmark output shape: {:?}", shape),
        };

        let geometry = FrameGeometry {
            width: frame.width() as f32,
            height: frame.height() as f32,
            scale_x: prepared.scale_x,
            scale_y: prepared.scale_y,
        };
        let rows = data
            .get(..rows * ROW_LEN)
            .ok_or_else(|| anyhow!("Landmark output shorter than its shape {:?}", shape))?;
        parse_faces(rows, &geometry, self.score_threshold)
    }

    fn name(&self) -> &'static str {
        "onnx-landmarks"
    }
}

/// Mapping from model-input pixels to frame pixels
struct FrameGeometry {
    width: f32,
    height: f32,
    scale_x: f32,
    scale_y: f32,
}

impl FrameGeometry {
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        (x * self.scale_x, y * self.scale_y)
    }

    fn contains(&self, (x, y): (f32, f32)) -> bool {
        x.is_finite() && y.is_finite() && x >= 0.0 && y >= 0.0 && x < self.width && y < self.height
    }
}

/// Turn raw detection rows into observations, best score first
///
/// An eye keypoint inside the frame counts as its contour; the same keypoint
/// falling inside the face box counts as its pupil.
fn parse_faces(data: &[f32], geometry: &FrameGeometry, threshold: f32) -> Result<Vec<FaceObservation>> {
    if data.len() % ROW_LEN != 0 {
        bail!("Landmark output length {} is not a multiple of {}", data.len(), ROW_LEN);
    }

    let mut faces: Vec<FaceObservation> = data
        .chunks_exact(ROW_LEN)
        .filter(|row| row[14].is_finite() && row[14] >= threshold)
        .map(|row| {
            let (bx, by) = geometry.to_frame(row[0], row[1]);
            let (bw, bh) = geometry.to_frame(row[2], row[3]);
            let in_box = |(x, y): (f32, f32)| x >= bx && x <= bx + bw && y >= by && y <= by + bh;

            let right = geometry.to_frame(row[4], row[5]);
            let left = geometry.to_frame(row[6], row[7]);

            FaceObservation {
                left_eye: geometry.contains(left),
                left_pupil: in_box(left),
                right_eye: geometry.contains(right),
                right_pupil: in_box(right),
                confidence: Some(row[14]),
            }
        })
        .collect();

    faces.sort_by(|a, b| b.confidence().total_cmp(&a.confidence()));
    Ok(faces)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> FrameGeometry {
        FrameGeometry {
            width: 640.0,
            height: 640.0,
            scale_x: 2.0,
            scale_y: 2.0,
        }
    }

    fn row(score: f32, right_eye: (f32, f32), left_eye: (f32, f32)) -> Vec<f32> {
        vec![
            100.0, 100.0, 80.0, 80.0,
            right_eye.0, right_eye.1,
            left_eye.0, left_eye.1,
            140.0, 140.0,
            125.0, 160.0,
            155.0, 160.0,
            score,
        ]
    }

    #[test]
    fn test_parse_frontal_face() {
        let data = row(0.9, (120.0, 120.0), (160.0, 120.0));
        let faces = parse_faces(&data, &geometry(), 0.6).unwrap();

        assert_eq!(faces.len(), 1);
        assert!(faces[0].left_eye_visible());
        assert!(faces[0].right_eye_visible());
        assert_eq!(faces[0].confidence(), 0.9);
    }

    #[test]
    fn test_eye_outside_face_box_has_no_pupil() {
        let data = row(0.9, (120.0, 120.0), (250.0, 120.0));
        let faces = parse_faces(&data, &geometry(), 0.6).unwrap();

        assert!(faces[0].right_eye_visible());
        assert!(faces[0].left_eye);
        assert!(!faces[0].left_pupil);
        assert!(!faces[0].left_eye_visible());
    }

    #[test]
    fn test_low_scores_filtered_and_sorted() {
        let mut data = row(0.7, (120.0, 120.0), (160.0, 120.0));
        data.extend(row(0.2, (120.0, 120.0), (160.0, 120.0)));
        data.extend(row(0.95, (120.0, 120.0), (160.0, 120.0)));

        let faces = parse_faces(&data, &geometry(), 0.6).unwrap();
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[0].confidence(), 0.95);
        assert_eq!(faces[1].confidence(), 0.7);
    }

    #[test]
    fn test_truncated_output_is_an_error() {
        let data = vec![0.0; ROW_LEN + 3];
        assert!(parse_faces(&data, &geometry(), 0.6).is_err());
    }
}
