use image::{imageops, RgbImage};
use ndarray::Array4;

/// Preprocessor for converting camera frames to landmark model input tensors
pub struct Preprocessor {
    target_width: u32,
    target_height: u32,
}

/// Model input tensor plus the factors that map model coordinates back to the frame
pub struct PreparedInput {
    pub tensor: Array4<f32>,
    pub scale_x: f32,
    pub scale_y: f32,
}

impl Preprocessor {
    pub fn new(target_width: u32, target_height: u32) -> Self {
        Self {
            target_width,
            target_height,
        }
    }

    /// Preprocess an RGB frame into a BGR NCHW tensor
    ///
    /// Steps:
    /// 1. Resize to target dimensions (nearest is plenty for a face check)
    /// 2. Reorder channels to BGR, keeping the 0-255 range the model was trained on
    /// 3. Transpose from HWC to NCHW format
    ///
    /// Returns: tensor with shape [1, 3, height, width] and frame/model scale factors
    pub fn preprocess(&self, frame: &RgbImage) -> PreparedInput {
        let _span = tracing::debug_span!("preprocess").entered();

        let (frame_width, frame_height) = frame.dimensions();
        let resized;
        let input = if (frame_width, frame_height) != (self.target_width, self.target_height) {
            resized = imageops::resize(
                frame,
                self.target_width,
                self.target_height,
                imageops::FilterType::Nearest,
            );
            &resized
        } else {
            frame
        };

        let (width, height) = input.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
        for (x, y, pixel) in input.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            tensor[[0, 0, y, x]] = pixel[2] as f32;
            tensor[[0, 1, y, x]] = pixel[1] as f32;
            tensor[[0, 2, y, x]] = pixel[0] as f32;
        }

        PreparedInput {
            tensor,
            scale_x: frame_width as f32 / width.max(1) as f32,
            scale_y: frame_height as f32 / height.max(1) as f32,
        }
    }
}
