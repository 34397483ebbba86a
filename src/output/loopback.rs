use super::sample::OutgoingSample;
use super::OutputSink;
use anyhow::{Context, Result};
use image::{imageops, RgbImage};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use v4l::video::Output;
use v4l::{Device, Format, FourCC};

/// Writes samples to a v4l2loopback device as YUYV frames
pub struct V4L2Output {
    file: File,
    card: String,
    width: u32,
    height: u32,
    buffer: Vec<u8>,
}

impl V4L2Output {
    pub fn new<P: AsRef<Path>>(device_path: P, width: u32, height: u32) -> Result<Self> {
        let path = device_path.as_ref();
        tracing::info!(
            "Opening v4l2loopback device at {} ({}x{})",
            path.display(),
            width,
            height
        );

        let device = Device::with_path(path)
            .with_context(|| format!("Failed to open v4l2loopback device at {}", path.display()))?;
        let card = device
            .query_caps()
            .context("Failed to query v4l2loopback capabilities")?
            .card;

        let requested = Format::new(width, height, FourCC::new(b"YUYV"));
        let format = Output::set_format(&device, &requested)
            .context("Failed to set YUYV output format")?;
        if (format.width, format.height) != (width, height) {
            tracing::warn!(
                "Loopback device negotiated {}x{} instead of {}x{}",
                format.width,
                format.height,
                width,
                height
            );
        }

        // Frames are written straight to the device file once the format is set
        let file = File::options()
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open {} for writing", path.display()))?;

        tracing::info!("v4l2loopback device '{}' ready", card);

        Ok(Self {
            file,
            card,
            width,
            height,
            buffer: Vec::with_capacity((width * height * 2) as usize),
        })
    }

    /// Name the device reports, used to keep it out of the input list
    pub fn card_name(&self) -> &str {
        &self.card
    }
}

/// Pack an RGB frame as YUYV (YUV 4:2:2), averaging chroma over each pixel pair
fn pack_yuyv(frame: &RgbImage, out: &mut Vec<u8>) {
    out.clear();
    for row in frame.rows() {
        let pixels: Vec<_> = row.collect();
        for pair in pixels.chunks(2) {
            let first = pair[0];
            let second = pair.get(1).copied().unwrap_or(first);

            let (y0, u0, v0) = rgb_to_yuv(first.0);
            let (y1, u1, v1) = rgb_to_yuv(second.0);
            out.extend_from_slice(&[
                y0,
                ((u0 as u16 + u1 as u16) / 2) as u8,
                y1,
                ((v0 as u16 + v1 as u16) / 2) as u8,
            ]);
        }
    }
}

/// BT.601 RGB to YUV
fn rgb_to_yuv([r, g, b]: [u8; 3]) -> (u8, u8, u8) {
    let (r, g, b) = (r as f32, g as f32, b as f32);

    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let u = -0.147 * r - 0.289 * g + 0.436 * b + 128.0;
    let v = 0.615 * r - 0.515 * g - 0.100 * b + 128.0;

    let clamp = |c: f32| c.clamp(0.0, 255.0) as u8;
    (clamp(y), clamp(u), clamp(v))
}

impl OutputSink for V4L2Output {
    fn write_sample(&mut self, sample: &OutgoingSample) -> Result<()> {
        let frame = sample.payload.as_ref();
        let resized;
        let frame = if frame.dimensions() != (self.width, self.height) {
            resized = imageops::resize(frame, self.width, self.height, imageops::FilterType::Triangle);
            &resized
        } else {
            frame
        };

        pack_yuyv(frame, &mut self.buffer);

        self.file
            .write_all(&self.buffer)
            .with_context(|| format!("Failed to write sample {} to v4l2loopback device", sample.sequence_number))?;

        Ok(())
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_yuyv_is_two_bytes_per_pixel() {
        let frame = RgbImage::from_pixel(4, 2, Rgb([255, 255, 255]));
        let mut out = Vec::new();
        pack_yuyv(&frame, &mut out);

        assert_eq!(out.len(), 4 * 2 * 2);
        assert_eq!(out[0], 255);
        // Chroma of white sits at the midpoint
        assert!((out[1] as i16 - 128).abs() <= 1);
        assert!((out[3] as i16 - 128).abs() <= 1);
    }

    #[test]
    fn test_odd_width_repeats_last_pixel() {
        let frame = RgbImage::from_pixel(3, 1, Rgb([0, 0, 0]));
        let mut out = Vec::new();
        pack_yuyv(&frame, &mut out);
        assert_eq!(out.len(), 8);
        assert_eq!(out[4], out[6]);
    }
}
