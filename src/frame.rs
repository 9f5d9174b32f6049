use crate::error::{AnalysisError, Result};
use image::{GrayImage, Luma, RgbImage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;

/// Pixel layout of a decoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameFormat {
    /// 8-bit luminance, one byte per pixel
    Gray8,
    /// RGB24, three bytes per pixel
    Rgb24,
    /// BGR24, three bytes per pixel (common decoder output)
    Bgr24,
    /// YUV 4:2:2 packed, two bytes per pixel
    Yuyv,
    /// Motion JPEG - compressed, variable size
    Mjpeg,
}

impl FrameFormat {
    /// Get bytes per pixel for the format
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            FrameFormat::Gray8 => 1,
            FrameFormat::Rgb24 | FrameFormat::Bgr24 => 3,
            FrameFormat::Yuyv => 2,
            FrameFormat::Mjpeg => 0,
        }
    }

    /// Check if format is compressed
    pub fn is_compressed(&self) -> bool {
        matches!(self, FrameFormat::Mjpeg)
    }
}

/// A decoded image together with the moment it was acquired.
///
/// The pixel buffer is shared immutably: cloning a frame never copies pixels
/// and never exposes a buffer another task can mutate. Writers replace whole
/// frames, they do not edit them in place.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Sequence number assigned by the media handle
    pub id: u64,
    /// Acquisition time
    pub timestamp: SystemTime,
    pub data: Arc<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
}

impl Frame {
    pub fn new(
        id: u64,
        timestamp: SystemTime,
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: FrameFormat,
    ) -> Self {
        Self {
            id,
            timestamp,
            data: Arc::new(data),
            width,
            height,
            format,
        }
    }

    /// Build a frame from an existing luminance image
    pub fn from_luma(id: u64, image: GrayImage) -> Self {
        let (width, height) = image.dimensions();
        Self::new(
            id,
            SystemTime::now(),
            image.into_raw(),
            width,
            height,
            FrameFormat::Gray8,
        )
    }

    /// Get the expected frame size for uncompressed formats
    pub fn expected_size(&self) -> Option<usize> {
        if self.format.is_compressed() {
            None
        } else {
            Some(self.width as usize * self.height as usize * self.format.bytes_per_pixel())
        }
    }

    /// Validate frame data size against expected size
    pub fn validate_size(&self) -> bool {
        match self.expected_size() {
            Some(expected) => self.data.len() == expected,
            None => true,
        }
    }

    /// Convert to an 8-bit luminance image for analysis
    pub fn to_luma(&self) -> Result<GrayImage> {
        if !self.validate_size() {
            return Err(AnalysisError::FrameProcessing {
                details: format!(
                    "Frame {} has {} bytes, expected {:?} for {}x{} {:?}",
                    self.id,
                    self.data.len(),
                    self.expected_size(),
                    self.width,
                    self.height,
                    self.format
                ),
            }
            .into());
        }

        match self.format {
            FrameFormat::Gray8 => GrayImage::from_raw(self.width, self.height, self.data.to_vec())
                .ok_or_else(|| {
                    AnalysisError::FrameProcessing {
                        details: "Failed to create grayscale image from raw data".to_string(),
                    }
                    .into()
                }),
            FrameFormat::Rgb24 => self.rgb24_to_gray(false),
            FrameFormat::Bgr24 => self.rgb24_to_gray(true),
            FrameFormat::Yuyv => Ok(self.yuyv_to_gray()),
            FrameFormat::Mjpeg => {
                let decoded = image::load_from_memory(&self.data).map_err(|e| {
                    AnalysisError::FrameProcessing {
                        details: format!("MJPEG decode failed: {}", e),
                    }
                })?;
                Ok(decoded.to_luma8())
            }
        }
    }

    /// YUYV format: Y0 U Y1 V (4 bytes for 2 pixels)
    fn yuyv_to_gray(&self) -> GrayImage {
        let width = self.width;
        let height = self.height;
        let mut gray_image = GrayImage::new(width, height);

        for y in 0..height {
            for x in 0..(width / 2) {
                let base_idx = ((y * width / 2 + x) * 4) as usize;
                if base_idx + 3 < self.data.len() {
                    gray_image.put_pixel(x * 2, y, Luma([self.data[base_idx]]));
                    if x * 2 + 1 < width {
                        gray_image.put_pixel(x * 2 + 1, y, Luma([self.data[base_idx + 2]]));
                    }
                }
            }
        }

        gray_image
    }

    fn rgb24_to_gray(&self, bgr: bool) -> Result<GrayImage> {
        let rgb_image = RgbImage::from_raw(self.width, self.height, self.data.to_vec())
            .ok_or_else(|| AnalysisError::FrameProcessing {
                details: "Failed to create RGB image from raw data".to_string(),
            })?;

        let mut gray_image = GrayImage::new(self.width, self.height);
        for (x, y, px) in rgb_image.enumerate_pixels() {
            let (r, b) = if bgr { (px[2], px[0]) } else { (px[0], px[2]) };
            let gray_value = (0.299 * r as f32 + 0.587 * px[1] as f32 + 0.114 * b as f32) as u8;
            gray_image.put_pixel(x, y, Luma([gray_value]));
        }

        Ok(gray_image)
    }
}
