//! Image → model input tensor.
//!
//! Mirrors the MobileNetV2 training pipeline: RGB, bilinear resize to a square,
//! then `x / 127.5 - 1.0` so every value lands in `[-1, 1]`.

use image::{imageops::FilterType, DynamicImage, RgbImage};

use crate::error::PreprocessError;

pub const INPUT_SIZE: u32 = 224;
pub const CHANNELS: usize = 3;

/// Memory order of the batch tensor handed to the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layout {
    /// `[1, H, W, C]`, the Keras convention.
    #[default]
    Nhwc,
    /// `[1, C, H, W]`, the PyTorch convention.
    Nchw,
}

/// Single-image batch of normalized `f32` pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    pub data: Vec<f32>,
    pub shape: [usize; 4],
    pub layout: Layout,
}

impl ImageTensor {
    pub fn zeros(size: u32, layout: Layout) -> Self {
        let s = size as usize;
        Self {
            data: vec![0.0; s * s * CHANNELS],
            shape: shape_for(s, layout),
            layout,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn stats(&self) -> TensorStats {
        TensorStats::of(&self.data)
    }
}

fn shape_for(size: usize, layout: Layout) -> [usize; 4] {
    match layout {
        Layout::Nhwc => [1, size, size, CHANNELS],
        Layout::Nchw => [1, CHANNELS, size, size],
    }
}

#[inline]
pub fn scale_channel(v: u8) -> f32 {
    v as f32 / 127.5 - 1.0
}

#[derive(Debug, Clone, Copy)]
pub struct Preprocessor {
    pub size: u32,
    pub layout: Layout,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self {
            size: INPUT_SIZE,
            layout: Layout::Nhwc,
        }
    }
}

impl Preprocessor {
    pub fn new(size: u32, layout: Layout) -> Self {
        Self { size, layout }
    }

    /// Decode raw bytes and build the batch tensor.
    pub fn process(&self, bytes: &[u8]) -> Result<ImageTensor, PreprocessError> {
        let img = image::load_from_memory(bytes)?;
        tracing::debug!(
            "decoded image {}x{} color={:?}",
            img.width(),
            img.height(),
            img.color()
        );
        Ok(self.process_image(&img))
    }

    pub fn process_image(&self, img: &DynamicImage) -> ImageTensor {
        let rgb = img.to_rgb8();
        let resized = if rgb.width() == self.size && rgb.height() == self.size {
            rgb
        } else {
            // Triangle is the bilinear filter
            image::imageops::resize(&rgb, self.size, self.size, FilterType::Triangle)
        };
        self.to_tensor(&resized)
    }

    fn to_tensor(&self, rgb: &RgbImage) -> ImageTensor {
        let s = self.size as usize;
        let data = match self.layout {
            Layout::Nhwc => rgb.as_raw().iter().map(|v| scale_channel(*v)).collect(),
            Layout::Nchw => {
                let plane = s * s;
                let mut data = vec![0.0f32; plane * CHANNELS];
                for (i, px) in rgb.pixels().enumerate() {
                    for c in 0..CHANNELS {
                        data[c * plane + i] = scale_channel(px[c]);
                    }
                }
                data
            }
        };
        ImageTensor {
            data,
            shape: shape_for(s, self.layout),
            layout: self.layout,
        }
    }
}

/// Summary used by the `LOG_PRED` debug signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TensorStats {
    pub len: usize,
    pub mean: f32,
    pub std: f32,
    pub min: f32,
    pub max: f32,
}

impl TensorStats {
    pub fn of(v: &[f32]) -> Self {
        let len = v.len();
        let mean = if len == 0 { 0.0 } else { v.iter().sum::<f32>() / len as f32 };
        let std = if len < 2 {
            0.0
        } else {
            (v.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / len as f32).sqrt()
        };
        let min = v.iter().copied().fold(f32::INFINITY, f32::min);
        let max = v.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        Self { len, mean, std, min, max }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, ImageFormat, Luma, Rgb, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png_bytes(img: DynamicImage) -> Vec<u8> {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
        buf
    }

    #[test]
    fn scale_endpoints() {
        assert_eq!(scale_channel(0), -1.0);
        assert_eq!(scale_channel(255), 1.0);
        assert!((scale_channel(128) - 0.003_921_6).abs() < 1e-6);
    }

    #[test]
    fn shape_and_range_nhwc() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 30, Rgb([255, 0, 128])));
        let t = Preprocessor::default().process(&png_bytes(img)).unwrap();
        assert_eq!(t.shape, [1, 224, 224, 3]);
        assert_eq!(t.len(), 224 * 224 * 3);
        assert!(t.data.iter().all(|v| (-1.0..=1.0).contains(v)));
        // solid color survives the resize
        assert_eq!(&t.data[..3], &[1.0, -1.0, scale_channel(128)]);
    }

    #[test]
    fn nchw_puts_channels_in_planes() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([255, 0, 0])));
        let t = Preprocessor::new(4, Layout::Nchw).process_image(&img);
        assert_eq!(t.shape, [1, 3, 4, 4]);
        assert!(t.data[..16].iter().all(|v| *v == 1.0));
        assert!(t.data[16..].iter().all(|v| *v == -1.0));
    }

    #[test]
    fn grayscale_and_alpha_are_converted_to_rgb() {
        let gray = DynamicImage::ImageLuma8(GrayImage::from_pixel(10, 10, Luma([255])));
        let t = Preprocessor::default().process(&png_bytes(gray)).unwrap();
        assert_eq!(t.len(), 224 * 224 * 3);
        assert!(t.data.iter().all(|v| *v == 1.0));

        let rgba = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([0, 0, 0, 10])));
        let t = Preprocessor::default().process(&png_bytes(rgba)).unwrap();
        assert!(t.data.iter().all(|v| *v == -1.0));
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let err = Preprocessor::default().process(b"definitely not an image").unwrap_err();
        assert!(err.to_string().starts_with("Invalid image"));
    }

    #[test]
    fn stats_of_known_vector() {
        let s = TensorStats::of(&[-1.0, 1.0]);
        assert_eq!(s.len, 2);
        assert_eq!(s.mean, 0.0);
        assert_eq!(s.std, 1.0);
        assert_eq!((s.min, s.max), (-1.0, 1.0));
    }
}
