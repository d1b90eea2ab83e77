//! WebP re-encoding for mirrored images.
//!
//! Images are decoded in whatever format they arrived in, shrunk to fit a
//! square bound (never enlarged) and encoded as lossy WebP.

use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};

use super::StepError;

pub const DEFAULT_MAX_DIMENSION: u32 = 1200;
pub const DEFAULT_WEBP_QUALITY: f32 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WebpTranscoder {
    /// Longest allowed side, in pixels.
    pub max_dimension: u32,
    /// libwebp quality, 0 to 100.
    pub quality: f32,
}

impl Default for WebpTranscoder {
    fn default() -> Self {
        Self {
            max_dimension: DEFAULT_MAX_DIMENSION,
            quality: DEFAULT_WEBP_QUALITY,
        }
    }
}

impl WebpTranscoder {
    pub fn new(max_dimension: u32, quality: f32) -> Self {
        Self {
            max_dimension,
            quality,
        }
    }

    /// Transcode on the blocking pool.
    pub async fn transcode(&self, data: Vec<u8>) -> Result<Vec<u8>, StepError> {
        let transcoder = *self;
        tokio::task::spawn_blocking(move || transcoder.transcode_blocking(&data))
            .await
            .map_err(|e| StepError::Io(format!("transcode task failed: {e}")))?
    }

    pub fn transcode_blocking(&self, data: &[u8]) -> Result<Vec<u8>, StepError> {
        let img = ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .map_err(|e| StepError::Io(e.to_string()))?
            .decode()
            .map_err(|e| StepError::Malformed(format!("undecodable image: {e}")))?;

        let img = self.fit(img);
        let rgba = img.to_rgba8();
        let encoded = webp::Encoder::from_rgba(rgba.as_raw(), rgba.width(), rgba.height())
            .encode(self.quality);
        Ok(encoded.to_vec())
    }

    fn fit(&self, img: DynamicImage) -> DynamicImage {
        let max = self.max_dimension;
        if img.width() <= max && img.height() <= max {
            return img;
        }
        // resize keeps the aspect ratio inside the max x max box.
        img.resize(max, max, FilterType::Lanczos3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([180, 40, 40]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn dimensions(webp: &[u8]) -> (u32, u32) {
        let img = ImageReader::with_format(Cursor::new(webp), ImageFormat::WebP)
            .decode()
            .unwrap();
        (img.width(), img.height())
    }

    #[test]
    fn large_images_shrink_to_fit() {
        let out = WebpTranscoder::default().transcode_blocking(&png(2400, 600)).unwrap();
        assert_eq!(&out[..4], b"RIFF");
        assert_eq!(&out[8..12], b"WEBP");
        assert_eq!(dimensions(&out), (1200, 300));
    }

    #[test]
    fn small_images_are_not_enlarged() {
        let out = WebpTranscoder::default().transcode_blocking(&png(300, 500)).unwrap();
        assert_eq!(dimensions(&out), (300, 500));
    }

    #[test]
    fn garbage_is_malformed() {
        let err = WebpTranscoder::default()
            .transcode_blocking(b"<html>not an image</html>")
            .unwrap_err();
        assert!(matches!(err, StepError::Malformed(_)), "{err:?}");
    }
}
