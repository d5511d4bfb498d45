//! Still image conversion
//!
//! Turns a raw camera buffer into an RGBA still and spools it as PNG.

use crate::capture::traits::{PixelFormat, RawFrame};
use crate::utils::error::{CaptureError, CaptureResult};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// An RGBA still captured from a raw frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StillImage {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl StillImage {
    /// Reject buffers that do not match their dimensions, without copying
    pub fn check(frame: &RawFrame) -> CaptureResult<()> {
        if frame.width == 0 || frame.height == 0 {
            return Err(CaptureError::FrameCapture(format!(
                "empty frame {}x{}",
                frame.width, frame.height
            )));
        }

        let pixels = frame.width as usize * frame.height as usize;
        let expected = pixels * frame.format.bytes_per_pixel();
        if frame.data.len() != expected {
            return Err(CaptureError::FrameCapture(format!(
                "buffer is {} bytes, expected {} for {}x{} {:?}",
                frame.data.len(),
                expected,
                frame.width,
                frame.height,
                frame.format
            )));
        }
        Ok(())
    }

    /// Convert a raw frame, rejecting buffers that do not match their
    /// dimensions. RGBA buffers are moved, not copied.
    pub fn from_owned(frame: RawFrame) -> CaptureResult<Self> {
        Self::check(&frame)?;
        let pixels = frame.width as usize * frame.height as usize;
        let rgba = match frame.format {
            PixelFormat::Rgba8 => frame.data,
            PixelFormat::Rgb8 => {
                // Add alpha channel
                let mut rgba = Vec::with_capacity(pixels * 4);
                for chunk in frame.data.chunks_exact(3) {
                    rgba.extend_from_slice(chunk);
                    rgba.push(255);
                }
                rgba
            }
        };

        Ok(Self {
            width: frame.width,
            height: frame.height,
            rgba,
        })
    }

    /// Write the still as an 8-bit RGBA PNG
    pub fn write_png(&self, path: &Path) -> CaptureResult<()> {
        let file = File::create(path)?;
        let mut encoder = png::Encoder::new(BufWriter::new(file), self.width, self.height);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        encoder.set_compression(png::Compression::Fast);

        let mut writer = encoder
            .write_header()
            .map_err(|e| CaptureError::FrameCapture(format!("PNG header error: {}", e)))?;
        writer
            .write_image_data(&self.rgba)
            .map_err(|e| CaptureError::FrameCapture(format!("PNG encode error: {}", e)))?;
        writer
            .finish()
            .map_err(|e| CaptureError::FrameCapture(format!("PNG finish error: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame(data: Vec<u8>, format: PixelFormat) -> RawFrame {
        RawFrame {
            data,
            width: 2,
            height: 1,
            format,
            captured_at: Duration::ZERO,
        }
    }

    #[test]
    fn test_rgb_gets_alpha() {
        let still = StillImage::from_owned(frame(vec![1, 2, 3, 4, 5, 6], PixelFormat::Rgb8)).unwrap();
        assert_eq!(still.rgba, vec![1, 2, 3, 255, 4, 5, 6, 255]);
    }

    #[test]
    fn test_short_buffer_is_rejected() {
        let result = StillImage::from_owned(frame(vec![0; 7], PixelFormat::Rgba8));
        assert!(matches!(result, Err(CaptureError::FrameCapture(_))));
    }

    #[test]
    fn test_check_matches_conversion() {
        assert!(StillImage::check(&frame(vec![0; 8], PixelFormat::Rgba8)).is_ok());
        assert!(StillImage::check(&frame(vec![0; 8], PixelFormat::Rgb8)).is_err());

        let still = StillImage::from_owned(frame(vec![7; 8], PixelFormat::Rgba8)).unwrap();
        assert_eq!((still.width, still.height), (2, 1));
        assert_eq!(still.rgba, vec![7; 8]);
    }

    #[test]
    fn test_write_png_produces_signature() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("still.png");
        let still = StillImage::from_owned(frame(vec![9; 8], PixelFormat::Rgba8)).unwrap();

        still.write_png(&path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..8], &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);
    }
}
