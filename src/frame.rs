//! In-memory video frames.
//!
//! A [`Frame`] is an owned H×W×3 byte buffer in BGR channel order plus its
//! dimensions. Frames are owned exclusively by the worker that read them;
//! the only copies ever made are the ones handed to the snapshot publisher
//! (annotation draws on a copy, never on the frame the detector chain sees).

use anyhow::{anyhow, Result};

use crate::geometry::BBox;

/// BGR colour triple for annotations.
pub type Bgr = [u8; 3];

/// Decoded video frame, BGR, row-major, 3 bytes per pixel.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Frame {
    /// Wrap an existing BGR buffer. The buffer length must be exactly
    /// `height * width * 3`.
    pub fn from_bgr(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "expected {} BGR bytes for {}x{}, got {}",
                expected,
                width,
                height,
                data.len()
            ));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Solid-colour frame.
    pub fn filled(width: u32, height: u32, color: Bgr) -> Self {
        let pixels = (width as usize) * (height as usize);
        let mut data = Vec::with_capacity(pixels * 3);
        for _ in 0..pixels {
            data.extend_from_slice(&color);
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// "HxW" string used in snapshot object metadata.
    pub fn shape_string(&self) -> String {
        format!("{}x{}", self.height, self.width)
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Bgr> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = ((y as usize) * (self.width as usize) + x as usize) * 3;
        Some([self.data[idx], self.data[idx + 1], self.data[idx + 2]])
    }

    /// Crop the box region expanded by `expand_ratio` of its own extent,
    /// clamped to the frame. Returns an error when the clamped region is
    /// degenerate.
    pub fn crop_expanded(&self, bbox: &BBox, expand_ratio: f32) -> Result<Frame> {
        let expand_w = (bbox.width() * expand_ratio) as i64;
        let expand_h = (bbox.height() * expand_ratio) as i64;

        let x1 = ((bbox.x1 as i64) - expand_w).clamp(0, self.width as i64) as u32;
        let y1 = ((bbox.y1 as i64) - expand_h).clamp(0, self.height as i64) as u32;
        let x2 = ((bbox.x2 as i64) + expand_w).clamp(0, self.width as i64) as u32;
        let y2 = ((bbox.y2 as i64) + expand_h).clamp(0, self.height as i64) as u32;

        if x2 <= x1 || y2 <= y1 {
            return Err(anyhow!(
                "crop region degenerate after clamping: ({},{})-({},{})",
                x1,
                y1,
                x2,
                y2
            ));
        }

        let crop_width = x2 - x1;
        let crop_height = y2 - y1;
        let mut data = Vec::with_capacity((crop_width as usize) * (crop_height as usize) * 3);
        for y in y1..y2 {
            let row_start = ((y as usize) * (self.width as usize) + x1 as usize) * 3;
            let row_end = row_start + (crop_width as usize) * 3;
            data.extend_from_slice(&self.data[row_start..row_end]);
        }
        Frame::from_bgr(crop_width, crop_height, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_bgr_validates_buffer_length() {
        assert!(Frame::from_bgr(4, 2, vec![0u8; 24]).is_ok());
        assert!(Frame::from_bgr(4, 2, vec![0u8; 23]).is_err());
    }

    #[test]
    fn filled_frame_has_uniform_pixels() {
        let frame = Frame::filled(3, 2, [10, 20, 30]);
        assert_eq!(frame.pixel(0, 0), Some([10, 20, 30]));
        assert_eq!(frame.pixel(2, 1), Some([10, 20, 30]));
        assert_eq!(frame.pixel(3, 0), None);
    }

    #[test]
    fn crop_expanded_clamps_to_frame() {
        let frame = Frame::filled(100, 100, [1, 2, 3]);
        let bbox = BBox::new(90.0, 90.0, 99.0, 99.0);
        let crop = frame.crop_expanded(&bbox, 0.5).unwrap();
        // Right/bottom expansion is clamped at the frame border.
        assert!(crop.width() <= 14);
        assert!(crop.height() <= 14);
        assert_eq!(crop.pixel(0, 0), Some([1, 2, 3]));
    }

    #[test]
    fn crop_of_out_of_frame_box_fails() {
        let frame = Frame::filled(10, 10, [0, 0, 0]);
        let bbox = BBox::new(50.0, 50.0, 60.0, 60.0);
        assert!(frame.crop_expanded(&bbox, 0.1).is_err());
    }

    #[test]
    fn shape_string_is_height_by_width() {
        let frame = Frame::filled(640, 480, [0, 0, 0]);
        assert_eq!(frame.shape_string(), "480x640");
    }
}
