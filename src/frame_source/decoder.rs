//! Video decode seam.
//!
//! The contract is deliberately small: opening an HLS playlist URL yields
//! a reader, and a reader yields decoded BGR frames until the transport
//! fails. The codec is not part of the contract.
//!
//! A real deployment puts GStreamer or FFmpeg behind [`VideoDecoder`]; the
//! in-tree [`SyntheticDecoder`] produces moving test-pattern frames so the
//! pipeline can run end to end without a camera.

use anyhow::Result;

use crate::frame::Frame;

/// An open decode session against one session URL.
pub trait VideoReader: Send {
    /// Next decoded frame, or `None` on transport/decode failure. A reader
    /// that returned `None` is torn down and reopened by the source.
    fn read(&mut self) -> Option<Frame>;
}

/// Opens decode sessions.
pub trait VideoDecoder: Send {
    fn open(&mut self, url: &str) -> Result<Box<dyn VideoReader>>;
}

/// Decoder producing synthetic frames: a gradient with a bright bar that
/// advances each frame, so consecutive frames differ.
pub struct SyntheticDecoder {
    width: u32,
    height: u32,
}

impl SyntheticDecoder {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for SyntheticDecoder {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

impl VideoDecoder for SyntheticDecoder {
    fn open(&mut self, _url: &str) -> Result<Box<dyn VideoReader>> {
        Ok(Box::new(SyntheticReader {
            width: self.width,
            height: self.height,
            frame_index: 0,
        }))
    }
}

struct SyntheticReader {
    width: u32,
    height: u32,
    frame_index: u64,
}

impl VideoReader for SyntheticReader {
    fn read(&mut self) -> Option<Frame> {
        self.frame_index += 1;
        let bar_x = (self.frame_index * 7) % self.width as u64;

        let mut data = Vec::with_capacity((self.width as usize) * (self.height as usize) * 3);
        for y in 0..self.height {
            for x in 0..self.width {
                if u64::from(x) == bar_x {
                    data.extend_from_slice(&[255, 255, 255]);
                } else {
                    let shade = ((x + y) % 256) as u8;
                    data.extend_from_slice(&[shade, shade / 2, 255 - shade]);
                }
            }
        }
        // Buffer length is correct by construction.
        Frame::from_bgr(self.width, self.height, data).ok()
    }
}
