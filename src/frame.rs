//! Frame buffers flowing through the detection pipeline.
//!
//! - `Frame`: owned, tightly packed `height x width x channels` pixel buffer.
//!
//! Every pipeline step owns the frame it is working on. Handing a frame to another
//! thread (alert notification, evidence persistence) means cloning or encoding it
//! first; frames are never shared by reference across threads.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage};

/// JPEG quality used for evidence snapshots.
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Owned pixel buffer. Channel order for 3-channel frames is RGB.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

impl Frame {
    /// Wrap a pixel buffer, validating that its length matches the shape.
    pub fn new(data: Vec<u8>, width: u32, height: u32, channels: u8) -> Result<Self> {
        if channels == 0 {
            return Err(anyhow!("frame must have at least one channel"));
        }
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(channels as usize))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame length mismatch: expected {} bytes for {}x{}x{}, got {}",
                expected,
                width,
                height,
                channels,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            channels,
        })
    }

    /// Wrap a packed RGB24 buffer.
    pub fn rgb(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        Self::new(data, width, height, 3)
    }

    /// Frame with every byte set to `value`.
    pub fn filled(width: u32, height: u32, channels: u8, value: u8) -> Self {
        let len = width as usize * height as usize * channels as usize;
        Self {
            data: vec![value; len],
            width,
            height,
            channels,
        }
    }

    /// Decode a JPEG (or any format `image` was built with) into an RGB frame.
    pub fn from_jpeg(bytes: &[u8]) -> Result<Self> {
        let decoded = image::load_from_memory(bytes).context("decode jpeg")?;
        let rgb = decoded.into_rgb8();
        let (width, height) = rgb.dimensions();
        Self::rgb(rgb.into_raw(), width, height)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Number of pixels (not bytes).
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Channel values of the pixel at (`x`, `y`).
    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let c = self.channels as usize;
        let start = (y as usize * self.width as usize + x as usize) * c;
        self.data.get(start..start + c)
    }

    /// Run `f` over an RGB view of this frame, writing any changes back in place.
    ///
    /// Only 3-channel frames can be drawn on; other layouts are rejected.
    pub(crate) fn with_rgb_image<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut RgbImage),
    {
        if self.channels != 3 {
            return Err(anyhow!(
                "cannot draw on a {}-channel frame",
                self.channels
            ));
        }
        let mut img = RgbImage::from_raw(self.width, self.height, std::mem::take(&mut self.data))
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;
        f(&mut img);
        self.data = img.into_raw();
        Ok(())
    }

    /// Encode as JPEG. Alpha is dropped for 4-channel frames.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let stripped;
        let (pixels, color) = match self.channels {
            1 => (self.data.as_slice(), ExtendedColorType::L8),
            3 => (self.data.as_slice(), ExtendedColorType::Rgb8),
            4 => {
                stripped = self
                    .data
                    .chunks_exact(4)
                    .flat_map(|px| [px[0], px[1], px[2]])
                    .collect::<Vec<u8>>();
                (stripped.as_slice(), ExtendedColorType::Rgb8)
            }
            other => return Err(anyhow!("cannot encode {}-channel frame as jpeg", other)),
        };

        let mut out = Vec::new();
        {
            let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
            encoder
                .encode(pixels, self.width, self.height, color)
                .context("encode jpeg")?;
        }
        Ok(out)
    }
}
