//! Pre-detection image adjustments.
//!
//! `adjust` is a pure function: it copies the input frame and applies, in order,
//! brightness, contrast, sharpness and grayscale. With brightness 100, contrast 100,
//! sharpness 0 and grayscale off the output is pixel-for-pixel identical to the input.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::frame::Frame;

pub const BRIGHTNESS_MAX: u16 = 200;
pub const CONTRAST_MAX: u16 = 200;
pub const SHARPNESS_MAX: u8 = 10;

/// Neutral point for brightness and contrast.
pub const NEUTRAL: u16 = 100;

/// 3x3 Gaussian-like kernel; divided by 16 it sums to 1.
const SMOOTH_KERNEL: [[f32; 3]; 3] = [[1.0, 2.0, 1.0], [2.0, 4.0, 2.0], [1.0, 2.0, 1.0]];
const SMOOTH_KERNEL_SUM: f32 = 16.0;

/// Adjustment parameters as shown on the settings sliders.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjustments {
    /// 0..=200, additive offset of `brightness - 100`.
    pub brightness: u16,
    /// 0..=200, multiplicative scale of `contrast / 100`.
    pub contrast: u16,
    /// 0..=10, weight of the 3x3 kernel; 0 disables filtering.
    pub sharpness: u8,
    pub grayscale: bool,
}

impl Default for Adjustments {
    fn default() -> Self {
        Self {
            brightness: NEUTRAL,
            contrast: NEUTRAL,
            sharpness: 0,
            grayscale: false,
        }
    }
}

impl Adjustments {
    pub fn validate(&self) -> Result<()> {
        if self.brightness > BRIGHTNESS_MAX {
            return Err(anyhow!(
                "brightness must be within 0..={}, got {}",
                BRIGHTNESS_MAX,
                self.brightness
            ));
        }
        if self.contrast > CONTRAST_MAX {
            return Err(anyhow!(
                "contrast must be within 0..={}, got {}",
                CONTRAST_MAX,
                self.contrast
            ));
        }
        if self.sharpness > SHARPNESS_MAX {
            return Err(anyhow!(
                "sharpness must be within 0..={}, got {}",
                SHARPNESS_MAX,
                self.sharpness
            ));
        }
        Ok(())
    }

    pub fn is_identity(&self) -> bool {
        self.brightness == NEUTRAL
            && self.contrast == NEUTRAL
            && self.sharpness == 0
            && !self.grayscale
    }
}

/// Apply `settings` to a copy of `frame`.
///
/// Out-of-range settings are clamped to their slider range.
pub fn adjust(frame: &Frame, settings: &Adjustments) -> Frame {
    let mut out = frame.clone();
    if settings.is_identity() {
        return out;
    }

    let brightness = settings.brightness.min(BRIGHTNESS_MAX);
    let contrast = settings.contrast.min(CONTRAST_MAX);
    if brightness != NEUTRAL || contrast != NEUTRAL {
        let lut = tone_table(brightness, contrast);
        for byte in out.as_bytes_mut() {
            *byte = lut[*byte as usize];
        }
    }

    let sharpness = settings.sharpness.min(SHARPNESS_MAX);
    if sharpness > 0 {
        out = convolve3x3(&out, sharpness as f32 / SMOOTH_KERNEL_SUM);
    }

    if settings.grayscale {
        to_grayscale_in_place(&mut out);
    }

    out
}

/// Brightness then contrast folded into one lookup table. A darkening offset
/// that drives a value below zero yields its magnitude, then both steps saturate.
fn tone_table(brightness: u16, contrast: u16) -> [u8; 256] {
    let offset = brightness as f32 - NEUTRAL as f32;
    let scale = contrast as f32 / NEUTRAL as f32;
    let mut lut = [0u8; 256];
    for (value, entry) in lut.iter_mut().enumerate() {
        let brightened = clamp_to_u8((value as f32 + offset).abs());
        *entry = clamp_to_u8(brightened as f32 * scale);
    }
    lut
}

/// Per-channel 3x3 convolution of `SMOOTH_KERNEL * weight`, reflect-101 borders.
fn convolve3x3(frame: &Frame, weight: f32) -> Frame {
    let w = frame.width as usize;
    let h = frame.height as usize;
    let c = frame.channels as usize;
    let src = frame.as_bytes();
    let mut out = frame.clone();
    if w == 0 || h == 0 {
        return out;
    }
    let dst = out.as_bytes_mut();

    for y in 0..h {
        for x in 0..w {
            for ch in 0..c {
                let mut acc = 0.0f32;
                for (ky, row) in SMOOTH_KERNEL.iter().enumerate() {
                    let sy = reflect101(y as isize + ky as isize - 1, h);
                    for (kx, k) in row.iter().enumerate() {
                        let sx = reflect101(x as isize + kx as isize - 1, w);
                        acc += k * src[(sy * w + sx) * c + ch] as f32;
                    }
                }
                dst[(y * w + x) * c + ch] = clamp_to_u8(acc * weight);
            }
        }
    }
    out
}

fn reflect101(i: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let n = len as isize;
    let reflected = if i < 0 {
        -i
    } else if i >= n {
        2 * n - 2 - i
    } else {
        i
    };
    reflected.clamp(0, n - 1) as usize
}

/// Collapse RGB to luminance and write it back to the colour channels.
///
/// The channel count is unchanged; a fourth (alpha) channel is left as is.
fn to_grayscale_in_place(frame: &mut Frame) {
    let c = frame.channels as usize;
    if c < 3 {
        return;
    }
    for px in frame.as_bytes_mut().chunks_exact_mut(c) {
        let luma = clamp_to_u8(0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32);
        px[0] = luma;
        px[1] = luma;
        px[2] = luma;
    }
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32, channels: u8) -> Frame {
        let len = (width * height * channels as u32) as usize;
        let data = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        Frame::new(data, width, height, channels).unwrap()
    }

    #[test]
    fn neutral_settings_are_identity() {
        let frame = gradient(9, 5, 3);
        let out = adjust(&frame, &Adjustments::default());
        assert_eq!(out, frame);
    }

    #[test]
    fn input_frame_is_not_mutated() {
        let frame = gradient(6, 6, 3);
        let before = frame.clone();
        let settings = Adjustments {
            brightness: 180,
            contrast: 40,
            sharpness: 3,
            grayscale: true,
        };
        let out = adjust(&frame, &settings);
        assert_eq!(frame, before);
        assert_ne!(out, before);
    }

    #[test]
    fn grayscale_preserves_shape_and_equalises_channels() {
        for channels in [1u8, 3, 4] {
            let frame = gradient(5, 4, channels);
            let out = adjust(
                &frame,
                &Adjustments {
                    grayscale: true,
                    ..Adjustments::default()
                },
            );
            assert_eq!(
                (out.width, out.height, out.channels),
                (frame.width, frame.height, frame.channels)
            );
            assert_eq!(out.as_bytes().len(), frame.as_bytes().len());
            if channels >= 3 {
                for px in out.as_bytes().chunks_exact(channels as usize) {
                    assert_eq!(px[0], px[1]);
                    assert_eq!(px[1], px[2]);
                }
            }
        }

        let red = Frame::rgb(vec![255, 0, 0], 1, 1).unwrap();
        let gray = adjust(
            &red,
            &Adjustments {
                grayscale: true,
                ..Adjustments::default()
            },
        );
        assert_eq!(gray.as_bytes(), &[76, 76, 76]);
    }

    #[test]
    fn brightness_offset_folds_negatives_and_saturates() {
        let frame = Frame::new(vec![0, 20, 100, 230], 2, 2, 1).unwrap();
        let brighter = adjust(
            &frame,
            &Adjustments {
                brightness: 150,
                ..Adjustments::default()
            },
        );
        assert_eq!(brighter.as_bytes(), &[50, 70, 150, 255]);

        let darker = adjust(
            &frame,
            &Adjustments {
                brightness: 70,
                ..Adjustments::default()
            },
        );
        assert_eq!(darker.as_bytes(), &[30, 10, 70, 200]);

        let darkest = adjust(
            &frame,
            &Adjustments {
                brightness: 0,
                ..Adjustments::default()
            },
        );
        assert_eq!(darkest.as_bytes(), &[100, 80, 0, 130]);
    }

    #[test]
    fn contrast_scales_after_brightness() {
        let frame = Frame::new(vec![10, 100, 200, 250], 2, 2, 1).unwrap();
        let out = adjust(
            &frame,
            &Adjustments {
                contrast: 50,
                ..Adjustments::default()
            },
        );
        assert_eq!(out.as_bytes(), &[5, 50, 100, 125]);

        let both = adjust(
            &frame,
            &Adjustments {
                brightness: 110,
                contrast: 200,
                ..Adjustments::default()
            },
        );
        assert_eq!(both.as_bytes(), &[40, 220, 255, 255]);
    }

    #[test]
    fn sharpness_kernel_sums_to_one_at_unit_weight() {
        let flat = Frame::filled(7, 5, 3, 90);
        let unit = adjust(
            &flat,
            &Adjustments {
                sharpness: 1,
                ..Adjustments::default()
            },
        );
        assert_eq!(unit, flat);

        let doubled = adjust(
            &flat,
            &Adjustments {
                sharpness: 2,
                ..Adjustments::default()
            },
        );
        assert!(doubled.as_bytes().iter().all(|&v| v == 180));
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        assert!(Adjustments::default().validate().is_ok());
        assert!(Adjustments {
            brightness: 201,
            ..Adjustments::default()
        }
        .validate()
        .is_err());
        assert!(Adjustments {
            sharpness: 11,
            ..Adjustments::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn reflect101_mirrors_without_repeating_the_edge() {
        assert_eq!(reflect101(-1, 5), 1);
        assert_eq!(reflect101(5, 5), 3);
        assert_eq!(reflect101(2, 5), 2);
        assert_eq!(reflect101(-1, 1), 0);
    }
}
