//! Box and label drawing on annotated frames.

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;

use crate::catalog::EquipmentCatalog;
use crate::detect::result::Detection;
use crate::frame::Frame;

pub const ABSENT_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
pub const PRESENT_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

const BOX_THICKNESS: i32 = 2;
const BANNER_HEIGHT: i32 = 30;
const BANNER_CHAR_WIDTH: i32 = 12;
const TEXT_SCALE: f32 = 20.0;

/// Load a TrueType/OpenType font for label text.
pub fn load_label_font(path: &Path) -> Result<FontArc> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("read label font {}", path.display()))?;
    FontArc::try_from_vec(bytes).with_context(|| format!("parse label font {}", path.display()))
}

pub fn label_text(catalog: &EquipmentCatalog, detection: &Detection) -> String {
    format!("{} {:.2}", catalog.label(detection.class_id), detection.confidence)
}

/// Draw every detection onto `frame` in place.
///
/// Frames that are not 3-channel are left untouched; annotation is cosmetic.
pub fn annotate(
    frame: &mut Frame,
    detections: &[Detection],
    catalog: &EquipmentCatalog,
    font: Option<&FontArc>,
) -> Result<()> {
    if detections.is_empty() || frame.channels != 3 {
        return Ok(());
    }
    frame.with_rgb_image(|img| {
        for detection in detections {
            let color = if detection.is_absent() {
                ABSENT_COLOR
            } else {
                PRESENT_COLOR
            };
            draw_detection(img, detection, &label_text(catalog, detection), color, font);
        }
    })
}

fn draw_detection(
    img: &mut RgbImage,
    detection: &Detection,
    label: &str,
    color: Rgb<u8>,
    font: Option<&FontArc>,
) {
    let x1 = detection.bbox.x1.round() as i32;
    let y1 = detection.bbox.y1.round() as i32;
    let x2 = detection.bbox.x2.round() as i32;
    let y2 = detection.bbox.y2.round() as i32;

    for inset in 0..BOX_THICKNESS {
        let w = x2 - x1 - 2 * inset;
        let h = y2 - y1 - 2 * inset;
        if w <= 0 || h <= 0 {
            break;
        }
        draw_hollow_rect_mut(
            img,
            Rect::at(x1 + inset, y1 + inset).of_size(w as u32, h as u32),
            color,
        );
    }

    let banner_w = (label.chars().count() as i32 * BANNER_CHAR_WIDTH).max(1);
    draw_filled_rect_mut(
        img,
        Rect::at(x1, y1 - BANNER_HEIGHT).of_size(banner_w as u32, BANNER_HEIGHT as u32),
        color,
    );

    if let Some(font) = font {
        draw_text_mut(
            img,
            TEXT_COLOR,
            x1,
            y1 - BANNER_HEIGHT + 5,
            PxScale::from(TEXT_SCALE),
            font,
            label,
        );
    }
}
