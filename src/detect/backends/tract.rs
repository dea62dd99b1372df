#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::catalog::CLASS_COUNT;
use crate::detect::backend::InferenceBackend;
use crate::detect::result::{non_max_suppression, BoundingBox, Detection};
use crate::frame::Frame;

/// Square input edge of the exported YOLOv8 model.
pub const DEFAULT_INPUT_SIZE: u32 = 640;

/// Per-class IoU above which the weaker box is suppressed.
const IOU_THRESHOLD: f32 = 0.45;

/// Candidates below this score are dropped before NMS to bound its cost.
const CANDIDATE_FLOOR: f32 = 0.01;

/// Tract-based backend for a YOLOv8 ONNX export.
///
/// Output layout is `[1, 4 + classes, anchors]`: rows 0..4 are `cx, cy, w, h` in
/// model input pixels, the remaining rows are per-class scores.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(0, f32::fact([1, 3, side, side]).into())
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self { model, input_size })
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let rgb = to_rgb_image(frame)?;
        let resized = image::imageops::resize(
            &rgb,
            self.input_size,
            self.input_size,
            FilterType::Triangle,
        );
        let side = self.input_size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn decode(&self, output: &Tensor, frame: &Frame) -> Result<Vec<Detection>> {
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
            return Err(anyhow!("unexpected YOLO output shape {:?}", shape));
        }
        let rows = shape[1];
        let anchors = shape[2];
        let classes = (rows - 4).min(CLASS_COUNT);
        let data = view
            .as_slice()
            .ok_or_else(|| anyhow!("model output is not contiguous"))?;

        let scale_x = frame.width as f32 / self.input_size as f32;
        let scale_y = frame.height as f32 / self.input_size as f32;

        let mut candidates = Vec::new();
        for i in 0..anchors {
            let (mut best_class, mut best_score) = (0usize, f32::NEG_INFINITY);
            for c in 0..classes {
                let score = data[(4 + c) * anchors + i];
                if score > best_score {
                    best_class = c;
                    best_score = score;
                }
            }
            if best_score < CANDIDATE_FLOOR {
                continue;
            }
            let cx = data[i];
            let cy = data[anchors + i];
            let w = data[2 * anchors + i];
            let h = data[3 * anchors + i];
            let bbox = BoundingBox::new(
                ((cx - w / 2.0) * scale_x).max(0.0),
                ((cy - h / 2.0) * scale_y).max(0.0),
                ((cx + w / 2.0) * scale_x).min(frame.width as f32),
                ((cy + h / 2.0) * scale_y).min(frame.height as f32),
            );
            candidates.push(Detection::new(best_class as u32, best_score, bbox));
        }

        Ok(non_max_suppression(candidates, IOU_THRESHOLD))
    }
}

impl InferenceBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        self.decode(output, frame)
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = Frame::filled(self.input_size, self.input_size, 3, 0);
        self.infer(&blank).map(|_| ())
    }
}

fn to_rgb_image(frame: &Frame) -> Result<RgbImage> {
    let c = frame.channels as usize;
    let rgb: Vec<u8> = match c {
        3 => frame.as_bytes().to_vec(),
        1 => frame.as_bytes().iter().flat_map(|&v| [v, v, v]).collect(),
        4 => frame
            .as_bytes()
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect(),
        other => return Err(anyhow!("cannot infer on a {}-channel frame", other)),
    };
    RgbImage::from_raw(frame.width, frame.height, rgb)
        .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))
}
