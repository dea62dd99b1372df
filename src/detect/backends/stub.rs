use anyhow::{anyhow, Result};

use crate::detect::backend::InferenceBackend;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

/// Stub backend for tests and demos.
///
/// Replays a fixed script of per-frame detections, cycling when it reaches the end.
/// Boxes in the script are fractions of the frame size and are scaled on each call.
pub struct StubBackend {
    script: Vec<Vec<Detection>>,
    cursor: usize,
    calls: u64,
}

impl StubBackend {
    pub fn new(script: Vec<Vec<Detection>>) -> Self {
        Self {
            script,
            cursor: 0,
            calls: 0,
        }
    }

    /// Backend that never reports anything.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Build from a `stub://` model path.
    ///
    /// - `stub://empty`: no detections.
    /// - `stub://compliant`: every frame shows all equipment worn.
    /// - `stub://violation`: every frame shows a helmet and missing gloves.
    /// - anything else: alternates compliant and violation frames.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let name = uri
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("stub backend path must start with stub://, got {}", uri))?;
        let compliant = vec![
            Detection::new(0, 0.88, BoundingBox::new(0.35, 0.15, 0.65, 0.25)),
            Detection::new(1, 0.93, BoundingBox::new(0.30, 0.02, 0.70, 0.15)),
            Detection::new(2, 0.81, BoundingBox::new(0.10, 0.55, 0.25, 0.70)),
            Detection::new(3, 0.77, BoundingBox::new(0.25, 0.10, 0.35, 0.25)),
        ];
        let violation = vec![
            Detection::new(1, 0.91, BoundingBox::new(0.30, 0.02, 0.70, 0.15)),
            Detection::new(6, 0.82, BoundingBox::new(0.10, 0.55, 0.25, 0.70)),
        ];
        let script = match name {
            "empty" => Vec::new(),
            "compliant" => vec![compliant],
            "violation" => vec![violation],
            _ => vec![compliant, violation],
        };
        Ok(Self::new(script))
    }

    /// Number of frames inferred so far.
    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::empty()
    }
}

impl InferenceBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        self.calls += 1;
        if self.script.is_empty() {
            return Ok(Vec::new());
        }
        let step = &self.script[self.cursor % self.script.len()];
        self.cursor = (self.cursor + 1) % self.script.len();

        let w = frame.width as f32;
        let h = frame.height as f32;
        Ok(step
            .iter()
            .map(|d| {
                Detection::new(
                    d.class_id,
                    d.confidence,
                    BoundingBox::new(d.bbox.x1 * w, d.bbox.y1 * h, d.bbox.x2 * w, d.bbox.y2 * h),
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_cycles_and_scales_boxes() -> Result<()> {
        let mut backend = StubBackend::from_uri("stub://alternate")?;
        let frame = Frame::filled(100, 200, 3, 0);

        let first = backend.infer(&frame)?;
        assert!(first.iter().all(|d| !d.is_absent()));
        let helmet = first[1].bbox;
        for (got, want) in [(helmet.x1, 30.0), (helmet.y1, 4.0), (helmet.x2, 70.0), (helmet.y2, 30.0)] {
            assert!((got - want).abs() < 1e-3, "{} != {}", got, want);
        }

        let second = backend.infer(&frame)?;
        assert_eq!(second.iter().map(|d| d.class_id).collect::<Vec<_>>(), vec![1, 6]);

        let third = backend.infer(&frame)?;
        assert_eq!(third, first);
        assert_eq!(backend.calls(), 3);
        Ok(())
    }

    #[test]
    fn empty_script_reports_nothing() -> Result<()> {
        let mut backend = StubBackend::from_uri("stub://empty")?;
        assert!(backend.infer(&Frame::filled(4, 4, 3, 0))?.is_empty());
        assert!(StubBackend::from_uri("model.pt").is_err());
        Ok(())
    }
}
