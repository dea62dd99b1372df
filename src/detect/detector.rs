use std::sync::Arc;

use ab_glyph::FontArc;
use anyhow::{anyhow, Result};

use crate::catalog::EquipmentCatalog;
use crate::detect::annotate::annotate;
use crate::detect::backend::InferenceBackend;
use crate::detect::backends::open_backend;
use crate::detect::result::DetectionResult;
use crate::frame::Frame;

/// What one call to [`Detector::detect`] produces.
#[derive(Clone, Debug)]
pub struct DetectorOutput {
    /// Copy of the input with boxes and labels drawn on it.
    pub annotated: Frame,
    /// Names of missing equipment in detection order, duplicates kept.
    pub missing: Vec<String>,
    /// Class id of every surviving detection, in detection order.
    pub class_ids: Vec<u32>,
    pub result: DetectionResult,
}

impl DetectorOutput {
    pub fn has_violation(&self) -> bool {
        !self.missing.is_empty()
    }
}

/// Runs one inference per frame, filters by confidence and annotates.
pub struct Detector {
    backend: Box<dyn InferenceBackend>,
    catalog: Arc<EquipmentCatalog>,
    min_confidence: f32,
    font: Option<FontArc>,
}

impl Detector {
    pub fn new(
        backend: Box<dyn InferenceBackend>,
        catalog: Arc<EquipmentCatalog>,
        min_confidence: f32,
    ) -> Result<Self> {
        validate_confidence(min_confidence)?;
        Ok(Self {
            backend,
            catalog,
            min_confidence,
            font: None,
        })
    }

    /// Load the backend for `model_path` and warm it up.
    ///
    /// Any load failure is returned as is; there is no fallback backend.
    pub fn load(
        model_path: &str,
        catalog: Arc<EquipmentCatalog>,
        min_confidence: f32,
    ) -> Result<Self> {
        let mut backend = open_backend(model_path)?;
        backend.warm_up()?;
        log::info!("detector: loaded {} backend from {}", backend.name(), model_path);
        Self::new(backend, catalog, min_confidence)
    }

    pub fn with_font(mut self, font: FontArc) -> Self {
        self.font = Some(font);
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn catalog(&self) -> &Arc<EquipmentCatalog> {
        &self.catalog
    }

    pub fn min_confidence(&self) -> f32 {
        self.min_confidence
    }

    /// Takes effect on the next call to `detect`.
    pub fn set_min_confidence(&mut self, min_confidence: f32) -> Result<()> {
        validate_confidence(min_confidence)?;
        self.min_confidence = min_confidence;
        Ok(())
    }

    pub fn detect(&mut self, frame: &Frame) -> Result<DetectorOutput> {
        let raw = self.backend.infer(frame)?;
        let kept: Vec<_> = raw
            .into_iter()
            .filter(|d| d.confidence > self.min_confidence)
            .collect();
        let result = DetectionResult::new(kept);

        if log::log_enabled!(log::Level::Debug) {
            let names: Vec<String> = result
                .detections
                .iter()
                .map(|d| self.catalog.label(d.class_id))
                .collect();
            log::debug!("detected classes: {:?}", names);
        }

        let mut annotated = frame.clone();
        if let Err(err) = annotate(
            &mut annotated,
            &result.detections,
            &self.catalog,
            self.font.as_ref(),
        ) {
            log::debug!("annotation skipped: {}", err);
        }

        Ok(DetectorOutput {
            annotated,
            missing: result.missing_names(&self.catalog),
            class_ids: result.class_ids(),
            result,
        })
    }
}

fn validate_confidence(value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(anyhow!("min_confidence must be within 0..=1, got {}", value));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::StubBackend;
    use crate::detect::result::{BoundingBox, Detection};

    fn detector_with(script: Vec<Vec<Detection>>, min_confidence: f32) -> Detector {
        Detector::new(
            Box::new(StubBackend::new(script)),
            Arc::new(EquipmentCatalog::default()),
            min_confidence,
        )
        .unwrap()
    }

    fn det(class_id: u32, confidence: f32) -> Detection {
        Detection::new(class_id, confidence, BoundingBox::new(0.1, 0.4, 0.3, 0.6))
    }

    #[test]
    fn confidence_equal_to_threshold_is_discarded() -> Result<()> {
        let mut detector = detector_with(vec![vec![det(5, 0.5), det(6, 0.51), det(1, 0.49)]], 0.5);
        let out = detector.detect(&Frame::filled(64, 64, 3, 0))?;
        assert_eq!(out.class_ids, vec![6]);
        assert_eq!(out.missing, vec!["No Gloves"]);
        Ok(())
    }

    #[test]
    fn missing_names_keep_order_and_duplicates() -> Result<()> {
        let mut detector =
            detector_with(vec![vec![det(7, 0.9), det(2, 0.9), det(4, 0.9), det(7, 0.8)]], 0.25);
        let out = detector.detect(&Frame::filled(64, 64, 3, 0))?;
        assert_eq!(out.class_ids, vec![7, 2, 4, 7]);
        assert_eq!(
            out.missing,
            vec!["No Ear Protection", "No Glasses", "No Ear Protection"]
        );
        assert!(out.has_violation());
        Ok(())
    }

    #[test]
    fn threshold_update_applies_to_next_call() -> Result<()> {
        let mut detector = detector_with(vec![vec![det(5, 0.6)]], 0.5);
        let frame = Frame::filled(32, 32, 3, 0);
        assert_eq!(detector.detect(&frame)?.class_ids, vec![5]);

        detector.set_min_confidence(0.7)?;
        assert!(detector.detect(&frame)?.class_ids.is_empty());
        assert!(detector.set_min_confidence(1.5).is_err());
        assert_eq!(detector.min_confidence(), 0.7);
        Ok(())
    }

    #[test]
    fn annotation_leaves_input_untouched() -> Result<()> {
        let mut detector = detector_with(vec![vec![det(5, 0.9)]], 0.5);
        let frame = Frame::filled(64, 64, 3, 0);
        let out = detector.detect(&frame)?;
        assert_eq!(frame, Frame::filled(64, 64, 3, 0));
        assert_ne!(out.annotated, frame);
        Ok(())
    }

    #[test]
    fn unknown_model_paths_fail_to_load() {
        let catalog = Arc::new(EquipmentCatalog::default());
        assert!(Detector::load("models/best.pt", catalog.clone(), 0.5).is_err());
        assert!(Detector::load("stub://alternate", catalog, 0.5).is_ok());
    }
}
