use serde::Serialize;

use crate::catalog::{is_absent_class, EquipmentCatalog};

/// Axis-aligned box in pixel coordinates of the frame that was inferred on.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }
}

/// One classified region reported by an inference backend.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub class_id: u32,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(class_id: u32, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class_id,
            confidence,
            bbox,
        }
    }

    pub fn is_absent(&self) -> bool {
        is_absent_class(self.class_id)
    }
}

/// Detections that survived confidence filtering for one frame, in backend order.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DetectionResult {
    pub detections: Vec<Detection>,
}

impl DetectionResult {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self { detections }
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// Every class id, duplicates included.
    pub fn class_ids(&self) -> Vec<u32> {
        self.detections.iter().map(|d| d.class_id).collect()
    }

    /// Class ids of equipment worn correctly.
    pub fn present_classes(&self) -> Vec<u32> {
        self.detections
            .iter()
            .filter(|d| !d.is_absent())
            .map(|d| d.class_id)
            .collect()
    }

    /// Class ids of missing equipment.
    pub fn missing_classes(&self) -> Vec<u32> {
        self.detections
            .iter()
            .filter(|d| d.is_absent())
            .map(|d| d.class_id)
            .collect()
    }

    /// Names of missing equipment in detection order. Duplicates are kept.
    pub fn missing_names(&self, catalog: &EquipmentCatalog) -> Vec<String> {
        self.missing_classes()
            .into_iter()
            .map(|id| catalog.label(id))
            .collect()
    }

    pub fn has_violation(&self) -> bool {
        self.detections.iter().any(Detection::is_absent)
    }
}

/// Greedy per-class non-maximum suppression; output is sorted by confidence.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Detection> = Vec::new();
    let mut suppressed = vec![false; detections.len()];
    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        kept.push(detections[i]);
        for j in (i + 1)..detections.len() {
            if detections[j].class_id == detections[i].class_id
                && detections[i].bbox.iou(&detections[j].bbox) > iou_threshold
            {
                suppressed[j] = true;
            }
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class_id: u32, confidence: f32, x: f32) -> Detection {
        Detection::new(class_id, confidence, BoundingBox::new(x, 0.0, x + 10.0, 10.0))
    }

    #[test]
    fn result_splits_present_and_missing_in_order() {
        let result = DetectionResult::new(vec![det(6, 0.9, 0.0), det(1, 0.8, 20.0), det(4, 0.7, 40.0), det(6, 0.6, 60.0)]);
        assert_eq!(result.class_ids(), vec![6, 1, 4, 6]);
        assert_eq!(result.present_classes(), vec![1]);
        assert_eq!(result.missing_classes(), vec![6, 4, 6]);
        assert_eq!(
            result.missing_names(&EquipmentCatalog::default()),
            vec!["No Gloves", "No Glasses", "No Gloves"]
        );
        assert!(result.has_violation());
    }

    #[test]
    fn iou_of_disjoint_and_identical_boxes() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn nms_suppresses_overlaps_within_a_class_only() {
        let kept = non_max_suppression(
            vec![det(1, 0.6, 1.0), det(1, 0.9, 0.0), det(5, 0.5, 0.0), det(1, 0.7, 50.0)],
            0.45,
        );
        let summary: Vec<(u32, f32)> = kept.iter().map(|d| (d.class_id, d.confidence)).collect();
        assert_eq!(summary, vec![(1, 0.9), (1, 0.7), (5, 0.5)]);
    }
}
