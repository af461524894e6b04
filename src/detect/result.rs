use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::detect::class::{PpeClass, ViolationKind};

/// One box as reported by a backend, before classification.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    pub class_id: u32,
    pub confidence: f32,
    /// `[x1, y1, x2, y2]` in source image pixels.
    pub bbox: [f32; 4],
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub class_id: u32,
    pub class_name: PpeClass,
    pub confidence: f64,
    pub bbox: [f64; 4],
    pub is_violation: bool,
}

/// Result of running detection on one image.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub detected_objects: Vec<DetectedObject>,
    pub violations: BTreeSet<ViolationKind>,
    pub person_count: u32,
    pub violation_count: u32,
    pub has_violation: bool,
    pub processing_time_ms: f64,
}

impl DetectedObject {
    /// Classify a raw box. Returns `None` for class ids outside the PPE table.
    pub fn classify(raw: &RawDetection) -> Option<Self> {
        let class = PpeClass::from_id(raw.class_id)?;
        Some(Self {
            class_id: raw.class_id,
            class_name: class,
            confidence: round_to(f64::from(raw.confidence), 4),
            bbox: raw.bbox.map(|v| round_to(f64::from(v), 2)),
            is_violation: class.is_violation(),
        })
    }
}

impl DetectionResult {
    /// Aggregate raw backend output. `elapsed_ms` is the inference wall-clock time.
    pub fn from_raw(raw: &[RawDetection], elapsed_ms: f64) -> Self {
        let mut result = DetectionResult {
            processing_time_ms: round_to(elapsed_ms, 2),
            ..Default::default()
        };

        for det in raw {
            let Some(object) = DetectedObject::classify(det) else {
                log::debug!("dropping detection with unknown class id {}", det.class_id);
                continue;
            };
            if object.class_name == PpeClass::Person {
                result.person_count += 1;
            }
            if let Some(kind) = object.class_name.violation() {
                result.violation_count += 1;
                result.violations.insert(kind);
            }
            result.detected_objects.push(object);
        }

        result.has_violation = result.violation_count > 0;
        result
    }
}

pub(crate) fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
