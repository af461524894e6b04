use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::RawDetection;

/// Scripted backend for tests and demos. Returns the same boxes for every
/// image, filtered by the requested threshold.
#[derive(Clone, Debug, Default)]
pub struct StubBackend {
    detections: Vec<RawDetection>,
    fail_with: Option<String>,
    calls: usize,
}

impl StubBackend {
    pub fn new(detections: Vec<RawDetection>) -> Self {
        Self {
            detections,
            fail_with: None,
            calls: 0,
        }
    }

    /// A backend whose every inference fails with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            detections: Vec::new(),
            fail_with: Some(message.to_string()),
            calls: 0,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _image: &RgbImage, confidence_threshold: f32) -> Result<Vec<RawDetection>> {
        self.calls += 1;
        if let Some(message) = &self.fail_with {
            return Err(anyhow!("{}", message));
        }
        Ok(self
            .detections
            .iter()
            .filter(|det| det.confidence >= confidence_threshold)
            .cloned()
            .collect())
    }
}
