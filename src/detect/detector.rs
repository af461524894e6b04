use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use image::RgbImage;

use crate::config::DetectorSettings;
use crate::detect::annotate::Annotator;
use crate::detect::backend::DetectorBackend;
use crate::detect::result::{DetectedObject, DetectionResult};
use crate::error::DetectError;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

/// PPE detector: a model backend plus the class table and annotation.
///
/// Constructed once per process and shared by handle. A detector without a
/// backend runs in degraded mode and reports empty results.
pub struct PpeDetector {
    backend: Option<Mutex<Box<dyn DetectorBackend>>>,
    confidence_threshold: f32,
    annotator: Annotator,
}

impl PpeDetector {
    pub fn with_backend<B: DetectorBackend + 'static>(backend: B, confidence_threshold: f32) -> Self {
        Self {
            backend: Some(Mutex::new(Box::new(backend))),
            confidence_threshold,
            annotator: Annotator::new(),
        }
    }

    pub fn without_model(confidence_threshold: f32) -> Self {
        Self {
            backend: None,
            confidence_threshold,
            annotator: Annotator::new(),
        }
    }

    pub fn with_annotator(mut self, annotator: Annotator) -> Self {
        self.annotator = annotator;
        self
    }

    /// Build the detector described by `settings`.
    ///
    /// A missing or unloadable model is not an error: the detector falls back
    /// to degraded mode and logs why.
    pub fn load(settings: &DetectorSettings) -> Self {
        let detector = match settings.backend.as_str() {
            "none" => {
                log::warn!("detector backend disabled; detections will be empty");
                Self::without_model(settings.confidence_threshold)
            }
            _ => Self::load_model(settings),
        };

        match &settings.font_path {
            Some(path) => match Annotator::with_font_file(path) {
                Ok(annotator) => detector.with_annotator(annotator),
                Err(err) => {
                    log::warn!("label font unavailable, using bundled font: {:#}", err);
                    detector
                }
            },
            None => detector,
        }
    }

    #[cfg(feature = "backend-tract")]
    fn load_model(settings: &DetectorSettings) -> Self {
        use crate::detect::backends::TractBackend;

        if !Path::new(&settings.model_path).exists() {
            log::warn!(
                "model not found at {}, running without model",
                settings.model_path
            );
            return Self::without_model(settings.confidence_threshold);
        }
        let loaded = TractBackend::new(&settings.model_path, settings.input_size)
            .map(|backend| backend.with_iou_threshold(settings.iou_threshold))
            .and_then(|mut backend| {
                backend.warm_up()?;
                Ok(backend)
            });
        match loaded {
            Ok(backend) => {
                log::info!("loaded {} model from {}", backend.name(), settings.model_path);
                Self::with_backend(backend, settings.confidence_threshold)
            }
            Err(err) => {
                log::error!("error loading model, running without model: {:#}", err);
                Self::without_model(settings.confidence_threshold)
            }
        }
    }

    #[cfg(not(feature = "backend-tract"))]
    fn load_model(settings: &DetectorSettings) -> Self {
        if Path::new(&settings.model_path).exists() {
            log::warn!(
                "model at {} requires the backend-tract feature, running without model",
                settings.model_path
            );
        } else {
            log::warn!(
                "model not found at {}, running without model",
                settings.model_path
            );
        }
        Self::without_model(settings.confidence_threshold)
    }

    pub fn has_model(&self) -> bool {
        self.backend.is_some()
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    /// Decode an encoded image (any format enabled in `image`).
    pub fn decode(bytes: &[u8]) -> Result<RgbImage, DetectError> {
        let decoded = image::load_from_memory(bytes).map_err(DetectError::Load)?;
        Ok(decoded.to_rgb8())
    }

    /// Classify the objects in `image`.
    pub fn detect(&self, image: &RgbImage) -> Result<DetectionResult, DetectError> {
        let Some(backend) = &self.backend else {
            return Ok(DetectionResult::default());
        };

        // Backends hold no state that spans calls.
        let mut guard = backend.lock().unwrap_or_else(|poisoned| {
            log::warn!("detector backend panicked earlier; continuing with it");
            backend.clear_poison();
            PoisonError::into_inner(poisoned)
        });
        let started = Instant::now();
        let raw = guard
            .detect(image, self.confidence_threshold)
            .map_err(DetectError::Backend)?;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        drop(guard);

        Ok(DetectionResult::from_raw(&raw, elapsed_ms))
    }

    /// Annotated copy of `image` with `objects` drawn on it.
    pub fn draw(&self, image: &RgbImage, objects: &[DetectedObject]) -> RgbImage {
        self.annotator.draw(image, objects)
    }

    /// Load an image file, run detection and write the annotated JPEG to
    /// `output_path`.
    pub fn process_image_file(
        &self,
        image_path: &Path,
        output_path: &Path,
    ) -> Result<DetectionResult, DetectError> {
        let bytes = std::fs::read(image_path).map_err(DetectError::Io)?;
        let image = Self::decode(&bytes)?;
        let result = self.detect(&image)?;
        let annotated = self.draw(&image, &result.detected_objects);
        crate::uploads::write_jpeg(output_path, &annotated).map_err(DetectError::Io)?;
        Ok(result)
    }
}
