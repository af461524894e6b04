use anyhow::Result;
use image::RgbImage;

use crate::detect::result::RawDetection;

/// Object-detection model backend.
///
/// Backends report raw class indices; mapping to PPE classes and violation
/// aggregation happens in `PpeDetector`. `detect` takes `&mut self`, so a
/// shared backend sits behind a `Mutex` and calls are serialized.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on an RGB image, keeping boxes scoring at least
    /// `confidence_threshold`. Boxes are in source image pixels.
    fn detect(&mut self, image: &RgbImage, confidence_threshold: f32) -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
