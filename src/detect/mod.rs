//! Object detection: model backends, the PPE class table, aggregation of raw
//! boxes into a `DetectionResult`, and annotation of result images.

mod annotate;
mod backend;
pub mod backends;
mod class;
mod detector;
mod result;

pub use annotate::Annotator;
pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use class::{PpeClass, ViolationKind};
pub use detector::{PpeDetector, DEFAULT_CONFIDENCE_THRESHOLD};
pub use result::{DetectedObject, DetectionResult, RawDetection};

pub(crate) use result::round_to;
