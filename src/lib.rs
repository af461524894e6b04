//! PPE Watch
//!
//! Backend for safety-equipment (PPE) compliance monitoring. Uploaded images
//! are stored, run through an object-detection model, and the classified
//! results are persisted. Each distinct violation raises an alert that
//! operators acknowledge and resolve.
//!
//! # Module Structure
//!
//! - `detect`: model backends, the PPE class table, result aggregation, annotation
//! - `service`: the detection pipeline and read-side statistics
//! - `storage`: `DetectionStore` with SQLite and in-memory backends
//! - `uploads`: original and annotated image files
//! - `api`: loopback HTTP surface with a bearer capability token
//! - `config`: JSON file plus environment overrides

pub mod api;
pub mod config;
pub mod detect;
pub mod error;
pub mod records;
pub mod service;
pub mod storage;
pub mod uploads;

pub use config::{DetectorSettings, PpeConfig};
pub use detect::{
    DetectedObject, DetectionResult, DetectorBackend, PpeClass, PpeDetector, RawDetection,
    StubBackend, ViolationKind,
};
pub use error::{DetectError, ServiceError};
pub use records::{
    Alert, AlertStatus, Detection, DetectionFilter, DetectionStats, NewZone, Page, Zone,
    ZoneUpdate,
};
pub use service::DetectionService;
pub use storage::{shared_memory_uri, DetectionStore, InMemoryDetectionStore, SqliteDetectionStore};
pub use uploads::UploadStore;
