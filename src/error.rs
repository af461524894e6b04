use thiserror::Error;

/// Failures raised by the detector adapter.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("could not decode image: {0}")]
    Load(#[source] image::ImageError),
    #[error("detector backend failed: {0:#}")]
    Backend(#[source] anyhow::Error),
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

/// Failures surfaced by `DetectionService`.
///
/// Callers map these onto client-facing conditions: `InvalidImage` and
/// `InvalidInput` are bad requests, `NotFound` and `InvalidTransition` are
/// distinct from both, everything else is an internal failure.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid image: {0}")]
    InvalidImage(#[source] image::ImageError),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("alert {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: &'static str,
        to: &'static str,
    },
    #[error("detection failed: {0}")]
    Detector(#[source] DetectError),
    #[error("file storage error: {0}")]
    Io(#[from] std::io::Error),
    #[error("persistence error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        ServiceError::NotFound { entity, id }
    }
}

impl From<DetectError> for ServiceError {
    fn from(err: DetectError) -> Self {
        match err {
            DetectError::Load(source) => ServiceError::InvalidImage(source),
            DetectError::Io(source) => ServiceError::Io(source),
            other => ServiceError::Detector(other),
        }
    }
}
