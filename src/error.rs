//! Error types for the prnu-forensics crate.

/// Errors that can occur while enrolling, scoring, or persisting fingerprints.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Enrollment was attempted with fewer images than the configured minimum.
    #[error("insufficient enrollment images: {required} required, {provided} provided")]
    InsufficientImages {
        /// Configured minimum image count.
        required: usize,
        /// Number of images supplied by the caller.
        provided: usize,
    },

    /// An input image could not be turned into a processing buffer.
    #[error("image processing failed: {0}")]
    ImageProcessingFailure(String),

    /// No fingerprint is enrolled for the requested camera.
    #[error("no fingerprint enrolled for camera '{0}'")]
    FingerprintNotFound(String),

    /// Two buffers that must share a length did not.
    #[error("dimension mismatch: expected {expected} samples, got {actual}")]
    DimensionMismatch {
        /// Expected sample count.
        expected: usize,
        /// Sample count actually provided.
        actual: usize,
    },

    /// The fingerprint store could not complete an operation.
    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// An unexpected lower-level fault while processing a request.
    #[error("processing failure: {0}")]
    ProcessingFailure(String),

    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Whether retrying the same request may succeed without caller changes.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StorageFailure(_) | Error::ProcessingFailure(_))
    }

    /// Whether this error signals a broken internal invariant rather than bad input.
    #[must_use]
    pub fn is_defect(&self) -> bool {
        matches!(self, Error::DimensionMismatch { .. })
    }
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        Error::ImageProcessingFailure(e.to_string())
    }
}

/// A specialized `Result` type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
