use std::time::Duration;

use thiserror::Error;

/// Everything that can go wrong while ingesting, processing or exporting.
#[derive(Debug, Clone, Error)]
pub enum FaceCropError {
    /// An upload is not a readable image.
    #[error("failed to decode image '{name}': {reason}")]
    DecodeFailure {
        /// File name of the upload.
        name: String,
        /// Decoder message.
        reason: String,
    },

    /// The face locator could not be set up; detection is skipped.
    #[error("face detector could not be initialised: {0}")]
    DetectionUnavailable(String),

    /// The locator crashed or its helper thread could not run.
    #[error("face detection failed: {0}")]
    DetectionFailure(String),

    /// The locator missed its per-image deadline.
    #[error("face detection did not finish within {0:?}")]
    DetectionTimeout(Duration),

    /// The face region lies outside the image.
    #[error("crop region collapsed to {width}x{height} after clamping")]
    DegenerateRegion {
        /// Clamped width.
        width: u32,
        /// Clamped height.
        height: u32,
    },

    /// Cropping or scaling failed.
    #[error("failed to crop and scale image: {0}")]
    CompositionFailure(String),

    /// The scaled image could not be encoded.
    #[error("failed to encode image: {0}")]
    EncodeFailure(String),

    /// Export was asked for with no successful outputs.
    #[error("no processed images to export")]
    EmptyBatch,

    /// A batch setting is out of range or unparsable.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The archive could not be written.
    #[error("failed to build archive: {0}")]
    ArchiveFailure(String),
}

impl FaceCropError {
    /// Machine-readable code used by the language bindings.
    pub fn code(&self) -> &'static str {
        match self {
            FaceCropError::DecodeFailure { .. } => "DECODE_FAILURE",
            FaceCropError::DetectionUnavailable(_) => "DETECTION_UNAVAILABLE",
            FaceCropError::DetectionFailure(_) => "DETECTION_FAILURE",
            FaceCropError::DetectionTimeout(_) => "DETECTION_TIMEOUT",
            FaceCropError::DegenerateRegion { .. } => "DEGENERATE_REGION",
            FaceCropError::CompositionFailure(_) => "COMPOSITION_FAILURE",
            FaceCropError::EncodeFailure(_) => "ENCODE_FAILURE",
            FaceCropError::EmptyBatch => "EMPTY_BATCH",
            FaceCropError::InvalidConfiguration(_) => "INVALID_CONFIGURATION",
            FaceCropError::ArchiveFailure(_) => "ARCHIVE_FAILURE",
        }
    }
}
