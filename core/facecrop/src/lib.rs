//! Batch face-aware cropping: find the faces in each photo, crop to a region
//! covering all of them plus a margin, rescale, and bundle the results into
//! one zip archive.
//!
//! # Example
//!
//! ```no_run
//! use facecrop::{BatchConfig, BatchSession, NoProgress, ZipPackager};
//!
//! let mut session = BatchSession::new();
//! let bytes = std::fs::read("group.jpg").unwrap();
//! session.add_image("group.jpg", &bytes).unwrap();
//!
//! let config = BatchConfig::from_form("40", "400", "400", true).unwrap();
//! let result = session.process(&config, &mut NoProgress).unwrap();
//! println!("{}/{} processed", result.success_count(), result.total);
//!
//! let zip = session.export(&ZipPackager::new()).unwrap();
//! std::fs::write(facecrop::ARCHIVE_FILE_NAME, zip).unwrap();
//! ```

#![warn(missing_docs)]

mod archive;
mod compose;
mod config;
mod error;
/// Face locator trait, detection boxes and the initialisation slot.
pub mod face_locator;
/// Box aggregation, margin clamping and output sizing.
pub mod geometry;
mod pipeline;
#[cfg(feature = "rustface")]
/// Built-in SeetaFace-based face locator.
pub mod rustface_locator;
mod session;

/// Archive packaging of processed images.
pub use archive::{
    export_archive, output_name, ArchiveEntry, ArchivePackager, EntryEncoding, ZipPackager,
    ARCHIVE_FILE_NAME, ARCHIVE_FOLDER,
};
/// Crop-and-scale stage.
pub use compose::{Compositor, EncodedImage, OutputSpec, RasterCompositor, SurfaceLedger};
/// Batch settings.
pub use config::{BatchConfig, OutputFormat, MAX_OUTPUT_DIMENSION};
#[cfg(not(target_arch = "wasm32"))]
pub use config::DEFAULT_DETECTION_TIMEOUT_MS;
/// Error type returned by facecrop operations.
pub use error::FaceCropError;
pub use face_locator::{DetectionBox, FaceLocator, LocatorSlot};
pub use geometry::{compute_scaled_size, expand_and_clamp, union_box, CropRegion, TargetDimensions};
/// Sequential batch pipeline and its records.
pub use pipeline::{
    BatchPipeline, BatchResult, CancelFlag, ItemFailure, ItemState, NoProgress, ProcessedImage,
    ProgressEvent, ProgressSink, UploadedImage,
};
#[cfg(feature = "rustface")]
pub use rustface_locator::RustfaceLocator;
/// Upload-process-export session.
pub use session::BatchSession;
