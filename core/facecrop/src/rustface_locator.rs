use std::path::Path;

use log::debug;

use crate::error::FaceCropError;
use crate::face_locator::{DetectionBox, FaceLocator};

/// Face locator backed by the `rustface` crate (SeetaFace engine).
///
/// The model is loaded once at construction; loading is the fallible
/// initialisation step that [`crate::LocatorSlot::initialize`] wraps.
pub struct RustfaceLocator {
    model: rustface::Model,
    min_face_size: u32,
}

impl RustfaceLocator {
    /// Load a SeetaFace frontal model from its serialized bytes.
    pub fn from_model_bytes(bytes: &[u8]) -> Result<Self, FaceCropError> {
        let model = rustface::read_model(std::io::Cursor::new(bytes))
            .map_err(|e| FaceCropError::DetectionUnavailable(e.to_string()))?;
        Ok(Self {
            model,
            min_face_size: 20,
        })
    }

    /// Load a SeetaFace frontal model from disk.
    pub fn from_model_file(path: impl AsRef<Path>) -> Result<Self, FaceCropError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            FaceCropError::DetectionUnavailable(format!("{}: {e}", path.display()))
        })?;
        Self::from_model_bytes(&bytes)
    }

    /// Smallest face, in pixels, the detector will report (default: 20).
    pub fn min_face_size(mut self, size: u32) -> Self {
        self.min_face_size = size.max(1);
        self
    }
}

impl FaceLocator for RustfaceLocator {
    fn detect(&self, gray: &[u8], width: u32, height: u32) -> Vec<DetectionBox> {
        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(self.min_face_size);
        detector.set_score_thresh(2.0);
        detector.set_pyramid_scale_factor(0.8);
        detector.set_slide_window_step(4, 4);

        let faces = detector.detect(&rustface::ImageData::new(gray, width, height));
        debug!("rustface found {} face(s) in {width}x{height}", faces.len());

        faces
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                DetectionBox {
                    x: f64::from(bbox.x()),
                    y: f64::from(bbox.y()),
                    width: f64::from(bbox.width()),
                    height: f64::from(bbox.height()),
                    confidence: face.score(),
                }
            })
            .collect()
    }
}
