use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use image::{DynamicImage, GrayImage};
use log::{debug, warn};

use crate::error::FaceCropError;

/// Bounding box of a detected face within an image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionBox {
    /// X coordinate of the top-left corner (pixels).
    pub x: f64,
    /// Y coordinate of the top-left corner (pixels).
    pub y: f64,
    /// Width of the bounding box (pixels).
    pub width: f64,
    /// Height of the bounding box (pixels).
    pub height: f64,
    /// Detection confidence score reported by the locator.
    pub confidence: f64,
}

impl DetectionBox {
    /// Box with a neutral confidence score.
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence: 1.0,
        }
    }

    /// X coordinate of the right edge.
    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    /// Y coordinate of the bottom edge.
    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    /// Whether `other` lies entirely inside this box (edges may touch).
    pub fn contains(&self, other: &DetectionBox) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }
}

/// Pluggable face detection backend.
///
/// Implement this trait to provide a custom face locator (ONNX, dlib, a test
/// double returning fixed boxes, ...) and hand it to
/// [`crate::BatchSession::set_locator`].
pub trait FaceLocator: Send + Sync {
    /// Detect faces in a row-major grayscale buffer of `width` × `height` bytes.
    fn detect(&self, gray: &[u8], width: u32, height: u32) -> Vec<DetectionBox>;
}

/// Outcome of the one-off locator initialisation step.
///
/// Detection is best-effort: when initialisation failed the slot stays
/// unavailable and every lookup answers with zero boxes.
///
/// With a deadline, detection runs on a helper thread. A helper that missed
/// its deadline is remembered, and the next lookup waits for it (up to the
/// same deadline) before starting another, so at most one abandoned helper
/// and its grayscale copy exist at any time.
#[derive(Clone, Default)]
pub struct LocatorSlot {
    state: SlotState,
    straggler: Arc<Mutex<Option<Receiver<Vec<DetectionBox>>>>>,
}

#[derive(Clone)]
enum SlotState {
    Ready(Arc<dyn FaceLocator>),
    Unavailable(String),
}

impl Default for SlotState {
    fn default() -> Self {
        SlotState::Unavailable("no face locator configured".to_string())
    }
}

impl fmt::Debug for LocatorSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            SlotState::Ready(_) => f.write_str("LocatorSlot::Ready"),
            SlotState::Unavailable(reason) => {
                f.debug_tuple("LocatorSlot::Unavailable").field(reason).finish()
            }
        }
    }
}

impl LocatorSlot {
    /// Wrap a locator that is already usable.
    pub fn ready(locator: impl FaceLocator + 'static) -> Self {
        Self {
            state: SlotState::Ready(Arc::new(locator)),
            straggler: Arc::default(),
        }
    }

    /// A slot that never detects anything, with the reason why.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            state: SlotState::Unavailable(reason.into()),
            straggler: Arc::default(),
        }
    }

    /// Run a fallible initialisation step, degrading to unavailable on error.
    pub fn initialize<L, E, F>(init: F) -> Self
    where
        L: FaceLocator + 'static,
        E: fmt::Display,
        F: FnOnce() -> Result<L, E>,
    {
        match init() {
            Ok(locator) => LocatorSlot::ready(locator),
            Err(e) => {
                let err = FaceCropError::DetectionUnavailable(e.to_string());
                warn!("{err}; proceeding without face detection");
                LocatorSlot::unavailable(e.to_string())
            }
        }
    }

    /// Returns `true` when a locator is installed.
    pub fn is_available(&self) -> bool {
        matches!(self.state, SlotState::Ready(_))
    }

    /// Why detection is off, or `None` when a locator is installed.
    pub fn unavailable_reason(&self) -> Option<&str> {
        match &self.state {
            SlotState::Ready(_) => None,
            SlotState::Unavailable(reason) => Some(reason),
        }
    }

    /// Locate faces in `image`.
    ///
    /// With a `timeout`, the locator runs on a helper thread and an expired
    /// deadline fails the lookup. An unavailable slot returns no boxes.
    pub fn locate(
        &self,
        image: &DynamicImage,
        timeout: Option<Duration>,
    ) -> Result<Vec<DetectionBox>, FaceCropError> {
        let locator = match &self.state {
            SlotState::Ready(locator) => locator,
            SlotState::Unavailable(reason) => {
                debug!("face locator unavailable ({reason}), using full image");
                return Ok(Vec::new());
            }
        };

        let gray = image::imageops::grayscale(image);
        match timeout {
            None => Ok(run_locator(locator.as_ref(), &gray)),
            Some(limit) => self.locate_with_deadline(Arc::clone(locator), gray, limit),
        }
    }

    fn locate_with_deadline(
        &self,
        locator: Arc<dyn FaceLocator>,
        gray: GrayImage,
        limit: Duration,
    ) -> Result<Vec<DetectionBox>, FaceCropError> {
        let mut straggler = self
            .straggler
            .lock()
            .map_err(|_| FaceCropError::DetectionFailure("locator state poisoned".to_string()))?;

        if let Some(previous) = straggler.as_ref() {
            match previous.recv_timeout(limit) {
                Err(RecvTimeoutError::Timeout) => {
                    warn!("previous face detection still running after {limit:?}");
                    return Err(FaceCropError::DetectionTimeout(limit));
                }
                Ok(_) | Err(RecvTimeoutError::Disconnected) => *straggler = None,
            }
        }

        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("facecrop-locator".to_string())
            .spawn(move || {
                // The receiver may be gone after a timeout.
                let _ = tx.send(run_locator(locator.as_ref(), &gray));
            })
            .map_err(|e| FaceCropError::DetectionFailure(e.to_string()))?;

        match rx.recv_timeout(limit) {
            Ok(boxes) => Ok(boxes),
            Err(RecvTimeoutError::Timeout) => {
                *straggler = Some(rx);
                Err(FaceCropError::DetectionTimeout(limit))
            }
            Err(RecvTimeoutError::Disconnected) => Err(FaceCropError::DetectionFailure(
                "locator thread exited without a result".to_string(),
            )),
        }
    }
}

fn run_locator(locator: &dyn FaceLocator, gray: &GrayImage) -> Vec<DetectionBox> {
    locator.detect(gray.as_raw(), gray.width(), gray.height())
}
