use std::fmt;
use std::sync::Arc;

use log::{info, warn};

use crate::archive::{export_archive, ArchivePackager};
use crate::compose::{Compositor, RasterCompositor};
use crate::config::BatchConfig;
use crate::error::FaceCropError;
use crate::face_locator::{FaceLocator, LocatorSlot};
use crate::pipeline::{BatchPipeline, BatchResult, CancelFlag, ProgressSink, UploadedImage};

/// One upload-process-export session.
///
/// Lifecycle: create, add images, [`process`](Self::process) any number of
/// times, optionally [`export`](Self::export), then [`clear`](Self::clear).
/// Each run replaces the previous result.
pub struct BatchSession {
    images: Vec<UploadedImage>,
    result: Option<BatchResult>,
    locator: LocatorSlot,
    compositor: Arc<dyn Compositor>,
    cancel: CancelFlag,
}

impl Default for BatchSession {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BatchSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchSession")
            .field("images", &self.images.len())
            .field("processed", &self.result.as_ref().map(|r| r.success_count()))
            .field("locator", &self.locator)
            .finish()
    }
}

impl BatchSession {
    /// Session with no face locator and the built-in raster compositor.
    pub fn new() -> Self {
        Self {
            images: Vec::new(),
            result: None,
            locator: LocatorSlot::default(),
            compositor: Arc::new(RasterCompositor::new()),
            cancel: CancelFlag::new(),
        }
    }

    /// Replace the compositor used by later runs.
    pub fn with_compositor(mut self, compositor: impl Compositor + 'static) -> Self {
        self.compositor = Arc::new(compositor);
        self
    }

    /// Install an initialised locator slot.
    pub fn set_locator(&mut self, locator: LocatorSlot) {
        self.locator = locator;
    }

    /// Run the locator's one-off initialisation; failure leaves detection off.
    pub fn initialize_locator<L, E, F>(&mut self, init: F) -> bool
    where
        L: FaceLocator + 'static,
        E: fmt::Display,
        F: FnOnce() -> Result<L, E>,
    {
        self.locator = LocatorSlot::initialize(init);
        self.locator.is_available()
    }

    /// The installed locator slot.
    pub fn locator(&self) -> &LocatorSlot {
        &self.locator
    }

    /// Decode and add one image. Non-images are rejected and not added.
    pub fn add_image(&mut self, name: &str, bytes: &[u8]) -> Result<(), FaceCropError> {
        let image = UploadedImage::decode(name, bytes)?;
        self.images.push(image);
        Ok(())
    }

    /// Decode and add several files, keeping the ones that decode.
    ///
    /// Returns the decode failures; an empty vector means every file was added.
    pub fn add_images<'b, I>(&mut self, files: I) -> Vec<FaceCropError>
    where
        I: IntoIterator<Item = (&'b str, &'b [u8])>,
    {
        let mut failures = Vec::new();
        for (name, bytes) in files {
            if let Err(e) = self.add_image(name, bytes) {
                warn!("skipping upload: {e}");
                failures.push(e);
            }
        }
        info!("{} image(s) loaded", self.images.len());
        failures
    }

    /// Uploaded images, in upload order.
    pub fn images(&self) -> &[UploadedImage] {
        &self.images
    }

    /// Number of decoded images held by the session.
    pub fn resident_images(&self) -> usize {
        self.images.len()
    }

    /// Drawing surfaces the compositor still holds.
    pub fn live_surfaces(&self) -> usize {
        self.compositor.live_surfaces()
    }

    /// Handle that can stop a running batch from another thread.
    pub fn cancel_handle(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Process every uploaded image with `config`, replacing any earlier result.
    ///
    /// Invalid settings fail before any image is touched and leave the
    /// previous result in place.
    pub fn process(
        &mut self,
        config: &BatchConfig,
        progress: &mut dyn ProgressSink,
    ) -> Result<&BatchResult, FaceCropError> {
        let pipeline = BatchPipeline::new(&self.locator, self.compositor.as_ref(), config)?;
        self.cancel.reset();
        let result = pipeline.run(&self.images, progress, &self.cancel);
        Ok(self.result.insert(result))
    }

    /// Result of the most recent run, if any.
    pub fn result(&self) -> Option<&BatchResult> {
        self.result.as_ref()
    }

    /// Bundle the most recent run's outputs.
    pub fn export(&self, packager: &dyn ArchivePackager) -> Result<Vec<u8>, FaceCropError> {
        match &self.result {
            Some(result) => export_archive(result, packager),
            None => Err(FaceCropError::EmptyBatch),
        }
    }

    /// Stop any running batch and drop every image and result.
    pub fn clear(&mut self) {
        self.cancel.cancel();
        self.images.clear();
        self.images.shrink_to_fit();
        self.result = None;
    }
}
