use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::DynamicImage;
use log::{debug, info, warn};

use crate::compose::{decode_image, Compositor, EncodedImage};
use crate::config::BatchConfig;
use crate::error::FaceCropError;
use crate::face_locator::LocatorSlot;
use crate::geometry::{compute_scaled_size, expand_and_clamp, union_box};

/// A decoded input image. Names are unique within a batch only.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    name: String,
    image: DynamicImage,
}

impl UploadedImage {
    /// Decode raw bytes (PNG, JPEG or WebP) into an uploaded image.
    pub fn decode(name: impl Into<String>, bytes: &[u8]) -> Result<Self, FaceCropError> {
        let name = name.into();
        let image = decode_image(&name, bytes)?;
        Ok(Self { name, image })
    }

    /// Wrap an already decoded image.
    pub fn from_image(name: impl Into<String>, image: DynamicImage) -> Self {
        Self {
            name: name.into(),
            image,
        }
    }

    /// File name given at upload.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Decoded pixels.
    pub fn image(&self) -> &DynamicImage {
        &self.image
    }
}

/// Output of one image that made it through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedImage {
    /// Name of the uploaded image this was produced from.
    pub name: String,
    /// Encoded crop.
    pub output: EncodedImage,
    /// Number of faces that shaped the crop; 0 means the whole image was scaled.
    pub face_count: usize,
}

impl ProcessedImage {
    /// Short human-readable label, e.g. `"Processed (2 faces)"`.
    pub fn summary(&self) -> String {
        match self.face_count {
            0 => "No faces detected".to_string(),
            1 => "Processed (1 face)".to_string(),
            n => format!("Processed ({n} faces)"),
        }
    }
}

/// Where a batch item is in its journey through the pipeline.
#[derive(Debug, Clone)]
pub enum ItemState {
    /// Not started yet.
    Pending,
    /// Waiting on the face locator.
    Detecting,
    /// Cropping, scaling and encoding.
    Compositing,
    /// Finished with an output.
    Done {
        /// Faces found in the image.
        face_count: usize,
    },
    /// Skipped after an error.
    Failed(FaceCropError),
}

impl ItemState {
    /// Whether the item has finished, successfully or not.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemState::Done { .. } | ItemState::Failed(_))
    }
}

/// An input that failed during processing.
#[derive(Debug, Clone)]
pub struct ItemFailure {
    /// Position of the item in the input batch.
    pub index: usize,
    /// Name of the uploaded image.
    pub name: String,
    /// Why it failed.
    pub error: FaceCropError,
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    /// Successful outputs, in input order.
    pub processed: Vec<ProcessedImage>,
    /// Inputs that failed; they are excluded from export.
    pub failures: Vec<ItemFailure>,
    /// Final state of every input, indexed like the input batch.
    pub states: Vec<ItemState>,
    /// Number of inputs in the batch.
    pub total: usize,
    /// Whether the run stopped early because it was cancelled.
    pub cancelled: bool,
}

impl BatchResult {
    /// Number of items that produced an output.
    pub fn success_count(&self) -> usize {
        self.processed.len()
    }

    /// Number of items that failed.
    pub fn error_count(&self) -> usize {
        self.failures.len()
    }

    /// Inputs that never started because the run was cancelled.
    pub fn pending_count(&self) -> usize {
        self.states
            .iter()
            .filter(|s| matches!(s, ItemState::Pending))
            .count()
    }
}

/// Events emitted while a batch runs.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// An item started; `index` is 0-based.
    Started {
        /// Position in the batch.
        index: usize,
        /// Number of items in the batch.
        total: usize,
        /// Name of the uploaded image.
        name: String,
    },
    /// An item failed and was skipped.
    Failed {
        /// Position in the batch.
        index: usize,
        /// Name of the uploaded image.
        name: String,
        /// Why it failed.
        error: FaceCropError,
    },
    /// The run ended, either normally or by cancellation.
    Finished {
        /// Items that produced an output.
        succeeded: usize,
        /// Number of items in the batch.
        total: usize,
        /// Whether the run stopped early.
        cancelled: bool,
    },
}

/// Receives progress events from a running batch.
pub trait ProgressSink {
    /// Called once per event, in order.
    fn on_event(&mut self, event: &ProgressEvent);
}

impl<F: FnMut(&ProgressEvent)> ProgressSink for F {
    fn on_event(&mut self, event: &ProgressEvent) {
        self(event)
    }
}

/// Sink that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_event(&mut self, _event: &ProgressEvent) {}
}

/// Shared flag that asks a running batch to stop before its next item.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// A flag that is not set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the batch to stop before its next item.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether [`cancel`](Self::cancel) was called since the last reset.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Clear the flag for a new run.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Sequential locate → crop → scale pipeline over a batch of images.
pub struct BatchPipeline<'a> {
    locator: &'a LocatorSlot,
    compositor: &'a dyn Compositor,
    config: &'a BatchConfig,
}

impl<'a> BatchPipeline<'a> {
    /// Create a pipeline, rejecting invalid settings up front.
    pub fn new(
        locator: &'a LocatorSlot,
        compositor: &'a dyn Compositor,
        config: &'a BatchConfig,
    ) -> Result<Self, FaceCropError> {
        config.validate()?;
        Ok(Self {
            locator,
            compositor,
            config,
        })
    }

    /// Process `images` in order.
    ///
    /// A failing item is recorded and skipped; it never stops the batch, even
    /// when the locator or compositor panics on it. The
    /// `cancel` flag is checked before each item.
    pub fn run(
        &self,
        images: &[UploadedImage],
        progress: &mut dyn ProgressSink,
        cancel: &CancelFlag,
    ) -> BatchResult {
        let total = images.len();
        let mut result = BatchResult {
            states: vec![ItemState::Pending; total],
            total,
            ..BatchResult::default()
        };
        info!(
            "processing {total} image(s), margin {}, target {}x{}, preserve aspect {}",
            self.config.margin,
            self.config.target_width,
            self.config.target_height,
            self.config.preserve_aspect
        );

        for (index, image) in images.iter().enumerate() {
            if cancel.is_cancelled() {
                info!("batch cancelled after {index} of {total} image(s)");
                result.cancelled = true;
                break;
            }

            progress.on_event(&ProgressEvent::Started {
                index,
                total,
                name: image.name().to_string(),
            });

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                self.process_item(image, &mut result.states[index])
            }))
            .unwrap_or_else(|payload| Err(panic_failure(&result.states[index], payload)));

            match outcome {
                Ok(processed) => {
                    result.states[index] = ItemState::Done {
                        face_count: processed.face_count,
                    };
                    result.processed.push(processed);
                }
                Err(error) => {
                    warn!("failed to process {}: {error}", image.name());
                    result.states[index] = ItemState::Failed(error.clone());
                    progress.on_event(&ProgressEvent::Failed {
                        index,
                        name: image.name().to_string(),
                        error: error.clone(),
                    });
                    result.failures.push(ItemFailure {
                        index,
                        name: image.name().to_string(),
                        error,
                    });
                }
            }
        }

        info!(
            "processed {}/{total} image(s), {} failed",
            result.success_count(),
            result.error_count()
        );
        progress.on_event(&ProgressEvent::Finished {
            succeeded: result.success_count(),
            total,
            cancelled: result.cancelled,
        });
        result
    }

    fn process_item(
        &self,
        image: &UploadedImage,
        state: &mut ItemState,
    ) -> Result<ProcessedImage, FaceCropError> {
        let (img_w, img_h) = (image.width(), image.height());

        *state = ItemState::Detecting;
        let boxes = self
            .locator
            .locate(image.image(), self.config.detection_timeout())?;

        *state = ItemState::Compositing;
        let region = match union_box(&boxes) {
            Some(union) => Some(expand_and_clamp(&union, self.config.margin, img_w, img_h)?),
            None => None,
        };
        let (src_w, src_h) = region.map_or((img_w, img_h), |r| (r.width, r.height));
        let target = compute_scaled_size(
            src_w,
            src_h,
            self.config.target_width,
            self.config.target_height,
            self.config.preserve_aspect,
        );
        debug!(
            "{}: {} face(s), region {region:?}, target {}x{}",
            image.name(),
            boxes.len(),
            target.width,
            target.height
        );

        let output = self.compositor.crop_and_scale(
            image.image(),
            region,
            target,
            self.config.output_spec(),
        )?;

        Ok(ProcessedImage {
            name: image.name().to_string(),
            output,
            face_count: boxes.len(),
        })
    }
}

/// Map a panic in a locator or compositor to the stage it interrupted.
fn panic_failure(stage: &ItemState, payload: Box<dyn Any + Send>) -> FaceCropError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    match stage {
        ItemState::Detecting => {
            FaceCropError::DetectionFailure(format!("locator panicked: {message}"))
        }
        _ => FaceCropError::CompositionFailure(format!("compositor panicked: {message}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::{OutputSpec, RasterCompositor};
    use crate::face_locator::{DetectionBox, FaceLocator};
    use crate::geometry::{CropRegion, TargetDimensions};
    use image::RgbImage;

    /// Returns the same boxes for every image.
    struct FixedLocator(Vec<DetectionBox>);

    impl FaceLocator for FixedLocator {
        fn detect(&self, _gray: &[u8], _width: u32, _height: u32) -> Vec<DetectionBox> {
            self.0.clone()
        }
    }

    /// Fails for images of one particular width, delegates otherwise.
    struct FailOnWidth(u32, RasterCompositor);

    impl Compositor for FailOnWidth {
        fn crop_and_scale(
            &self,
            image: &DynamicImage,
            region: Option<CropRegion>,
            target: TargetDimensions,
            output: OutputSpec,
        ) -> Result<EncodedImage, FaceCropError> {
            if image.width() == self.0 {
                return Err(FaceCropError::CompositionFailure("boom".to_string()));
            }
            self.1.crop_and_scale(image, region, target, output)
        }
    }

    /// Panics on images of one particular width.
    struct PanicOnWidth(u32);

    impl FaceLocator for PanicOnWidth {
        fn detect(&self, _gray: &[u8], width: u32, _height: u32) -> Vec<DetectionBox> {
            if width == self.0 {
                panic!("detector crashed on width {width}");
            }
            Vec::new()
        }
    }

    impl Compositor for PanicOnWidth {
        fn crop_and_scale(
            &self,
            image: &DynamicImage,
            region: Option<CropRegion>,
            target: TargetDimensions,
            output: OutputSpec,
        ) -> Result<EncodedImage, FaceCropError> {
            if image.width() == self.0 {
                panic!("surface crashed on width {}", self.0);
            }
            RasterCompositor::new().crop_and_scale(image, region, target, output)
        }
    }

    fn uploaded(name: &str, width: u32, height: u32) -> UploadedImage {
        UploadedImage::from_image(name, DynamicImage::ImageRgb8(RgbImage::new(width, height)))
    }

    fn small_config() -> BatchConfig {
        BatchConfig {
            margin: 5,
            target_width: 40,
            target_height: 40,
            ..BatchConfig::default()
        }
    }

    #[test]
    fn no_detections_scales_whole_image() {
        let slot = LocatorSlot::default();
        let compositor = RasterCompositor::new();
        let config = small_config();
        let pipeline = BatchPipeline::new(&slot, &compositor, &config).unwrap();

        let images = [uploaded("wide.png", 80, 40)];
        let result = pipeline.run(&images, &mut NoProgress, &CancelFlag::new());
        assert_eq!(result.success_count(), 1);
        let processed = &result.processed[0];
        assert_eq!(processed.face_count, 0);
        assert_eq!((processed.output.width, processed.output.height), (40, 20));
        assert_eq!(processed.summary(), "No faces detected");
    }

    #[test]
    fn detections_drive_crop_region() {
        let slot = LocatorSlot::ready(FixedLocator(vec![
            DetectionBox::new(10.0, 10.0, 20.0, 20.0),
            DetectionBox::new(50.0, 50.0, 10.0, 10.0),
            DetectionBox::new(0.0, 90.0, 5.0, 5.0),
        ]));
        let compositor = RasterCompositor::new();
        let config = BatchConfig {
            margin: 5,
            target_width: 200,
            target_height: 190,
            ..BatchConfig::default()
        };
        let pipeline = BatchPipeline::new(&slot, &compositor, &config).unwrap();

        let images = [uploaded("group.png", 100, 100)];
        let result = pipeline.run(&images, &mut NoProgress, &CancelFlag::new());
        let processed = &result.processed[0];
        assert_eq!(processed.face_count, 3);
        assert_eq!(processed.summary(), "Processed (3 faces)");
        // Region is 65x95 (portrait), so the height is pinned: 190 * 65 / 95 = 130.
        assert_eq!((processed.output.width, processed.output.height), (130, 190));
    }

    #[test]
    fn failing_item_is_skipped_and_order_kept() {
        let slot = LocatorSlot::default();
        let compositor = FailOnWidth(13, RasterCompositor::new());
        let config = small_config();
        let pipeline = BatchPipeline::new(&slot, &compositor, &config).unwrap();
        let images = [
            uploaded("a.png", 20, 20),
            uploaded("b.png", 30, 20),
            uploaded("bad.png", 13, 20),
            uploaded("c.png", 40, 20),
        ];

        let mut events = Vec::new();
        let mut sink = |e: &ProgressEvent| events.push(e.clone());
        let result = pipeline.run(&images, &mut sink, &CancelFlag::new());

        let names: Vec<_> = result.processed.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["a.png", "b.png", "c.png"]);
        assert_eq!(result.error_count(), 1);
        assert_eq!(result.failures[0].index, 2);
        assert_eq!(result.failures[0].name, "bad.png");
        assert!(matches!(
            result.states[2],
            ItemState::Failed(FaceCropError::CompositionFailure(_))
        ));
        assert!(result.states.iter().all(ItemState::is_terminal));

        let started = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Started { .. }))
            .count();
        assert_eq!(started, 4);
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::Finished {
                succeeded: 3,
                total: 4,
                cancelled: false
            })
        ));
    }

    #[test]
    fn panicking_locator_fails_only_that_item() {
        let slot = LocatorSlot::ready(PanicOnWidth(13));
        let compositor = RasterCompositor::new();
        let config = BatchConfig {
            detection_timeout_ms: None,
            ..small_config()
        };
        let pipeline = BatchPipeline::new(&slot, &compositor, &config).unwrap();
        let images = [
            uploaded("a.png", 20, 20),
            uploaded("bad.png", 13, 20),
            uploaded("c.png", 30, 20),
        ];

        let result = pipeline.run(&images, &mut NoProgress, &CancelFlag::new());
        assert_eq!(result.success_count(), 2);
        assert_eq!(result.failures[0].name, "bad.png");
        match &result.failures[0].error {
            FaceCropError::DetectionFailure(message) => {
                assert!(message.contains("crashed on width 13"), "{message}")
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(result.states.iter().all(ItemState::is_terminal));
    }

    #[test]
    fn panicking_compositor_fails_only_that_item() {
        let slot = LocatorSlot::default();
        let compositor = PanicOnWidth(13);
        let config = small_config();
        let pipeline = BatchPipeline::new(&slot, &compositor, &config).unwrap();
        let images = [uploaded("bad.png", 13, 20), uploaded("ok.png", 20, 20)];

        let mut finished = None;
        let mut sink = |e: &ProgressEvent| {
            if let ProgressEvent::Finished { succeeded, total, .. } = e {
                finished = Some((*succeeded, *total));
            }
        };
        let result = pipeline.run(&images, &mut sink, &CancelFlag::new());

        assert_eq!(finished, Some((1, 2)));
        assert_eq!(result.processed[0].name, "ok.png");
        assert!(matches!(
            result.states[0],
            ItemState::Failed(FaceCropError::CompositionFailure(_))
        ));
    }

    #[test]
    fn degenerate_region_fails_only_that_item() {
        let slot = LocatorSlot::ready(FixedLocator(vec![DetectionBox::new(
            150.0, 0.0, 10.0, 10.0,
        )]));
        let compositor = RasterCompositor::new();
        let config = BatchConfig {
            margin: 0,
            ..small_config()
        };
        let pipeline = BatchPipeline::new(&slot, &compositor, &config).unwrap();
        let images = [uploaded("narrow.png", 100, 100), uploaded("wide.png", 200, 100)];

        let result = pipeline.run(&images, &mut NoProgress, &CancelFlag::new());
        assert_eq!(result.error_count(), 1);
        assert!(matches!(
            result.failures[0].error,
            FaceCropError::DegenerateRegion { .. }
        ));
        assert_eq!(result.processed[0].name, "wide.png");
        assert_eq!(compositor.live_surfaces(), 0);
    }

    #[test]
    fn cancellation_leaves_remaining_items_pending() {
        let slot = LocatorSlot::default();
        let compositor = RasterCompositor::new();
        let config = small_config();
        let pipeline = BatchPipeline::new(&slot, &compositor, &config).unwrap();
        let images = [
            uploaded("a.png", 20, 20),
            uploaded("b.png", 20, 20),
            uploaded("c.png", 20, 20),
        ];

        let cancel = CancelFlag::new();
        let trigger = cancel.clone();
        let mut sink = move |e: &ProgressEvent| {
            if let ProgressEvent::Started { index: 1, .. } = e {
                trigger.cancel();
            }
        };
        let result = pipeline.run(&images, &mut sink, &cancel);

        assert!(result.cancelled);
        assert_eq!(result.success_count(), 2);
        assert_eq!(result.pending_count(), 1);
        assert!(matches!(result.states[2], ItemState::Pending));
        assert_eq!(compositor.live_surfaces(), 0);
    }

    #[test]
    fn invalid_config_is_rejected_before_running() {
        let slot = LocatorSlot::default();
        let compositor = RasterCompositor::new();
        let config = BatchConfig {
            target_width: 0,
            ..BatchConfig::default()
        };
        assert!(matches!(
            BatchPipeline::new(&slot, &compositor, &config),
            Err(FaceCropError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn empty_batch_reports_zero_of_zero() {
        let slot = LocatorSlot::default();
        let compositor = RasterCompositor::new();
        let config = BatchConfig::default();
        let pipeline = BatchPipeline::new(&slot, &compositor, &config).unwrap();
        let result = pipeline.run(&[], &mut NoProgress, &CancelFlag::new());
        assert_eq!(result.total, 0);
        assert_eq!(result.success_count(), 0);
        assert!(!result.cancelled);
    }

    #[test]
    fn summary_pluralises() {
        let p = ProcessedImage {
            name: "x".to_string(),
            output: EncodedImage {
                data: Vec::new(),
                format: crate::config::OutputFormat::Png,
                width: 1,
                height: 1,
            },
            face_count: 1,
        };
        assert_eq!(p.summary(), "Processed (1 face)");
    }
}
