use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageEncoder, ImageFormat, RgbImage, RgbaImage};
use log::trace;

use crate::config::OutputFormat;
use crate::error::FaceCropError;
use crate::geometry::{CropRegion, TargetDimensions};

/// Resampling filter shared by every image in every batch.
const RESAMPLE_FILTER: FilterType = FilterType::Lanczos3;

/// Encoded output of one crop-and-scale run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    /// The encoded image bytes.
    pub data: Vec<u8>,
    /// Format of `data`.
    pub format: OutputFormat,
    /// Width of the output image in pixels.
    pub width: u32,
    /// Height of the output image in pixels.
    pub height: u32,
}

/// Encoding parameters for the compositor output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputSpec {
    /// Encoded format.
    pub format: OutputFormat,
    /// Lossy quality from 0.0 to 1.0; only JPEG honours it.
    pub quality: f32,
}

impl Default for OutputSpec {
    fn default() -> Self {
        Self {
            format: OutputFormat::Png,
            quality: 0.9,
        }
    }
}

/// Crop-then-scale stage of the batch pipeline.
pub trait Compositor: Send + Sync {
    /// Extract `region` (the whole image when `None`) and resample it to `target`.
    fn crop_and_scale(
        &self,
        image: &DynamicImage,
        region: Option<CropRegion>,
        target: TargetDimensions,
        output: OutputSpec,
    ) -> Result<EncodedImage, FaceCropError>;

    /// Number of drawing surfaces currently allocated by this compositor.
    fn live_surfaces(&self) -> usize {
        0
    }
}

/// Counts drawing surfaces that are still alive.
#[derive(Debug, Clone, Default)]
pub struct SurfaceLedger {
    live: Arc<AtomicUsize>,
}

impl SurfaceLedger {
    /// Surfaces allocated and not yet dropped.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn adopt(&self, image: DynamicImage) -> Surface {
        self.live.fetch_add(1, Ordering::AcqRel);
        Surface {
            image,
            ledger: self.clone(),
        }
    }
}

/// A scoped pixel buffer, released from the ledger when dropped.
struct Surface {
    image: DynamicImage,
    ledger: SurfaceLedger,
}

impl Deref for Surface {
    type Target = DynamicImage;

    fn deref(&self) -> &DynamicImage {
        &self.image
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        self.ledger.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// [`Compositor`] backed by the `image` crate.
#[derive(Debug, Clone, Default)]
pub struct RasterCompositor {
    ledger: SurfaceLedger,
}

impl RasterCompositor {
    /// Compositor with a fresh surface ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle on the surface counter, for diagnostics.
    pub fn ledger(&self) -> SurfaceLedger {
        self.ledger.clone()
    }
}

impl Compositor for RasterCompositor {
    fn crop_and_scale(
        &self,
        image: &DynamicImage,
        region: Option<CropRegion>,
        target: TargetDimensions,
        output: OutputSpec,
    ) -> Result<EncodedImage, FaceCropError> {
        if target.width == 0 || target.height == 0 {
            return Err(FaceCropError::CompositionFailure(format!(
                "target size {}x{} is empty",
                target.width, target.height
            )));
        }

        let crop = match region {
            Some(region) => {
                if !region.fits_within(image.width(), image.height()) {
                    return Err(FaceCropError::CompositionFailure(format!(
                        "region {region:?} lies outside {}x{} image",
                        image.width(),
                        image.height()
                    )));
                }
                Some(self.ledger.adopt(image.crop_imm(
                    region.x,
                    region.y,
                    region.width,
                    region.height,
                )))
            }
            None => None,
        };
        let source: &DynamicImage = crop.as_deref().unwrap_or(image);

        let scaled = self
            .ledger
            .adopt(source.resize_exact(target.width, target.height, RESAMPLE_FILTER));
        trace!(
            "scaled {}x{} -> {}x{}",
            source.width(),
            source.height(),
            scaled.width(),
            scaled.height()
        );
        drop(crop);

        let data = encode_image(&scaled, output)?;
        Ok(EncodedImage {
            data,
            format: output.format,
            width: scaled.width(),
            height: scaled.height(),
        })
    }

    fn live_surfaces(&self) -> usize {
        self.ledger.live()
    }
}

/// Decode input bytes into a `DynamicImage`, rejecting anything that is not an image.
pub(crate) fn decode_image(name: &str, input: &[u8]) -> Result<DynamicImage, FaceCropError> {
    let failure = |reason: String| FaceCropError::DecodeFailure {
        name: name.to_string(),
        reason,
    };

    let format = detect_format(input).map_err(failure)?;
    let decoded =
        image::load_from_memory_with_format(input, format).map_err(|e| failure(e.to_string()))?;

    if decoded.width() == 0 || decoded.height() == 0 {
        return Err(failure("image dimensions are zero".to_string()));
    }
    Ok(decoded)
}

/// Detect the input image format from the raw bytes.
fn detect_format(input: &[u8]) -> Result<ImageFormat, String> {
    image::guess_format(input).map_err(|e| e.to_string())
}

/// Flatten alpha channel by compositing onto a white background.
pub(crate) fn flatten_alpha(image: &DynamicImage) -> RgbImage {
    let rgba: RgbaImage = image.to_rgba8();
    let (width, height) = (rgba.width(), rgba.height());
    let mut rgb = RgbImage::new(width, height);

    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let alpha = a as f32 / 255.0;
        let inv_alpha = 1.0 - alpha;
        let out_r = (r as f32 * alpha + 255.0 * inv_alpha).round() as u8;
        let out_g = (g as f32 * alpha + 255.0 * inv_alpha).round() as u8;
        let out_b = (b as f32 * alpha + 255.0 * inv_alpha).round() as u8;
        rgb.put_pixel(x, y, image::Rgb([out_r, out_g, out_b]));
    }

    rgb
}

/// Encode an image in the requested output format.
pub(crate) fn encode_image(
    image: &DynamicImage,
    output: OutputSpec,
) -> Result<Vec<u8>, FaceCropError> {
    let mut buffer = Vec::new();
    let (width, height) = (image.width(), image.height());
    let encode_err = |e: image::ImageError| FaceCropError::EncodeFailure(e.to_string());

    match output.format {
        OutputFormat::Png => {
            let rgba = image.to_rgba8();
            PngEncoder::new(&mut buffer)
                .write_image(rgba.as_raw(), width, height, image::ExtendedColorType::Rgba8)
                .map_err(encode_err)?;
        }
        OutputFormat::Webp => {
            // image-webp only encodes losslessly; quality is ignored.
            let rgba = image.to_rgba8();
            WebPEncoder::new_lossless(&mut buffer)
                .write_image(rgba.as_raw(), width, height, image::ExtendedColorType::Rgba8)
                .map_err(encode_err)?;
        }
        OutputFormat::Jpeg => {
            let rgb = flatten_alpha(image);
            let quality_percent = (output.quality.clamp(0.0, 1.0) * 100.0).round().max(1.0) as u8;
            JpegEncoder::new_with_quality(&mut buffer, quality_percent)
                .write_image(rgb.as_raw(), width, height, image::ExtendedColorType::Rgb8)
                .map_err(encode_err)?;
        }
    }

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_rgb(width: u32, height: u32) -> RgbImage {
        let mut img = RgbImage::new(width, height);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            *pixel = image::Rgb([
                (x * 255 / width.max(1)) as u8,
                (y * 255 / height.max(1)) as u8,
                128,
            ]);
        }
        img
    }

    fn make_test_png(width: u32, height: u32) -> Vec<u8> {
        let img = make_test_rgb(width, height);
        let mut buffer = Vec::new();
        PngEncoder::new(&mut buffer)
            .write_image(img.as_raw(), width, height, image::ExtendedColorType::Rgb8)
            .unwrap();
        buffer
    }

    fn png_spec() -> OutputSpec {
        OutputSpec::default()
    }

    #[test]
    fn decode_rejects_non_images() {
        let err = decode_image("notes.txt", b"not an image").unwrap_err();
        match err {
            FaceCropError::DecodeFailure { name, .. } => assert_eq!(name, "notes.txt"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn decode_reads_png_dimensions() {
        let decoded = decode_image("a.png", &make_test_png(40, 30)).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (40, 30));
    }

    #[test]
    fn crop_and_scale_uses_region_then_target() {
        let compositor = RasterCompositor::new();
        let img = DynamicImage::ImageRgb8(make_test_rgb(200, 100));
        let region = CropRegion {
            x: 50,
            y: 10,
            width: 80,
            height: 60,
        };
        let out = compositor
            .crop_and_scale(
                &img,
                Some(region),
                TargetDimensions {
                    width: 40,
                    height: 30,
                },
                png_spec(),
            )
            .unwrap();
        assert_eq!((out.width, out.height), (40, 30));
        assert_eq!(&out.data[1..4], b"PNG");

        let decoded = image::load_from_memory(&out.data).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (40, 30));
        assert_eq!(compositor.live_surfaces(), 0);
    }

    #[test]
    fn missing_region_scales_whole_image() {
        let compositor = RasterCompositor::new();
        let img = DynamicImage::ImageRgb8(make_test_rgb(64, 32));
        let out = compositor
            .crop_and_scale(
                &img,
                None,
                TargetDimensions {
                    width: 16,
                    height: 8,
                },
                png_spec(),
            )
            .unwrap();
        assert_eq!((out.width, out.height), (16, 8));
    }

    #[test]
    fn identical_input_gives_identical_output() {
        let compositor = RasterCompositor::new();
        let img = DynamicImage::ImageRgb8(make_test_rgb(90, 70));
        let target = TargetDimensions {
            width: 33,
            height: 21,
        };
        let a = compositor
            .crop_and_scale(&img, None, target, png_spec())
            .unwrap();
        let b = compositor
            .crop_and_scale(&img, None, target, png_spec())
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn out_of_bounds_region_fails_without_leaking() {
        let compositor = RasterCompositor::new();
        let img = DynamicImage::ImageRgb8(make_test_rgb(20, 20));
        let err = compositor
            .crop_and_scale(
                &img,
                Some(CropRegion {
                    x: 15,
                    y: 0,
                    width: 10,
                    height: 10,
                }),
                TargetDimensions {
                    width: 5,
                    height: 5,
                },
                png_spec(),
            )
            .unwrap_err();
        assert!(matches!(err, FaceCropError::CompositionFailure(_)));
        assert_eq!(compositor.live_surfaces(), 0);
    }

    #[test]
    fn jpeg_output_has_magic_bytes() {
        let img = DynamicImage::ImageRgb8(make_test_rgb(48, 64));
        let data = encode_image(
            &img,
            OutputSpec {
                format: OutputFormat::Jpeg,
                quality: 0.8,
            },
        )
        .unwrap();
        assert_eq!(data[0], 0xFF);
        assert_eq!(data[1], 0xD8);
    }

    #[test]
    fn webp_output_has_riff_header() {
        let img = DynamicImage::ImageRgb8(make_test_rgb(48, 64));
        let data = encode_image(
            &img,
            OutputSpec {
                format: OutputFormat::Webp,
                quality: 0.8,
            },
        )
        .unwrap();
        assert_eq!(&data[0..4], b"RIFF");
        assert_eq!(&data[8..12], b"WEBP");
    }

    #[test]
    fn flatten_alpha_composites_over_white() {
        let mut rgba = RgbaImage::new(1, 1);
        rgba.put_pixel(0, 0, image::Rgba([255, 0, 0, 0]));
        let rgb = flatten_alpha(&DynamicImage::ImageRgba8(rgba));
        assert_eq!(rgb.get_pixel(0, 0), &image::Rgb([255, 255, 255]));
    }

    #[test]
    fn flatten_alpha_preserves_opaque() {
        let mut rgba = RgbaImage::new(1, 1);
        rgba.put_pixel(0, 0, image::Rgba([100, 150, 200, 255]));
        let rgb = flatten_alpha(&DynamicImage::ImageRgba8(rgba));
        assert_eq!(rgb.get_pixel(0, 0), &image::Rgb([100, 150, 200]));
    }

    #[test]
    fn ledger_tracks_live_surfaces() {
        let ledger = SurfaceLedger::default();
        let a = ledger.adopt(DynamicImage::ImageRgb8(RgbImage::new(2, 2)));
        let b = ledger.adopt(DynamicImage::ImageRgb8(RgbImage::new(2, 2)));
        assert_eq!(ledger.live(), 2);
        drop(a);
        assert_eq!(ledger.live(), 1);
        drop(b);
        assert_eq!(ledger.live(), 0);
    }
}
