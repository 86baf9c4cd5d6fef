//! Batch settings and their validation.
//!
//! Settings are checked as a whole before any image is touched, so a bad
//! value never surfaces halfway through a batch.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compose::OutputSpec;
use crate::error::FaceCropError;

/// Largest accepted output width or height, in pixels.
///
/// A scaled surface is allocated at the full target size, so larger values
/// are rejected up front rather than failing mid-batch.
pub const MAX_OUTPUT_DIMENSION: u32 = 8192;

/// Default per-image detection deadline on targets that can spawn threads.
#[cfg(not(target_arch = "wasm32"))]
pub const DEFAULT_DETECTION_TIMEOUT_MS: u64 = 30_000;

/// Encoded format of processed images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Lossless PNG (default).
    #[default]
    Png,
    /// Baseline JPEG; transparent pixels are flattened onto white.
    Jpeg,
    /// Lossless WebP.
    Webp,
}

impl OutputFormat {
    /// File extension used for archive entries, without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Webp => "webp",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Webp => "webp",
        })
    }
}

impl FromStr for OutputFormat {
    type Err = FaceCropError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(OutputFormat::Png),
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
            "webp" => Ok(OutputFormat::Webp),
            other => Err(FaceCropError::InvalidConfiguration(format!(
                "unknown output format '{other}'; expected 'png', 'jpeg' or 'webp'"
            ))),
        }
    }
}

/// Settings consumed by [`crate::BatchPipeline`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchConfig {
    /// Padding in pixels added around the union of all detected faces.
    pub margin: u32,
    /// Requested output width in pixels.
    pub target_width: u32,
    /// Requested output height in pixels.
    pub target_height: u32,
    /// Keep the crop's aspect ratio, pinning the side that matches its longer edge.
    pub preserve_aspect: bool,
    /// Encoded format of every output.
    pub format: OutputFormat,
    /// Lossy quality from 0.0 to 1.0 (JPEG only).
    pub quality: f32,
    /// Per-image limit on face detection, in milliseconds. `None` waits forever.
    ///
    /// Defaults to [`DEFAULT_DETECTION_TIMEOUT_MS`] natively. wasm32 has no
    /// threads to enforce it on, so there the default is `None`.
    pub detection_timeout_ms: Option<u64>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            margin: 50,
            target_width: 400,
            target_height: 400,
            preserve_aspect: true,
            format: OutputFormat::Png,
            quality: 0.9,
            detection_timeout_ms: default_detection_timeout(),
        }
    }
}

impl BatchConfig {
    /// Build a config from raw text fields, as typed into a form.
    ///
    /// Non-numeric values, a negative margin and a target size outside
    /// `1..=MAX_OUTPUT_DIMENSION` are rejected. Remaining fields keep their defaults.
    pub fn from_form(
        margin: &str,
        target_width: &str,
        target_height: &str,
        preserve_aspect: bool,
    ) -> Result<Self, FaceCropError> {
        let config = Self {
            margin: parse_field("margin", margin, 0)?,
            target_width: parse_field("target width", target_width, 1)?,
            target_height: parse_field("target height", target_height, 1)?,
            preserve_aspect,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Check every field, returning the first problem found.
    pub fn validate(&self) -> Result<(), FaceCropError> {
        check_dimension("target width", self.target_width)?;
        check_dimension("target height", self.target_height)?;
        if !(0.0..=1.0).contains(&self.quality) {
            return Err(FaceCropError::InvalidConfiguration(format!(
                "quality must be between 0.0 and 1.0, got {}",
                self.quality
            )));
        }
        if self.detection_timeout_ms == Some(0) {
            return Err(invalid("detection timeout must be greater than zero"));
        }
        Ok(())
    }

    /// Detection deadline as a `Duration`.
    pub fn detection_timeout(&self) -> Option<Duration> {
        self.detection_timeout_ms.map(Duration::from_millis)
    }

    pub(crate) fn output_spec(&self) -> OutputSpec {
        OutputSpec {
            format: self.format,
            quality: self.quality,
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn default_detection_timeout() -> Option<u64> {
    Some(DEFAULT_DETECTION_TIMEOUT_MS)
}

#[cfg(target_arch = "wasm32")]
fn default_detection_timeout() -> Option<u64> {
    None
}

fn check_dimension(label: &str, value: u32) -> Result<(), FaceCropError> {
    if value == 0 {
        return Err(FaceCropError::InvalidConfiguration(format!(
            "{label} must be at least 1"
        )));
    }
    if value > MAX_OUTPUT_DIMENSION {
        return Err(FaceCropError::InvalidConfiguration(format!(
            "{label} must be at most {MAX_OUTPUT_DIMENSION}, got {value}"
        )));
    }
    Ok(())
}

fn invalid(message: &str) -> FaceCropError {
    FaceCropError::InvalidConfiguration(message.to_string())
}

fn parse_field(label: &str, raw: &str, min: i64) -> Result<u32, FaceCropError> {
    let value: i64 = raw.trim().parse().map_err(|_| {
        FaceCropError::InvalidConfiguration(format!("{label} '{raw}' is not a whole number"))
    })?;
    if value < min {
        return Err(FaceCropError::InvalidConfiguration(format!(
            "{label} must be at least {min}, got {value}"
        )));
    }
    u32::try_from(value).map_err(|_| {
        FaceCropError::InvalidConfiguration(format!("{label} {value} is too large"))
    })
}
