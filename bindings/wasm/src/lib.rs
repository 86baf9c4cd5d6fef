use facecrop::{
    BatchConfig, BatchResult, BatchSession, CancelFlag, FaceCropError, OutputFormat,
    ProgressEvent, RustfaceLocator, ZipPackager,
};
use serde::Deserialize;
use wasm_bindgen::prelude::*;

/// Options for a processing run, passed as a JavaScript object.
///
/// All fields are optional; missing ones keep the library defaults.
#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessOptions {
    pub margin: Option<u32>,
    pub target_width: Option<u32>,
    pub target_height: Option<u32>,
    pub preserve_aspect: Option<bool>,
    pub format: Option<String>,
    pub quality: Option<f32>,
}

/// Create a JS `Error` with a `code` property.
fn make_error(code: &str, message: &str) -> JsValue {
    let err = js_sys::Error::new(message);
    let _ = js_sys::Reflect::set(&err, &"code".into(), &JsValue::from_str(code));
    JsValue::from(err)
}

/// Convert a `FaceCropError` into a JS `Error` with a machine-readable `code` property.
fn to_js_error(e: FaceCropError) -> JsValue {
    make_error(e.code(), &e.to_string())
}

fn parse_options(options: JsValue) -> Result<ProcessOptions, JsValue> {
    if options.is_undefined() || options.is_null() {
        Ok(ProcessOptions::default())
    } else {
        serde_wasm_bindgen::from_value(options)
            .map_err(|e| make_error("INVALID_CONFIGURATION", &format!("invalid options: {e}")))
    }
}

/// Overlay parsed `ProcessOptions` on the default `BatchConfig`.
fn build_config(opts: &ProcessOptions) -> Result<BatchConfig, JsValue> {
    let mut config = BatchConfig::default();
    if let Some(margin) = opts.margin {
        config.margin = margin;
    }
    if let Some(width) = opts.target_width {
        config.target_width = width;
    }
    if let Some(height) = opts.target_height {
        config.target_height = height;
    }
    if let Some(preserve) = opts.preserve_aspect {
        config.preserve_aspect = preserve;
    }
    if let Some(ref format) = opts.format {
        config.format = format.parse::<OutputFormat>().map_err(to_js_error)?;
    }
    if let Some(quality) = opts.quality {
        config.quality = quality;
    }
    config.validate().map_err(to_js_error)?;
    Ok(config)
}

fn set(obj: &js_sys::Object, key: &str, value: &JsValue) -> Result<(), JsValue> {
    js_sys::Reflect::set(obj, &key.into(), value).map(|_| ())
}

fn progress_object(event: &ProgressEvent) -> Result<JsValue, JsValue> {
    let obj = js_sys::Object::new();
    match event {
        ProgressEvent::Started { index, total, name } => {
            set(&obj, "kind", &"started".into())?;
            set(&obj, "current", &JsValue::from(*index as u32 + 1))?;
            set(&obj, "total", &JsValue::from(*total as u32))?;
            set(&obj, "name", &JsValue::from_str(name))?;
        }
        ProgressEvent::Failed { name, error, .. } => {
            set(&obj, "kind", &"failed".into())?;
            set(&obj, "name", &JsValue::from_str(name))?;
            set(&obj, "code", &JsValue::from_str(error.code()))?;
            set(&obj, "message", &JsValue::from_str(&error.to_string()))?;
        }
        ProgressEvent::Finished {
            succeeded,
            total,
            cancelled,
        } => {
            set(&obj, "kind", &"finished".into())?;
            set(&obj, "succeeded", &JsValue::from(*succeeded as u32))?;
            set(&obj, "total", &JsValue::from(*total as u32))?;
            set(&obj, "cancelled", &JsValue::from(*cancelled))?;
        }
    }
    Ok(JsValue::from(obj))
}

/// Build a plain JS summary object from a `BatchResult`.
fn build_result_object(result: &BatchResult) -> Result<JsValue, JsValue> {
    let obj = js_sys::Object::new();
    set(&obj, "succeeded", &JsValue::from(result.success_count() as u32))?;
    set(&obj, "failed", &JsValue::from(result.error_count() as u32))?;
    set(&obj, "total", &JsValue::from(result.total as u32))?;
    set(&obj, "cancelled", &JsValue::from(result.cancelled))?;

    let items = js_sys::Array::new();
    for processed in &result.processed {
        let item = js_sys::Object::new();
        set(&item, "name", &JsValue::from_str(&processed.name))?;
        set(
            &item,
            "data",
            &js_sys::Uint8Array::from(&processed.output.data[..]).into(),
        )?;
        set(
            &item,
            "format",
            &JsValue::from_str(&processed.output.format.to_string()),
        )?;
        set(&item, "width", &JsValue::from(processed.output.width))?;
        set(&item, "height", &JsValue::from(processed.output.height))?;
        set(&item, "faces", &JsValue::from(processed.face_count as u32))?;
        set(&item, "label", &JsValue::from_str(&processed.summary()))?;
        items.push(&item);
    }
    set(&obj, "images", &items)?;

    let failures = js_sys::Array::new();
    for failure in &result.failures {
        let item = js_sys::Object::new();
        set(&item, "name", &JsValue::from_str(&failure.name))?;
        set(&item, "code", &JsValue::from_str(failure.error.code()))?;
        set(&item, "message", &JsValue::from_str(&failure.error.to_string()))?;
        failures.push(&item);
    }
    set(&obj, "failures", &failures)?;

    set(&obj, "pending", &JsValue::from(result.pending_count() as u32))?;

    Ok(JsValue::from(obj))
}

/// Stops a running `process` call before its next image.
///
/// Obtain one with `session.cancelHandle()` before calling `process`; calling
/// `cancel()` from the progress callback is the usual way to abort.
#[wasm_bindgen(js_name = "CancelToken")]
#[derive(Clone)]
pub struct CancelToken {
    flag: CancelFlag,
}

#[wasm_bindgen(js_class = "CancelToken")]
impl CancelToken {
    pub fn cancel(&self) {
        self.flag.cancel();
    }

    #[wasm_bindgen(getter)]
    pub fn cancelled(&self) -> bool {
        self.flag.is_cancelled()
    }
}

/// A browser-side batch session: upload, process, download, clear.
#[wasm_bindgen(js_name = "FaceCropSession")]
pub struct FaceCropSession {
    inner: BatchSession,
}

impl Default for FaceCropSession {
    fn default() -> Self {
        Self::new()
    }
}

#[wasm_bindgen(js_class = "FaceCropSession")]
impl FaceCropSession {
    #[wasm_bindgen(constructor)]
    pub fn new() -> FaceCropSession {
        FaceCropSession {
            inner: BatchSession::new(),
        }
    }

    /// Install the SeetaFace model. Returns `false` (and keeps detection off)
    /// when the bytes cannot be loaded.
    #[wasm_bindgen(js_name = "loadDetectorModel")]
    pub fn load_detector_model(&mut self, model: Vec<u8>) -> bool {
        self.inner
            .initialize_locator(|| RustfaceLocator::from_model_bytes(&model))
    }

    /// Whether face detection is active.
    #[wasm_bindgen(getter, js_name = "detectorReady")]
    pub fn detector_ready(&self) -> bool {
        self.inner.locator().is_available()
    }

    /// Decode and add one uploaded file. Throws `DECODE_FAILURE` for non-images.
    #[wasm_bindgen(js_name = "addImage")]
    pub fn add_image(&mut self, name: String, bytes: Vec<u8>) -> Result<(), JsValue> {
        self.inner.add_image(&name, &bytes).map_err(to_js_error)
    }

    /// Number of uploaded images waiting to be processed.
    #[wasm_bindgen(getter, js_name = "imageCount")]
    pub fn image_count(&self) -> usize {
        self.inner.resident_images()
    }

    /// Process every uploaded image.
    ///
    /// @param options - Optional object with fields: margin, targetWidth,
    ///   targetHeight, preserveAspect, format, quality
    /// @param onProgress - Optional callback receiving progress objects
    pub fn process(
        &mut self,
        options: JsValue,
        on_progress: Option<js_sys::Function>,
    ) -> Result<JsValue, JsValue> {
        let config = build_config(&parse_options(options)?)?;

        let mut sink = |event: &ProgressEvent| {
            if let Some(callback) = &on_progress {
                if let Ok(obj) = progress_object(event) {
                    let _ = callback.call1(&JsValue::NULL, &obj);
                }
            }
        };
        let result = self.inner.process(&config, &mut sink).map_err(to_js_error)?;
        build_result_object(result)
    }

    /// Token that aborts a running `process` call. Each call starts uncancelled.
    #[wasm_bindgen(js_name = "cancelHandle")]
    pub fn cancel_handle(&self) -> CancelToken {
        CancelToken {
            flag: self.inner.cancel_handle(),
        }
    }

    /// Zip every processed image. Throws `EMPTY_BATCH` when nothing succeeded.
    #[wasm_bindgen(js_name = "exportZip")]
    pub fn export_zip(&self) -> Result<Vec<u8>, JsValue> {
        self.inner
            .export(&ZipPackager::new())
            .map_err(to_js_error)
    }

    /// Suggested download name for [`FaceCropSession::export_zip`].
    #[wasm_bindgen(js_name = "archiveFileName")]
    pub fn archive_file_name() -> String {
        facecrop::ARCHIVE_FILE_NAME.to_string()
    }

    /// Drop every upload and result.
    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

/// Parse form field text into a validated options object, mirroring the
/// checks the session applies.
#[wasm_bindgen(js_name = "validateForm")]
pub fn validate_form(
    margin: &str,
    target_width: &str,
    target_height: &str,
    preserve_aspect: bool,
) -> Result<JsValue, JsValue> {
    let config = BatchConfig::from_form(margin, target_width, target_height, preserve_aspect)
        .map_err(to_js_error)?;
    let obj = js_sys::Object::new();
    set(&obj, "margin", &JsValue::from(config.margin))?;
    set(&obj, "targetWidth", &JsValue::from(config.target_width))?;
    set(&obj, "targetHeight", &JsValue::from(config.target_height))?;
    set(&obj, "preserveAspect", &JsValue::from(config.preserve_aspect))?;
    Ok(JsValue::from(obj))
}
