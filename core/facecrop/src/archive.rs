//! Bundling processed images into a single downloadable archive.

use std::collections::HashSet;
use std::io::{Cursor, Write};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::config::OutputFormat;
use crate::error::FaceCropError;
use crate::pipeline::BatchResult;

/// Suggested file name for the downloaded archive.
pub const ARCHIVE_FILE_NAME: &str = "processed-images.zip";

/// Folder inside the archive that holds every output.
pub const ARCHIVE_FOLDER: &str = "processed-images";

/// Appended to the input file stem.
const OUTPUT_SUFFIX: &str = "_processed";

/// How entry bytes are represented when handed to a packager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryEncoding {
    /// Raw file bytes.
    #[default]
    Binary,
    /// Standard base64 text that the packager decodes.
    Base64,
}

/// One named file to place in the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveEntry<'a> {
    /// Path of the entry inside the archive folder.
    pub name: &'a str,
    /// Entry contents, raw or base64 per [`EntryEncoding`].
    pub data: &'a [u8],
}

/// Turns named byte buffers into one packaged bundle.
pub trait ArchivePackager {
    /// Package `entries` in order and return the bundle bytes.
    fn package(
        &self,
        entries: &[ArchiveEntry<'_>],
        encoding: EntryEncoding,
    ) -> Result<Vec<u8>, FaceCropError>;
}

/// [`ArchivePackager`] producing a deflate-compressed zip.
#[derive(Debug, Clone)]
pub struct ZipPackager {
    folder: Option<String>,
}

impl Default for ZipPackager {
    fn default() -> Self {
        Self {
            folder: Some(ARCHIVE_FOLDER.to_string()),
        }
    }
}

impl ZipPackager {
    /// Packager writing into [`ARCHIVE_FOLDER`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Place entries in `folder` (or at the archive root when `None`).
    pub fn with_folder(folder: Option<&str>) -> Self {
        Self {
            folder: folder.map(|f| f.trim_end_matches('/').to_string()),
        }
    }

    fn entry_path(&self, name: &str) -> String {
        match &self.folder {
            Some(folder) => format!("{folder}/{name}"),
            None => name.to_string(),
        }
    }
}

impl ArchivePackager for ZipPackager {
    fn package(
        &self,
        entries: &[ArchiveEntry<'_>],
        encoding: EntryEncoding,
    ) -> Result<Vec<u8>, FaceCropError> {
        let zip_err = |e: zip::result::ZipError| FaceCropError::ArchiveFailure(e.to_string());

        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(DateTime::default());
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

        if let Some(folder) = &self.folder {
            writer
                .add_directory(format!("{folder}/"), options)
                .map_err(zip_err)?;
        }

        for entry in entries {
            let decoded;
            let bytes = match encoding {
                EntryEncoding::Binary => entry.data,
                EntryEncoding::Base64 => {
                    decoded = BASE64.decode(entry.data).map_err(|e| {
                        FaceCropError::ArchiveFailure(format!(
                            "entry '{}' is not valid base64: {e}",
                            entry.name
                        ))
                    })?;
                    decoded.as_slice()
                }
            };

            writer
                .start_file(self.entry_path(entry.name), options)
                .map_err(zip_err)?;
            writer
                .write_all(bytes)
                .map_err(|e| FaceCropError::ArchiveFailure(e.to_string()))?;
        }

        let cursor = writer.finish().map_err(zip_err)?;
        Ok(cursor.into_inner())
    }
}

/// Archive name for an input: directories dropped, last extension stripped,
/// suffix and new extension added.
///
/// `"portrait.jpeg"` becomes `"portrait_processed.png"` for PNG output, and
/// `"../trip/portrait.jpeg"` becomes the same, so no entry escapes the folder.
pub fn output_name(original: &str, format: OutputFormat) -> String {
    format!(
        "{}{OUTPUT_SUFFIX}.{}",
        strip_extension(file_name(original)),
        format.extension()
    )
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn strip_extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < name.len() => &name[..idx],
        _ => name,
    }
}

/// Name `candidate` so it does not clash with anything already in `taken`.
///
/// Later duplicates get `_2`, `_3`, ... appended to the stem.
fn disambiguate(candidate: String, taken: &HashSet<String>) -> String {
    if !taken.contains(&candidate) {
        return candidate;
    }
    let (stem, ext) = match candidate.rfind('.') {
        Some(idx) => candidate.split_at(idx),
        None => (candidate.as_str(), ""),
    };
    (2..)
        .map(|n| format!("{stem}_{n}{ext}"))
        .find(|name| !taken.contains(name))
        .unwrap_or_else(|| candidate.clone())
}

/// Package every successful output of `result` into one archive.
///
/// Fails with [`FaceCropError::EmptyBatch`] when nothing succeeded, so an
/// empty archive is never produced.
pub fn export_archive(
    result: &BatchResult,
    packager: &dyn ArchivePackager,
) -> Result<Vec<u8>, FaceCropError> {
    if result.processed.is_empty() {
        return Err(FaceCropError::EmptyBatch);
    }

    let mut taken = HashSet::with_capacity(result.processed.len());
    let mut names = Vec::with_capacity(result.processed.len());
    for processed in &result.processed {
        let wanted = output_name(&processed.name, processed.output.format);
        let name = disambiguate(wanted.clone(), &taken);
        if name != wanted {
            warn!(
                "output name {wanted} for {} already used, writing {name}",
                processed.name
            );
        }
        taken.insert(name.clone());
        names.push(name);
    }

    let entries: Vec<ArchiveEntry<'_>> = result
        .processed
        .iter()
        .zip(&names)
        .map(|(processed, name)| ArchiveEntry {
            name,
            data: &processed.output.data,
        })
        .collect();

    let archive = packager.package(&entries, EntryEncoding::Binary)?;
    debug!(
        "packaged {} image(s) into {} byte archive",
        entries.len(),
        archive.len()
    );
    Ok(archive)
}
