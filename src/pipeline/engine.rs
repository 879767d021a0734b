//! Conversion engine interface.
//!
//! The engine is an external collaborator: it takes a file path and a fixed
//! pipeline configuration and produces a structured document, or fails. The
//! rest of the crate only sees the two traits below.
//!
//! Engines are synchronous. They are CPU/accelerator bound and the pipeline
//! always calls them from `tokio::task::spawn_blocking`, so an implementation
//! may block freely (spawn subprocesses, load models, read large files).
//!
//! The result type is a fixed interface with explicit optional fields
//! (`page_count`, `pictures`); callers never probe for attributes.

use crate::config::{AcceleratorDevice, TableFormat};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// How images are represented when a document is exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageRefMode {
    /// Images are written as separate files into `<stem>_artifacts/` next to
    /// the exported document and linked by path.
    Referenced,
    /// Images are replaced by an `<!-- image -->` marker; no files are written.
    Placeholder,
}

/// Accelerator settings shared by every engine instance in the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceleratorOptions {
    pub device: AcceleratorDevice,
    pub num_threads: usize,
}

impl Default for AcceleratorOptions {
    fn default() -> Self {
        Self {
            device: AcceleratorDevice::Cpu,
            num_threads: 4,
        }
    }
}

/// Static configuration of one engine instance.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub do_ocr: bool,
    /// OCR every page in full instead of only regions without a text layer.
    pub force_full_page_ocr: bool,
    /// Tesseract language codes.
    pub ocr_languages: Vec<String>,
    pub accelerator: AcceleratorOptions,
    /// PDF parsing backend understood by the engine.
    pub pdf_backend: String,
    /// Export picture bitmaps; when off the engine emits placeholders only.
    pub generate_picture_images: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            do_ocr: true,
            force_full_page_ocr: false,
            ocr_languages: vec!["eng".to_string()],
            accelerator: AcceleratorOptions::default(),
            pdf_backend: "pypdfium2".to_string(),
            generate_picture_images: true,
        }
    }
}

/// A picture detected in the converted document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Picture {
    /// 1-indexed page the picture was found on, when the engine knows it.
    pub page: Option<usize>,
}

/// Errors raised by a conversion engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine executable could not be started.
    #[error("Failed to launch '{program}': {source}")]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The engine ran but reported failure.
    #[error("Engine exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    /// The engine finished without producing an expected file.
    #[error("Engine output missing: '{path}'")]
    MissingOutput { path: PathBuf },

    /// The engine's structured output could not be parsed.
    #[error("Could not parse engine output: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A structured conversion result.
pub trait ConvertedDocument: Send {
    /// Number of pages, when the source format has pages.
    fn page_count(&self) -> Option<usize>;

    /// Pictures detected in the document, in reading order.
    fn pictures(&self) -> &[Picture];

    /// Render the document as Markdown to `dest`.
    ///
    /// With [`ImageRefMode::Referenced`] image files are written to the
    /// sibling directory returned by [`artifacts_dir_for`]`(dest)`.
    fn save_as_markdown(&self, dest: &Path, mode: ImageRefMode) -> Result<(), EngineError>;
}

/// A pre-configured, shareable conversion engine instance.
pub trait ConversionEngine: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &str;

    /// The configuration this instance was built with.
    fn options(&self) -> &PipelineOptions;

    /// Convert the file at `input`. `table_format` is a hint only.
    fn convert(
        &self,
        input: &Path,
        table_format: TableFormat,
    ) -> Result<Box<dyn ConvertedDocument>, EngineError>;
}

/// The intermediate image directory an export to `document` writes into:
/// `<parent>/<stem>_artifacts`.
pub fn artifacts_dir_for(document: &Path) -> PathBuf {
    let stem = document
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let parent = document.parent().unwrap_or_else(|| Path::new(""));
    parent.join(format!("{stem}_artifacts"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifacts_dir_is_stem_sibling() {
        assert_eq!(
            artifacts_dir_for(Path::new("/data/job/document.md")),
            PathBuf::from("/data/job/document_artifacts")
        );
        assert_eq!(
            artifacts_dir_for(Path::new("report.v2.md")),
            PathBuf::from("report.v2_artifacts")
        );
    }

    #[test]
    fn default_options_enable_ocr_without_forcing() {
        let opts = PipelineOptions::default();
        assert!(opts.do_ocr);
        assert!(!opts.force_full_page_ocr);
        assert!(opts.generate_picture_images);
    }
}
