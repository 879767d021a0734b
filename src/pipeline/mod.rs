//! Document conversion pipeline.
//!
//! Each submodule implements one step; [`ConversionPipeline`] wires them
//! together for a single job.
//!
//! ## Data Flow
//!
//! ```text
//! upload ──▶ bridge ──▶ convert ──▶ export ──▶ normalize
//!  (.doc)    (soffice)   (engine)   (document.md) (images/)
//! ```
//!
//! 1. [`input`]  — classify the upload; legacy formats need bridging
//! 2. [`bridge`] — `.doc`/`.xls` to `.docx`/`.xlsx` in a scoped workspace
//! 3. [`engine`] — the engine traits; [`docling`] is the production engine.
//!    Conversion runs in `spawn_blocking`
//! 4. export     — `document.md` with images in `document_artifacts/`
//! 5. [`normalize`] — move images into `images/` and rewrite references

pub mod bridge;
pub mod docling;
pub mod engine;
pub mod input;
pub mod normalize;

use crate::config::{ProcessingOptions, ServiceConfig};
use crate::error::{DocBundleError, Stage};
use bridge::{bridge_into_workspace, FormatBridge, SofficeBridge};
use docling::DoclingEngine;
use engine::{ConversionEngine, ImageRefMode};
use input::DocumentFormat;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// File name of the exported document inside a task directory.
pub const DOCUMENT_FILE: &str = "document.md";

/// Paths and counts produced by one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedDocument {
    pub markdown_path: PathBuf,
    pub images_dir: PathBuf,
    pub image_count: usize,
    pub page_count: Option<usize>,
}

/// The two pre-built engines plus the legacy-format bridge.
///
/// Cheap to share: every field is an `Arc` or a path.
#[derive(Clone)]
pub struct ConversionPipeline {
    standard: Arc<dyn ConversionEngine>,
    force_ocr: Arc<dyn ConversionEngine>,
    bridge: Arc<dyn FormatBridge>,
    scratch_root: PathBuf,
}

impl std::fmt::Debug for ConversionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionPipeline")
            .field("standard", &self.standard.name())
            .field("force_ocr", &self.force_ocr.name())
            .field("scratch_root", &self.scratch_root)
            .finish()
    }
}

impl ConversionPipeline {
    /// Bridge workspaces are created under `scratch_root`.
    pub fn new(
        standard: Arc<dyn ConversionEngine>,
        force_ocr: Arc<dyn ConversionEngine>,
        bridge: Arc<dyn FormatBridge>,
        scratch_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            standard,
            force_ocr,
            bridge,
            scratch_root: scratch_root.into(),
        }
    }

    /// Docling engines and the soffice bridge, configured from `config`.
    pub fn from_config(config: &ServiceConfig) -> Self {
        let standard = DoclingEngine::new(
            "docling-standard",
            &config.engine_program,
            config.pipeline_options(false),
        );
        let force_ocr = DoclingEngine::new(
            "docling-force-ocr",
            &config.engine_program,
            config.pipeline_options(true),
        );
        let bridge = SofficeBridge::new(&config.bridge_program, config.bridge_timeout);
        Self::new(
            Arc::new(standard),
            Arc::new(force_ocr),
            Arc::new(bridge),
            &config.storage_root,
        )
    }

    /// The engine instance for the requested OCR mode.
    pub fn engine_for(&self, force_ocr: bool) -> &Arc<dyn ConversionEngine> {
        if force_ocr {
            &self.force_ocr
        } else {
            &self.standard
        }
    }

    /// Convert `input` into `output_dir/document.md` plus `output_dir/images/`.
    pub async fn process(
        &self,
        input: &Path,
        output_dir: &Path,
        options: &ProcessingOptions,
    ) -> Result<ProcessedDocument, DocBundleError> {
        let format = DocumentFormat::from_path(input)?;

        // Held until the end of this function; dropping it removes the workspace.
        let bridged = match format.bridge_target() {
            Some(target) => {
                Some(bridge_into_workspace(self.bridge.as_ref(), input, target, &self.scratch_root).await?)
            }
            None => None,
        };
        let source = bridged
            .as_ref()
            .map(|b| b.path().to_path_buf())
            .unwrap_or_else(|| input.to_path_buf());

        let engine = Arc::clone(self.engine_for(options.force_ocr));
        info!(
            engine = engine.name(),
            format = format.extension(),
            "Converting {}",
            source.display()
        );

        let table_format = options.table_format;
        let document = tokio::task::spawn_blocking(move || engine.convert(&source, table_format))
            .await
            .map_err(|e| DocBundleError::processing(Stage::Convert, e))?
            .map_err(|e| DocBundleError::processing(Stage::Convert, e))?;
        let page_count = document.page_count();
        debug!(pages = ?page_count, pictures = document.pictures().len(), "Engine result");

        let markdown_path = output_dir.join(DOCUMENT_FILE);
        let dest = markdown_path.clone();
        // The document is dropped on the blocking pool with the export.
        tokio::task::spawn_blocking(move || document.save_as_markdown(&dest, ImageRefMode::Referenced))
            .await
            .map_err(|e| DocBundleError::processing(Stage::Export, e))?
            .map_err(|e| DocBundleError::processing(Stage::Export, e))?;

        let md = markdown_path.clone();
        let normalized = tokio::task::spawn_blocking(move || normalize::normalize_artifacts(&md))
            .await
            .map_err(|e| DocBundleError::processing(Stage::Normalize, e))?
            .map_err(|e| DocBundleError::processing(Stage::Normalize, e))?;
        if normalized.unresolved > 0 {
            warn!(
                unresolved = normalized.unresolved,
                "Some image references could not be resolved"
            );
        }

        drop(bridged);
        Ok(ProcessedDocument {
            markdown_path,
            images_dir: normalized.images_dir,
            image_count: normalized.image_count,
            page_count,
        })
    }
}
