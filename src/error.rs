//! Error types for the docbundle library.
//!
//! Two error types reflect two layers of the system:
//!
//! * [`DocBundleError`] — everything the job layer can report: rejected
//!   uploads, storage allocation, bridging, engine processing, packaging and
//!   lookups of unknown jobs. Request-time errors (validation, not-found) reach
//!   the caller directly; errors raised inside a background job are caught by
//!   [`crate::runner::JobRunner`] and only surface as the job's FAILED status.
//!
//! * [`crate::pipeline::engine::EngineError`] — failures of the external
//!   conversion engine. The pipeline wraps them into
//!   [`DocBundleError::Processing`] tagged with the [`Stage`] that failed.

use crate::job::{JobId, JobStatus};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline stage at which a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Legacy-format conversion through the external bridge tool.
    Bridge,
    /// Engine conversion of the (possibly bridged) input.
    Convert,
    /// Rendering the engine result to Markdown.
    Export,
    /// Moving extracted images and rewriting their references.
    Normalize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Bridge => "bridge",
            Stage::Convert => "convert",
            Stage::Export => "export",
            Stage::Normalize => "normalize",
        };
        f.write_str(s)
    }
}

/// All errors returned by the docbundle library.
#[derive(Debug, Error)]
pub enum DocBundleError {
    // ── Validation errors (no job is created) ─────────────────────────────
    /// Upload exceeds the configured maximum size.
    #[error("File too large: {size} bytes. Maximum size: {max} bytes")]
    FileTooLarge { size: u64, max: u64 },

    /// Upload extension is not one of the accepted document types.
    #[error("Unsupported file type '{extension}'. Allowed: {allowed}")]
    UnsupportedFileType { extension: String, allowed: String },

    /// A processing option could not be parsed.
    #[error("Invalid value '{value}' for option '{option}'")]
    InvalidOption { option: String, value: String },

    // ── Storage errors ────────────────────────────────────────────────────
    /// Task directory or upload file could not be created.
    #[error("Failed to allocate '{path}': {source}")]
    Allocation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Bridge errors ─────────────────────────────────────────────────────
    /// The legacy-format converter exited unsuccessfully.
    #[error("Legacy format conversion with '{tool}' failed: {diagnostic}")]
    ConversionBridge { tool: String, diagnostic: String },

    /// The legacy-format converter did not finish in time.
    #[error("Legacy format conversion with '{tool}' timed out after {secs}s")]
    BridgeTimeout { tool: String, secs: u64 },

    // ── Processing errors ─────────────────────────────────────────────────
    /// Engine conversion, export or artifact normalization failed.
    #[error("Processing failed during {stage}: {detail}")]
    Processing { stage: Stage, detail: String },

    /// The output directory could not be packaged.
    #[error("Failed to package '{path}': {detail}")]
    Packaging { path: PathBuf, detail: String },

    // ── Lookup errors ─────────────────────────────────────────────────────
    /// Unknown or already evicted job.
    #[error("Task not found: {id}")]
    NotFound { id: String },

    /// The job exists but has no downloadable result yet.
    #[error("Task is not completed. Current status: {status}")]
    NotReady { id: JobId, status: JobStatus },

    /// The service is draining and accepts no new jobs.
    #[error("Service is shutting down; no new tasks are accepted")]
    ShuttingDown,

    // ── CLI input errors ──────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (panicked worker, join failure).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DocBundleError {
    /// `true` for errors that reject an upload before any job exists.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DocBundleError::FileTooLarge { .. }
                | DocBundleError::UnsupportedFileType { .. }
                | DocBundleError::InvalidOption { .. }
        )
    }

    /// The pipeline stage this error originated from, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            DocBundleError::ConversionBridge { .. } | DocBundleError::BridgeTimeout { .. } => {
                Some(Stage::Bridge)
            }
            DocBundleError::Processing { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub(crate) fn processing(stage: Stage, detail: impl fmt::Display) -> Self {
        DocBundleError::Processing {
            stage,
            detail: detail.to_string(),
        }
    }
}
