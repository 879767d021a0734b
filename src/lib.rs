//! # docbundle
//!
//! Asynchronous document-to-Markdown bundling: upload a document, poll its
//! status, download a zip holding `document.md` and an `images/` directory.
//!
//! ## Job lifecycle
//!
//! ```text
//! upload
//!  │
//!  ├─ 1. Validate   size and extension; rejected uploads create nothing
//!  ├─ 2. Register   task directory + PENDING entry in the TaskStore
//!  ├─ 3. Bridge     .doc/.xls → .docx/.xlsx through soffice (optional)
//!  ├─ 4. Convert    docling on the blocking pool (standard or force-OCR)
//!  ├─ 5. Normalize  images into images/, references rewritten
//!  ├─ 6. Package    <id>.zip, task directory removed → COMPLETED
//!  └─ 7. Evict      after the TTL, directory and archive are deleted
//! ```
//!
//! Any failure in steps 3 to 6 marks the job FAILED with the error text.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docbundle::{JobService, ProcessingOptions, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServiceConfig::builder().storage_root("/tmp/docbundle").build()?;
//!     let service = JobService::from_config(config)?;
//!     let bytes = std::fs::read("scan.pdf")?;
//!     let id = service.submit("scan.pdf", &bytes, ProcessingOptions::default()).await?;
//!     service.shutdown().await; // waits for the job
//!     println!("{:?}", service.download(&id)?);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docbundle` binary (clap + anyhow + tracing-subscriber) |
//!
//! ## External tools
//!
//! The production pipeline shells out to `docling` for conversion and to
//! LibreOffice's `soffice` for legacy formats. Both are configurable through
//! [`ServiceConfig`]; tests substitute in-process engines through the
//! [`pipeline::engine::ConversionEngine`] and [`pipeline::bridge::FormatBridge`]
//! traits.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod archive;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod job;
pub mod pipeline;
pub mod runner;
pub mod server;
pub mod service;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cleanup::{CleanupHandle, CleanupScheduler};
pub use config::{AcceleratorDevice, ProcessingOptions, ServiceConfig, ServiceConfigBuilder, TableFormat};
pub use error::{DocBundleError, Stage};
pub use job::{JobId, JobMetadata, JobStatus};
pub use pipeline::{ConversionPipeline, ProcessedDocument};
pub use runner::JobRunner;
pub use service::JobService;
pub use store::TaskStore;
