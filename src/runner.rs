//! Background execution of one job.
//!
//! [`JobRunner::run`] drives the status machine:
//!
//! ```text
//! PENDING ──▶ PROCESSING ──▶ COMPLETED
//!                  │
//!                  └──────▶ FAILED
//! ```
//!
//! Every error raised by the pipeline or the packager ends here and is
//! recorded as the job's FAILED status; nothing propagates to the caller.
//! A panic inside the work is caught in place and treated the same way, so
//! the job never outlives the worker task that supervises it.

use crate::archive;
use crate::config::ProcessingOptions;
use crate::error::DocBundleError;
use crate::job::{JobId, JobStatus};
use crate::pipeline::ConversionPipeline;
use crate::store::TaskStore;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempPath;
use tracing::{error, info, Instrument};

/// Runs a single job against the shared store and pipeline.
#[derive(Debug, Clone)]
pub struct JobRunner {
    store: Arc<TaskStore>,
    pipeline: Arc<ConversionPipeline>,
}

impl JobRunner {
    pub fn new(store: Arc<TaskStore>, pipeline: Arc<ConversionPipeline>) -> Self {
        Self { store, pipeline }
    }

    /// Process the upload at `upload` for job `id` and record the outcome.
    ///
    /// The upload file is deleted on every exit path.
    pub async fn run(&self, id: JobId, upload: PathBuf, options: ProcessingOptions) {
        let span = tracing::info_span!("job", task_id = %id);
        let work = async {
            // Removed when this future completes or is dropped.
            let upload = TempPath::from_path(upload);
            self.execute(id, &upload, options).await
        };

        let outcome = match AssertUnwindSafe(work.instrument(span.clone()))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(DocBundleError::Internal(format!(
                "worker panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };

        let _enter = span.enter();
        match outcome {
            Ok(()) => {
                self.store.update_status(&id, JobStatus::Completed, None);
                info!("Task completed");
            }
            Err(e) => {
                error!(stage = ?e.stage(), "Task failed: {}", e);
                self.store
                    .update_status(&id, JobStatus::Failed, Some(e.to_string()));
            }
        }
    }

    async fn execute(
        &self,
        id: JobId,
        upload: &std::path::Path,
        options: ProcessingOptions,
    ) -> Result<(), DocBundleError> {
        let task_dir = self.store.task_path(&id);
        if !self.store.update_status(&id, JobStatus::Processing, None) {
            return Err(DocBundleError::NotFound { id: id.to_string() });
        }
        info!(force_ocr = options.force_ocr, "Task processing started");

        let document = self.pipeline.process(upload, &task_dir, &options).await?;
        info!(
            images = document.image_count,
            pages = ?document.page_count,
            "Document converted"
        );

        let archive = archive::pack(&task_dir).await?;
        info!("Archive ready at {}", archive.display());
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
