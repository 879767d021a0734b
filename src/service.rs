//! Job submission, lookup and download.
//!
//! [`JobService`] is the entry point shared by the HTTP layer and the tests.
//! It validates uploads, allocates jobs in the [`TaskStore`], and hands each
//! job to a supervised worker pool:
//!
//! * workers live in a `JoinSet` owned by the service, so none is detached;
//! * a `Semaphore` bounds how many run the pipeline at once. A job waiting
//!   for a permit stays PENDING;
//! * [`JobService::shutdown`] stops intake and waits for every worker.

use crate::config::{ProcessingOptions, ServiceConfig};
use crate::error::DocBundleError;
use crate::job::{JobId, JobMetadata, JobStatus};
use crate::pipeline::input::validate_upload;
use crate::pipeline::ConversionPipeline;
use crate::runner::JobRunner;
use crate::store::TaskStore;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Asynchronous document jobs over a shared [`TaskStore`].
pub struct JobService {
    config: ServiceConfig,
    store: Arc<TaskStore>,
    runner: JobRunner,
    permits: Arc<Semaphore>,
    workers: Mutex<JoinSet<()>>,
    accepting: AtomicBool,
}

impl std::fmt::Debug for JobService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobService")
            .field("root", &self.store.root())
            .field("tasks", &self.store.len())
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

impl JobService {
    /// Build a service with the given pipeline.
    pub fn new(config: ServiceConfig, pipeline: ConversionPipeline) -> Result<Self, DocBundleError> {
        let store = Arc::new(TaskStore::new(&config.storage_root)?);
        let runner = JobRunner::new(Arc::clone(&store), Arc::new(pipeline));
        let permits = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        Ok(Self {
            config,
            store,
            runner,
            permits,
            workers: Mutex::new(JoinSet::new()),
            accepting: AtomicBool::new(true),
        })
    }

    /// Build a service with the docling engines and soffice bridge.
    pub fn from_config(config: ServiceConfig) -> Result<Self, DocBundleError> {
        let pipeline = ConversionPipeline::from_config(&config);
        Self::new(config, pipeline)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Accept an upload and schedule it. Returns as soon as the job is
    /// registered; the job is PENDING at that point.
    ///
    /// Validation errors are returned before anything is written.
    pub async fn submit(
        &self,
        file_name: &str,
        bytes: &[u8],
        options: ProcessingOptions,
    ) -> Result<JobId, DocBundleError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(DocBundleError::ShuttingDown);
        }
        let (format, extension) =
            validate_upload(file_name, bytes.len() as u64, self.config.max_upload_bytes)?;

        let id = JobId::new();
        self.store.create(id).await?;

        let upload = self.store.upload_path(&id, &extension);
        if let Err(e) = tokio::fs::write(&upload, bytes).await {
            let _ = tokio::fs::remove_file(&upload).await;
            if let Err(cleanup) = self.store.delete(&id).await {
                warn!(task_id = %id, "Could not roll back task: {}", cleanup);
            }
            return Err(DocBundleError::Allocation {
                path: upload,
                source: e,
            });
        }

        if !self.spawn(id, upload.clone(), options) {
            // Shutdown began while the job was being allocated.
            let _ = tokio::fs::remove_file(&upload).await;
            if let Err(e) = self.store.delete(&id).await {
                warn!(task_id = %id, "Could not roll back task: {}", e);
            }
            return Err(DocBundleError::ShuttingDown);
        }
        info!(
            task_id = %id,
            file = file_name,
            format = format.extension(),
            size = bytes.len(),
            force_ocr = options.force_ocr,
            "Task accepted"
        );
        Ok(id)
    }

    /// Hand the job to a worker. Returns `false` once intake is closed.
    ///
    /// Intake is re-checked under the `workers` lock, which `shutdown` holds
    /// while closing it, so no worker can land in a set that is not drained.
    fn spawn(&self, id: JobId, upload: PathBuf, options: ProcessingOptions) -> bool {
        let mut workers = self.workers.lock();
        if !self.accepting.load(Ordering::Acquire) {
            return false;
        }
        let runner = self.runner.clone();
        let permits = Arc::clone(&self.permits);
        workers.spawn(async move {
            // The semaphore is never closed; a missing permit only means no limit.
            let _permit = permits.acquire_owned().await.ok();
            runner.run(id, upload, options).await;
        });
        while let Some(done) = workers.try_join_next() {
            if let Err(e) = done {
                error!("Worker ended abnormally: {}", e);
            }
        }
        debug!("{} worker(s) in flight", workers.len());
        true
    }

    /// Current metadata of a job.
    pub fn status(&self, id: &JobId) -> Result<JobMetadata, DocBundleError> {
        self.store
            .get_status(id)
            .ok_or_else(|| DocBundleError::NotFound { id: id.to_string() })
    }

    /// Path of the finished archive.
    ///
    /// Fails with `NotReady` unless the job is COMPLETED, and with `NotFound`
    /// for unknown jobs or when the archive has vanished from disk.
    pub fn download(&self, id: &JobId) -> Result<PathBuf, DocBundleError> {
        let meta = self.status(id)?;
        if meta.status != JobStatus::Completed {
            return Err(DocBundleError::NotReady {
                id: *id,
                status: meta.status,
            });
        }
        let archive = self.store.archive_path(id);
        if !archive.is_file() {
            warn!(task_id = %id, "Completed task has no archive on disk");
            return Err(DocBundleError::NotFound { id: id.to_string() });
        }
        Ok(archive)
    }

    /// Stop accepting jobs and wait for every in-flight job to finish.
    pub async fn shutdown(&self) {
        let mut workers = {
            let mut guard = self.workers.lock();
            self.accepting.store(false, Ordering::Release);
            std::mem::take(&mut *guard)
        };
        if !workers.is_empty() {
            info!("Waiting for {} in-flight task(s)", workers.len());
        }
        while let Some(done) = workers.join_next().await {
            if let Err(e) = done {
                error!("Worker ended abnormally: {}", e);
            }
        }
        info!("Job service drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableFormat;
    use crate::pipeline::bridge::FormatBridge;
    use crate::pipeline::engine::{
        ConversionEngine, ConvertedDocument, EngineError, ImageRefMode, PipelineOptions, Picture,
    };
    use crate::pipeline::input::DocumentFormat;
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    struct SlowEngine(PipelineOptions, Duration);
    struct Doc;

    impl ConvertedDocument for Doc {
        fn page_count(&self) -> Option<usize> {
            None
        }
        fn pictures(&self) -> &[Picture] {
            &[]
        }
        fn save_as_markdown(&self, dest: &Path, _: ImageRefMode) -> Result<(), EngineError> {
            Ok(std::fs::write(dest, "text")?)
        }
    }

    impl ConversionEngine for SlowEngine {
        fn name(&self) -> &str {
            "slow"
        }
        fn options(&self) -> &PipelineOptions {
            &self.0
        }
        fn convert(&self, _: &Path, _: TableFormat) -> Result<Box<dyn ConvertedDocument>, EngineError> {
            std::thread::sleep(self.1);
            Ok(Box::new(Doc))
        }
    }

    struct NoBridge;

    #[async_trait]
    impl FormatBridge for NoBridge {
        async fn convert(&self, _: &Path, _: DocumentFormat, _: &Path) -> Result<PathBuf, DocBundleError> {
            Err(DocBundleError::Internal("no bridge".into()))
        }
    }

    fn service(dir: &TempDir, delay: Duration, max_upload: u64) -> JobService {
        let config = ServiceConfig::builder()
            .storage_root(dir.path())
            .max_upload_bytes(max_upload)
            .max_concurrent_jobs(1)
            .build()
            .unwrap();
        let engine = Arc::new(SlowEngine(PipelineOptions::default(), delay));
        let pipeline = ConversionPipeline::new(engine.clone(), engine, Arc::new(NoBridge), dir.path());
        JobService::new(config, pipeline).unwrap()
    }

    #[tokio::test]
    async fn rejected_upload_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, Duration::ZERO, 10);

        let err = svc.submit("a.pdf", &[0u8; 11], ProcessingOptions::default()).await.unwrap_err();
        assert!(matches!(err, DocBundleError::FileTooLarge { .. }));
        let err = svc.submit("a.txt", b"x", ProcessingOptions::default()).await.unwrap_err();
        assert!(err.is_validation());
        assert!(svc.store().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn second_job_waits_pending_for_a_permit() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, Duration::from_millis(300), 1024);

        let first = svc.submit("a.pdf", b"1", ProcessingOptions::default()).await.unwrap();
        let second = svc.submit("b.pdf", b"2", ProcessingOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(svc.status(&first).unwrap().status, JobStatus::Processing);
        assert_eq!(svc.status(&second).unwrap().status, JobStatus::Pending);

        svc.shutdown().await;
        assert_eq!(svc.status(&first).unwrap().status, JobStatus::Completed);
        assert_eq!(svc.status(&second).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn download_requires_completion() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, Duration::from_millis(200), 1024);

        let id = svc.submit("a.png", b"img", ProcessingOptions::default()).await.unwrap();
        let err = svc.download(&id).unwrap_err();
        assert!(matches!(err, DocBundleError::NotReady { .. }));

        svc.shutdown().await;
        let archive = svc.download(&id).unwrap();
        assert_eq!(archive, svc.store().archive_path(&id));
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, Duration::ZERO, 1024);
        let id = JobId::new();
        assert!(matches!(svc.status(&id), Err(DocBundleError::NotFound { .. })));
        assert!(matches!(svc.download(&id), Err(DocBundleError::NotFound { .. })));
    }

    #[tokio::test]
    async fn shutdown_racing_submit_never_leaves_a_job_behind() {
        for _ in 0..20 {
            let dir = TempDir::new().unwrap();
            let svc = service(&dir, Duration::from_millis(20), 1024);

            let (submitted, ()) = tokio::join!(
                svc.submit("a.pdf", b"x", ProcessingOptions::default()),
                svc.shutdown()
            );
            match submitted {
                Ok(id) => {
                    let status = svc.status(&id).unwrap().status;
                    assert!(status.is_terminal(), "shutdown returned with {status:?}");
                }
                Err(DocBundleError::ShuttingDown) => {
                    assert!(svc.store().is_empty());
                    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    }

    #[tokio::test]
    async fn shutdown_refuses_new_jobs() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, Duration::ZERO, 1024);
        svc.shutdown().await;
        let err = svc.submit("a.pdf", b"x", ProcessingOptions::default()).await.unwrap_err();
        assert!(matches!(err, DocBundleError::ShuttingDown));
    }
}
