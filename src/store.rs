//! Task registry and on-disk layout.
//!
//! [`TaskStore`] is the one piece of shared mutable state in the service. It
//! maps job ids to [`JobMetadata`] behind a `parking_lot::RwLock` and owns the
//! directory layout under the storage root:
//!
//! ```text
//! <root>/<id>/                task directory (document.md, images/)
//! <root>/<id>.zip             packaged bundle
//! <root>/<id>_upload.<ext>    temporary upload
//! ```
//!
//! Lock sections only touch the map; filesystem work happens outside them so a
//! slow disk never stalls status queries.

use crate::error::DocBundleError;
use crate::job::{JobId, JobMetadata, JobStatus};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name of the image directory inside every task directory.
pub const IMAGES_DIR: &str = "images";

/// In-memory job registry plus the task directory layout.
#[derive(Debug)]
pub struct TaskStore {
    root: PathBuf,
    tasks: RwLock<HashMap<JobId, JobMetadata>>,
}

impl TaskStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, DocBundleError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| DocBundleError::Allocation {
            path: root.clone(),
            source: e,
        })?;
        debug!("Task store rooted at {}", root.display());
        Ok(Self {
            root,
            tasks: RwLock::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocate the task directory (with `images/`) and register the job as
    /// PENDING, created now.
    pub async fn create(&self, id: JobId) -> Result<PathBuf, DocBundleError> {
        self.create_at(id, Utc::now()).await
    }

    async fn create_at(
        &self,
        id: JobId,
        created_at: DateTime<Utc>,
    ) -> Result<PathBuf, DocBundleError> {
        let task_path = self.task_path(&id);
        let images_path = task_path.join(IMAGES_DIR);
        tokio::fs::create_dir_all(&images_path)
            .await
            .map_err(|e| DocBundleError::Allocation {
                path: images_path.clone(),
                source: e,
            })?;

        self.tasks.write().insert(
            id,
            JobMetadata {
                id,
                status: JobStatus::Pending,
                created_at,
                error: None,
                path: task_path.clone(),
            },
        );
        debug!(task_id = %id, "Created task directory {}", task_path.display());
        Ok(task_path)
    }

    /// Record a status change.
    ///
    /// Unknown ids are ignored: eviction may legitimately race a lagging
    /// update. Transitions that would move a job backwards or out of a
    /// terminal state are refused. Returns whether the update was applied.
    pub fn update_status(&self, id: &JobId, status: JobStatus, error: Option<String>) -> bool {
        let mut tasks = self.tasks.write();
        let Some(entry) = tasks.get_mut(id) else {
            debug!(task_id = %id, %status, "Status update for unknown task ignored");
            return false;
        };
        if !entry.status.can_transition_to(status) {
            warn!(
                task_id = %id,
                from = %entry.status,
                to = %status,
                "Refusing out-of-order status transition"
            );
            return false;
        }
        entry.status = status;
        if error.is_some() {
            entry.error = error;
        }
        true
    }

    /// Snapshot of a job's metadata. `None` for unknown or evicted jobs.
    pub fn get_status(&self, id: &JobId) -> Option<JobMetadata> {
        self.tasks.read().get(id).cloned()
    }

    pub fn task_path(&self, id: &JobId) -> PathBuf {
        self.root.join(id.to_string())
    }

    pub fn archive_path(&self, id: &JobId) -> PathBuf {
        self.root.join(format!("{id}.zip"))
    }

    /// Location of the temporary upload; `extension` includes the leading dot.
    pub fn upload_path(&self, id: &JobId, extension: &str) -> PathBuf {
        self.root.join(format!("{id}_upload{extension}"))
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    /// Remove a job's directory, archive and registry entry, in that order.
    ///
    /// Idempotent: files that are already gone are not an error.
    pub async fn delete(&self, id: &JobId) -> Result<(), DocBundleError> {
        let task_path = self.task_path(id);
        let archive_path = self.archive_path(id);

        ignore_not_found(tokio::fs::remove_dir_all(&task_path).await).map_err(|e| {
            DocBundleError::Internal(format!(
                "Failed to remove task directory '{}': {e}",
                task_path.display()
            ))
        })?;
        ignore_not_found(tokio::fs::remove_file(&archive_path).await).map_err(|e| {
            DocBundleError::Internal(format!(
                "Failed to remove archive '{}': {e}",
                archive_path.display()
            ))
        })?;

        self.tasks.write().remove(id);
        info!(task_id = %id, "Deleted task");
        Ok(())
    }

    /// Delete every job created at or before `now - ttl`.
    ///
    /// Returns the number of jobs evicted. The id set is snapshotted first so
    /// jobs created during the pass are never touched.
    pub async fn evict_expired(&self, ttl: Duration) -> Result<usize, DocBundleError> {
        self.evict_expired_at(ttl, Utc::now()).await
    }

    async fn evict_expired_at(
        &self,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, DocBundleError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| DocBundleError::InvalidConfig(format!("TTL out of range: {e}")))?;
        let Some(cutoff) = now.checked_sub_signed(ttl) else {
            // Older than any representable instant: nothing can be expired.
            return Ok(0);
        };

        let expired: Vec<JobId> = self
            .tasks
            .read()
            .values()
            .filter(|meta| meta.created_at <= cutoff)
            .map(|meta| meta.id)
            .collect();

        let mut first_error = None;
        let mut evicted = 0usize;
        for id in &expired {
            match self.delete(id).await {
                Ok(()) => evicted += 1,
                Err(e) => {
                    warn!(task_id = %id, "Eviction failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        info!("Cleaned up {} old tasks", evicted);
        match first_error {
            Some(e) => Err(e),
            None => Ok(evicted),
        }
    }
}

fn ignore_not_found(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, TaskStore) {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path().join("storage")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn create_allocates_directory_and_pending_entry() {
        let (_dir, store) = store();
        let id = JobId::new();
        let path = store.create(id).await.unwrap();

        assert!(path.join(IMAGES_DIR).is_dir());
        let meta = store.get_status(&id).unwrap();
        assert_eq!(meta.status, JobStatus::Pending);
        assert_eq!(meta.path, path);
        assert!(meta.error.is_none());
    }

    #[tokio::test]
    async fn create_fails_when_root_is_a_file() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path().join("storage")).unwrap();
        std::fs::remove_dir(store.root()).unwrap();
        std::fs::write(store.root(), b"not a directory").unwrap();

        let id = JobId::new();
        let err = store.create(id).await.unwrap_err();
        assert!(matches!(err, DocBundleError::Allocation { .. }));
        assert!(store.get_status(&id).is_none());
    }

    #[test]
    fn paths_are_derived_from_id() {
        let (_dir, store) = store();
        let id = JobId::new();
        assert_eq!(store.task_path(&id), store.root().join(id.to_string()));
        assert_eq!(
            store.archive_path(&id),
            store.root().join(format!("{id}.zip"))
        );
        assert_eq!(
            store.upload_path(&id, ".pdf"),
            store.root().join(format!("{id}_upload.pdf"))
        );
    }

    #[tokio::test]
    async fn update_unknown_id_is_noop() {
        let (_dir, store) = store();
        assert!(!store.update_status(&JobId::new(), JobStatus::Processing, None));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn update_records_error_text() {
        let (_dir, store) = store();
        let id = JobId::new();
        store.create(id).await.unwrap();
        assert!(store.update_status(&id, JobStatus::Processing, None));
        assert!(store.update_status(&id, JobStatus::Failed, Some("boom".into())));

        let meta = store.get_status(&id).unwrap();
        assert_eq!(meta.status, JobStatus::Failed);
        assert_eq!(meta.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn update_refuses_backward_transition() {
        let (_dir, store) = store();
        let id = JobId::new();
        store.create(id).await.unwrap();
        store.update_status(&id, JobStatus::Processing, None);
        store.update_status(&id, JobStatus::Completed, None);

        assert!(!store.update_status(&id, JobStatus::Failed, Some("late".into())));
        assert!(!store.update_status(&id, JobStatus::Pending, None));
        let meta = store.get_status(&id).unwrap();
        assert_eq!(meta.status, JobStatus::Completed);
        assert!(meta.error.is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, store) = store();
        let id = JobId::new();
        let path = store.create(id).await.unwrap();
        std::fs::write(store.archive_path(&id), b"zip").unwrap();

        store.delete(&id).await.unwrap();
        assert!(!path.exists());
        assert!(!store.archive_path(&id).exists());
        assert!(store.get_status(&id).is_none());

        store.delete(&id).await.unwrap();
    }

    #[tokio::test]
    async fn evict_expired_uses_inclusive_cutoff() {
        let (_dir, store) = store();
        let now = Utc::now();
        let ttl = Duration::from_secs(3600);
        let at_cutoff = JobId::new();
        let younger = JobId::new();

        store
            .create_at(at_cutoff, now - chrono::Duration::seconds(3600))
            .await
            .unwrap();
        store
            .create_at(younger, now - chrono::Duration::seconds(3599))
            .await
            .unwrap();

        let evicted = store.evict_expired_at(ttl, now).await.unwrap();
        assert_eq!(evicted, 1);
        assert!(store.get_status(&at_cutoff).is_none());
        assert!(!store.task_path(&at_cutoff).exists());
        assert!(store.get_status(&younger).is_some());
        assert!(store.task_path(&younger).exists());
    }

    #[tokio::test]
    async fn evict_expired_twice_evicts_nothing_the_second_time() {
        let (_dir, store) = store();
        let now = Utc::now();
        for _ in 0..3 {
            store
                .create_at(JobId::new(), now - chrono::Duration::hours(48))
                .await
                .unwrap();
        }
        store.create_at(JobId::new(), now).await.unwrap();

        let ttl = Duration::from_secs(24 * 3600);
        assert_eq!(store.evict_expired_at(ttl, now).await.unwrap(), 3);
        assert_eq!(store.evict_expired_at(ttl, now).await.unwrap(), 0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn evict_removes_archive_of_packaged_job() {
        let (_dir, store) = store();
        let now = Utc::now();
        let id = JobId::new();
        let path = store
            .create_at(id, now - chrono::Duration::hours(2))
            .await
            .unwrap();
        std::fs::remove_dir_all(&path).unwrap();
        std::fs::write(store.archive_path(&id), b"zip").unwrap();

        let evicted = store
            .evict_expired_at(Duration::from_secs(3600), now)
            .await
            .unwrap();
        assert_eq!(evicted, 1);
        assert!(!store.archive_path(&id).exists());
    }
}
