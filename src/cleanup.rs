//! Periodic eviction of expired jobs.

use crate::store::TaskStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Spawns the eviction loop.
#[derive(Debug, Clone)]
pub struct CleanupScheduler {
    store: Arc<TaskStore>,
    ttl: Duration,
    interval: Duration,
    retry_interval: Duration,
}

/// Handle to a running [`CleanupScheduler`] loop.
#[derive(Debug)]
pub struct CleanupHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl CleanupScheduler {
    pub fn new(
        store: Arc<TaskStore>,
        ttl: Duration,
        interval: Duration,
        retry_interval: Duration,
    ) -> Self {
        Self {
            store,
            ttl,
            interval,
            retry_interval,
        }
    }

    /// Start the loop on the current runtime.
    ///
    /// Sleeps `interval`, evicts, and repeats. After a failed pass the next
    /// sleep is `retry_interval` instead.
    pub fn spawn(self) -> CleanupHandle {
        let token = CancellationToken::new();
        let child = token.clone();
        let handle = tokio::spawn(async move { self.run(child).await });
        CleanupHandle { token, handle }
    }

    async fn run(self, token: CancellationToken) {
        info!(
            "Cleanup scheduler started (ttl {}s, every {}s)",
            self.ttl.as_secs(),
            self.interval.as_secs()
        );
        let mut wait = self.interval;
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            wait = match self.store.evict_expired(self.ttl).await {
                Ok(count) => {
                    debug!("Cleanup pass evicted {} task(s)", count);
                    self.interval
                }
                Err(e) => {
                    error!(
                        "Error in cleanup task: {}; retrying in {}s",
                        e,
                        self.retry_interval.as_secs()
                    );
                    self.retry_interval
                }
            };
        }
        info!("Cleanup scheduler stopped");
    }
}

impl CleanupHandle {
    /// Cancel the loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            error!("Cleanup task ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
