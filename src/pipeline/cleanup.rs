//! Delayed deletion of uploaded images.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::{
    prelude::*,
    storage::{BlobStore, CleanupTask, TaskLedger},
};

use super::job::JobId;

/// What happened during a cleanup run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Tasks we finished.
    pub completed: usize,

    /// Tasks we'll retry next time.
    pub deferred: usize,
}

/// Schedules and runs blob cleanup tasks.
pub struct CleanupScheduler {
    ledger: Arc<TaskLedger>,
    blobs: Arc<dyn BlobStore>,
}

impl CleanupScheduler {
    pub fn new(ledger: Arc<TaskLedger>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { ledger, blobs }
    }

    /// Arrange for `blob_urls` to be deleted `delay` from now.
    pub async fn schedule(
        &self,
        job_id: JobId,
        blob_urls: Vec<String>,
        delay: Duration,
    ) -> Result<()> {
        if blob_urls.is_empty() {
            return Ok(());
        }
        self.ledger
            .schedule(CleanupTask {
                job_id,
                blob_urls,
                due_at: Utc::now() + delay,
            })
            .await
    }

    /// Run every task due at `now`. A task whose blobs can't all be deleted
    /// stays in the ledger for the next run.
    #[instrument(level = "debug", skip(self))]
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        for task in self.ledger.due(now).await? {
            let mut all_deleted = true;
            for url in &task.blob_urls {
                if let Err(err) = self.blobs.delete(url).await {
                    warn!(job = %task.job_id, url, "Could not delete blob: {:#}", err);
                    all_deleted = false;
                }
            }
            if all_deleted {
                self.ledger.complete(task.job_id).await?;
                report.completed += 1;
            } else {
                report.deferred += 1;
            }
        }
        if report.completed > 0 || report.deferred > 0 {
            info!(
                completed = report.completed,
                deferred = report.deferred,
                "Ran cleanup tasks"
            );
        }
        Ok(report)
    }
}
