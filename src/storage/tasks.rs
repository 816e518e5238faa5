//! A small durable ledger of scheduled tasks.
//!
//! The ledger is a single JSON file, rewritten atomically on every change.
//! It is meant for a handful of pending tasks per job, not a work queue.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use tokio::sync::Mutex;

use crate::{pipeline::job::JobId, prelude::*};

use super::{StoreError, read_if_exists, write_atomically};

/// Delete a job's blobs once `due_at` has passed.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct CleanupTask {
    /// The job which owns the blobs.
    pub job_id: JobId,

    /// Blobs to delete.
    pub blob_urls: Vec<String>,

    /// When to delete them.
    pub due_at: DateTime<Utc>,
}

/// File-backed list of pending cleanup tasks.
pub struct TaskLedger {
    path: PathBuf,

    /// Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl TaskLedger {
    /// Open a ledger. The file is created on first write.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        Ok(Self {
            path: path.to_owned(),
            lock: Mutex::new(()),
        })
    }

    /// Add a task, replacing any existing task for the same job.
    #[instrument(level = "debug", skip_all, fields(job = %task.job_id, due_at = %task.due_at))]
    pub async fn schedule(&self, task: CleanupTask) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut tasks = self.read().await?;
        tasks.retain(|t| t.job_id != task.job_id);
        tasks.push(task);
        self.write(&tasks).await
    }

    /// All tasks due at or before `now`, earliest first.
    pub async fn due(&self, now: DateTime<Utc>) -> Result<Vec<CleanupTask>> {
        let _guard = self.lock.lock().await;
        let mut due = self
            .read()
            .await?
            .into_iter()
            .filter(|t| t.due_at <= now)
            .collect::<Vec<_>>();
        due.sort_by_key(|t| t.due_at);
        Ok(due)
    }

    /// All pending tasks.
    pub async fn pending(&self) -> Result<Vec<CleanupTask>> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    /// Remove the task for `job_id`, if any.
    pub async fn complete(&self, job_id: JobId) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut tasks = self.read().await?;
        let before = tasks.len();
        tasks.retain(|t| t.job_id != job_id);
        if tasks.len() != before {
            self.write(&tasks).await?;
        }
        Ok(())
    }

    async fn read(&self) -> Result<Vec<CleanupTask>> {
        let Some(data) = read_if_exists(&self.path).await? else {
            return Ok(vec![]);
        };
        let tasks = serde_json::from_slice(&data).map_err(|source| StoreError::BadRecord {
            path: self.path.clone(),
            source,
        })?;
        Ok(tasks)
    }

    async fn write(&self, tasks: &[CleanupTask]) -> Result<()> {
        let data = serde_json::to_vec_pretty(tasks).map_err(|source| StoreError::BadRecord {
            path: self.path.clone(),
            source,
        })?;
        write_atomically(&self.path, &data).await?;
        Ok(())
    }
}
