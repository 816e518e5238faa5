//! Job record persistence.

#[cfg(test)]
use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

#[cfg(test)]
use crate::pipeline::job::{JobStatus, Stage};
use tokio::sync::Mutex as AsyncMutex;

use crate::{
    pipeline::job::{EvaluationJob, JobId},
    prelude::*,
};

use super::{StoreError, job_path, parse_job, read_if_exists, write_atomically};

/// Somewhere to keep job records.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Create or replace the record for `job.id`.
    async fn save(&self, job: &EvaluationJob) -> Result<(), StoreError>;

    /// Save `job` unless the stored record has already reached a terminal
    /// status. Returns `false`, without writing, if it has.
    ///
    /// Once a job is completed, failed or cancelled, nobody gets to change
    /// that, whether it's a late worker or a recovery sweep.
    async fn save_unless_terminal(&self, job: &EvaluationJob) -> Result<bool, StoreError>;

    /// Look up a job.
    async fn get(&self, id: JobId) -> Result<Option<EvaluationJob>, StoreError>;

    /// All jobs which have not reached a terminal status.
    async fn list_unfinished(&self) -> Result<Vec<EvaluationJob>, StoreError>;
}

/// One JSON file per job.
///
/// Writes from this process are serialized, so `save_unless_terminal` is
/// atomic here. Two processes sharing a directory can still race between the
/// read and the rename, but the window is a single small file write.
pub struct FileJobStore {
    dir: PathBuf,
    write_lock: AsyncMutex<()>,
}

impl FileJobStore {
    /// Open (and create, if necessary) a job directory.
    pub async fn open(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("cannot create job directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_owned(),
            write_lock: AsyncMutex::new(()),
        })
    }

    /// Write a record. Callers must hold `write_lock`.
    async fn write(&self, job: &EvaluationJob) -> Result<(), StoreError> {
        let path = job_path(&self.dir, job.id);
        let data = serde_json::to_vec_pretty(job)
            .map_err(|source| StoreError::BadRecord { path: path.clone(), source })?;
        write_atomically(&path, &data).await
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    #[instrument(level = "trace", skip_all, fields(job = %job.id, stage = ?job.stage))]
    async fn save(&self, job: &EvaluationJob) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.write(job).await
    }

    #[instrument(level = "trace", skip_all, fields(job = %job.id, status = ?job.status))]
    async fn save_unless_terminal(&self, job: &EvaluationJob) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        if let Some(stored) = self.get(job.id).await?
            && stored.status.is_terminal()
        {
            return Ok(false);
        }
        self.write(job).await?;
        Ok(true)
    }

    async fn get(&self, id: JobId) -> Result<Option<EvaluationJob>, StoreError> {
        let path = job_path(&self.dir, id);
        match read_if_exists(&path).await? {
            Some(data) => Ok(Some(parse_job(&path, &data)?)),
            None => Ok(None),
        }
    }

    async fn list_unfinished(&self) -> Result<Vec<EvaluationJob>, StoreError> {
        let mut jobs = vec![];
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let Some(data) = read_if_exists(&path).await? else {
                continue;
            };
            match parse_job(&path, &data) {
                Ok(job) if !job.status.is_terminal() => jobs.push(job),
                Ok(_) => {}
                // One bad file shouldn't stop a recovery sweep.
                Err(err) => warn!("Skipping unreadable job record: {}", err),
            }
        }
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }
}

/// Jobs kept in memory, with failure injection for tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<JobId, EvaluationJob>>,

    /// Fail this many upcoming saves.
    failing_saves: AtomicUsize,

    /// Fail every save of a processing job at this stage.
    failing_stage: Mutex<Option<Stage>>,
}

#[cfg(test)]
impl MemoryJobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` saves fail with a transient error.
    pub fn fail_next_saves(&self, count: usize) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    /// Make every checkpoint at `stage` fail with a transient error.
    pub fn fail_saves_at(&self, stage: Stage) {
        *self.failing_stage.lock().expect("lock poisoned") = Some(stage);
    }

    /// Should this save fail?
    fn should_fail(&self, job: &EvaluationJob) -> bool {
        let failing_stage = *self.failing_stage.lock().expect("lock poisoned");
        if job.status == JobStatus::Processing && failing_stage == Some(job.stage) {
            return true;
        }
        self.failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[cfg(test)]
#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save(&self, job: &EvaluationJob) -> Result<(), StoreError> {
        if self.should_fail(job) {
            return Err(StoreError::Unavailable(format!(
                "injected failure saving {}",
                job.id
            )));
        }
        self.jobs
            .lock()
            .expect("lock poisoned")
            .insert(job.id, job.clone());
        Ok(())
    }

    async fn save_unless_terminal(&self, job: &EvaluationJob) -> Result<bool, StoreError> {
        if self.should_fail(job) {
            return Err(StoreError::Unavailable(format!(
                "injected failure saving {}",
                job.id
            )));
        }
        let mut jobs = self.jobs.lock().expect("lock poisoned");
        if jobs.get(&job.id).is_some_and(|stored| stored.status.is_terminal()) {
            return Ok(false);
        }
        jobs.insert(job.id, job.clone());
        Ok(true)
    }

    async fn get(&self, id: JobId) -> Result<Option<EvaluationJob>, StoreError> {
        Ok(self.jobs.lock().expect("lock poisoned").get(&id).cloned())
    }

    async fn list_unfinished(&self) -> Result<Vec<EvaluationJob>, StoreError> {
        let mut jobs = self
            .jobs
            .lock()
            .expect("lock poisoned")
            .values()
            .filter(|job| !job.status.is_terminal())
            .cloned()
            .collect::<Vec<_>>();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }
}
