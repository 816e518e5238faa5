//! Persistent state: uploaded images, job records and scheduled tasks.

use std::{io, sync::Arc};

use crate::{
    pipeline::job::{EvaluationJob, JobId},
    prelude::*,
    retry::IsKnownTransient,
};

pub mod blobs;
pub mod jobs;
pub mod tasks;

pub use blobs::{BlobStore, LocalBlobStore};
#[cfg(test)]
pub use jobs::MemoryJobStore;
pub use jobs::{FileJobStore, JobStore};
pub use tasks::{CleanupTask, TaskLedger};

/// An error reading or writing persistent state.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A filesystem error.
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record we couldn't parse or serialize.
    #[error("bad record {path}: {source}")]
    BadRecord {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The store is temporarily unavailable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl IsKnownTransient for StoreError {
    fn is_known_transient(&self) -> bool {
        match self {
            StoreError::Io(err) => err.is_known_transient(),
            StoreError::BadRecord { .. } => false,
            StoreError::Unavailable(_) => true,
        }
    }
}

/// Our on-disk stores, all under one data directory.
pub struct Storage {
    pub jobs: Arc<FileJobStore>,
    pub blobs: Arc<LocalBlobStore>,
    pub tasks: Arc<TaskLedger>,
}

impl Storage {
    /// Open (and create, if necessary) the stores in `data_dir`.
    #[instrument(level = "debug")]
    pub async fn open(data_dir: &Path) -> Result<Self> {
        Ok(Self {
            jobs: Arc::new(FileJobStore::open(&data_dir.join("jobs")).await?),
            blobs: Arc::new(LocalBlobStore::open(&data_dir.join("blobs")).await?),
            tasks: Arc::new(TaskLedger::open(&data_dir.join("tasks").join("cleanup.json")).await?),
        })
    }
}

/// Write `data` to `path` so readers never see a partial file.
async fn write_atomically(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    tokio::fs::write(&tmp_path, data).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Read `path`, returning `None` if it doesn't exist.
async fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Where we keep the record for job `id`.
fn job_path(dir: &Path, id: JobId) -> PathBuf {
    dir.join(format!("{id}.json"))
}

/// Parse a job record.
fn parse_job(path: &Path, data: &[u8]) -> Result<EvaluationJob, StoreError> {
    serde_json::from_slice(data).map_err(|source| StoreError::BadRecord {
        path: path.to_owned(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Unavailable("busy".to_owned()).is_known_transient());
        let not_found = io::Error::from(io::ErrorKind::NotFound);
        assert!(!StoreError::Io(not_found).is_known_transient());
        let interrupted = io::Error::from(io::ErrorKind::Interrupted);
        assert!(StoreError::Io(interrupted).is_known_transient());
    }

    #[tokio::test]
    async fn test_write_atomically() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("record.json");
        write_atomically(&path, b"{}").await.unwrap();
        write_atomically(&path, b"[]").await.unwrap();
        assert_eq!(read_if_exists(&path).await.unwrap().unwrap(), b"[]");
        assert!(!dir.path().join("record.json.tmp").exists());
        assert!(
            read_if_exists(&dir.path().join("missing"))
                .await
                .unwrap()
                .is_none()
        );
    }
}
