//! Blob storage for uploaded and enhanced images.

use std::io;

use crate::prelude::*;

use super::write_atomically;

/// Somewhere to keep image bytes.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Store `data` under `key`, returning a URL for it. Storing the same key
    /// twice overwrites the first copy.
    async fn put(&self, key: &str, data: &[u8]) -> Result<String>;

    /// Delete the blob at `url`. Deleting a missing blob succeeds.
    async fn delete(&self, url: &str) -> Result<()>;
}

/// Blobs stored as files in a local directory, addressed by `file://` URLs.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Open (and create, if necessary) a blob directory.
    pub async fn open(root: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(root)
            .await
            .with_context(|| format!("cannot create blob directory {}", root.display()))?;
        let root = tokio::fs::canonicalize(root)
            .await
            .with_context(|| format!("cannot resolve {}", root.display()))?;
        Ok(Self { root })
    }

    /// Map a URL back to one of our files.
    fn path_for_url(&self, url: &str) -> Result<PathBuf> {
        let path = url
            .strip_prefix("file://")
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("not a file URL: {:?}", url))?;
        if path.parent() != Some(self.root.as_path()) {
            return Err(anyhow!("blob URL {:?} is outside {}", url, self.root.display()));
        }
        Ok(path)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    #[instrument(level = "debug", skip(self, data), fields(len = data.len()))]
    async fn put(&self, key: &str, data: &[u8]) -> Result<String> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(anyhow!("invalid blob key {:?}", key));
        }
        let path = self.root.join(key);
        write_atomically(&path, data)
            .await
            .with_context(|| format!("cannot write blob {}", path.display()))?;
        Ok(format!("file://{}", path.display()))
    }

    #[instrument(level = "debug", skip(self))]
    async fn delete(&self, url: &str) -> Result<()> {
        let path = self.path_for_url(url)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("cannot delete blob {}", path.display()))
            }
        }
    }
}
