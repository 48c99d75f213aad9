use anyhow::{Result, bail};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};
use url::Url;

/// On-disk object storage.
///
/// Each object lives at `{storage_dir}/{bucket}/{path}`. Paths are relative
/// and may not climb out of their bucket.
pub struct ObjectStorage {
    dir: PathBuf,
}

impl ObjectStorage {
    pub async fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        let dir = fs::canonicalize(&dir).await?;
        info!("Object storage directory: {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of an object on disk.
    pub fn object_path(&self, bucket: &str, path: &str) -> Result<PathBuf> {
        let mut full = self.dir.clone();
        for part in [bucket, path] {
            let relative = Path::new(part);
            if part.is_empty()
                || relative
                    .components()
                    .any(|c| !matches!(c, Component::Normal(_)))
            {
                bail!("Invalid object path: {}/{}", bucket, path);
            }
            full.push(relative);
        }
        Ok(full)
    }

    /// Store an object. Without `upsert`, an existing object is an error.
    pub async fn put(&self, bucket: &str, path: &str, data: &[u8], upsert: bool) -> Result<()> {
        let full = self.object_path(bucket, path)?;
        if !upsert && fs::try_exists(&full).await? {
            bail!("Object already exists: {}/{}", bucket, path);
        }
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&full, data).await?;
        info!("Stored {}/{} ({} bytes)", bucket, path, data.len());
        Ok(())
    }

    pub async fn read(&self, bucket: &str, path: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.object_path(bucket, path)?).await?)
    }

    pub async fn delete(&self, bucket: &str, path: &str) -> Result<()> {
        let full = self.object_path(bucket, path)?;
        match fs::remove_file(&full).await {
            Ok(()) => {
                info!("Deleted {}/{}", bucket, path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Object {}/{} already gone", bucket, path);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// `file://` URL for an object. Falls back to the bare joined path when
    /// the location can't be expressed as a URL.
    pub fn public_url(&self, bucket: &str, path: &str) -> String {
        let full = self.dir.join(bucket).join(path);
        match Url::from_file_path(&full) {
            Ok(url) => url.to_string(),
            Err(()) => full.display().to_string(),
        }
    }
}
