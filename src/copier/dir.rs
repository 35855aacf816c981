//! On-disk `dir` image layout
//!
//! A `dir` image is a directory holding `manifest.json`, one file per blob
//! named by the blob digest's hex part, and a `version` marker.

use crate::error::{Result, ResultExt};
use crate::image::DigestUtils;
use crate::registry::BlobStream;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWriteExt};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const VERSION_FILE: &str = "version";
pub const VERSION_CONTENT: &str = "Directory Transport Version: 1.1\n";

#[derive(Debug, Clone)]
pub struct DirImage {
    path: PathBuf,
}

impl DirImage {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE)
    }

    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        Ok(self.path.join(DigestUtils::encoded_part(digest)?))
    }

    /// Whether `path` looks like a `dir` image
    pub fn is_image_dir(path: &Path) -> bool {
        path.join(MANIFEST_FILE).is_file()
    }

    pub async fn read_manifest(&self) -> Result<Vec<u8>> {
        let path = self.manifest_path();
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Reading manifest {}", path.display()))
    }

    pub async fn open_blob(&self, digest: &str) -> Result<BlobStream> {
        let path = self.blob_path(digest)?;
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("Opening blob {}", path.display()))?;
        Ok(Box::pin(file))
    }

    pub async fn has_blob(&self, digest: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.blob_path(digest)?).await?)
    }

    /// Create the directory if needed and write the version marker
    pub async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.path)
            .await
            .with_context(|| format!("Creating directory {}", self.path.display()))?;
        tokio::fs::write(self.path.join(VERSION_FILE), VERSION_CONTENT).await?;
        Ok(())
    }

    pub async fn write_manifest(&self, bytes: &[u8]) -> Result<()> {
        tokio::fs::write(self.manifest_path(), bytes).await?;
        Ok(())
    }

    /// Stream `content` into the blob file for `digest`
    ///
    /// Content lands in a temporary file that is only renamed into place once
    /// the stream ended cleanly; I/O errors are returned untouched so callers
    /// can recover a verification failure from them.
    pub async fn write_blob<R>(&self, digest: &str, content: &mut R) -> std::io::Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let final_path = self
            .blob_path(digest)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let temp_path = final_path.with_extension("partial");

        let mut file = tokio::fs::File::create(&temp_path).await?;
        let written = match tokio::io::copy(content, &mut file).await {
            Ok(written) => written,
            Err(err) => {
                drop(file);
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(err);
            }
        };
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&temp_path, &final_path).await?;
        Ok(written)
    }
}
