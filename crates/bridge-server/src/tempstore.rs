//! Temporary spool for uploaded files
//!
//! Each file part of a submission is written here once, read back once when
//! it is uploaded to the CRM, and deleted after the upload attempt whether or
//! not the upload succeeded. Anything left behind (a request aborted between
//! spool and upload) is removed on drop.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ServerResult;

/// Spool directory for uploaded file parts
#[derive(Debug, Clone)]
pub struct TempFileStore {
    dir: PathBuf,
}

impl TempFileStore {
    /// Create a store rooted at the given directory, creating it if needed
    pub async fn new(dir: impl Into<PathBuf>) -> ServerResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write one file's content to the spool
    pub async fn spool(&self, content: &[u8]) -> ServerResult<SpooledFile> {
        let path = self.dir.join(Uuid::new_v4().to_string());
        tokio::fs::write(&path, content).await?;
        debug!(path = %path.display(), bytes = content.len(), "Spooled upload");
        Ok(SpooledFile { path: Some(path) })
    }
}

/// One spooled file, removed after its single read or on drop
#[derive(Debug)]
pub struct SpooledFile {
    path: Option<PathBuf>,
}

impl SpooledFile {
    /// Read the spooled content back
    pub async fn read(&self) -> ServerResult<Vec<u8>> {
        let path = self.path.as_ref().ok_or_else(|| {
            crate::error::ServerError::InternalError("spooled file read after removal".to_string())
        })?;
        Ok(tokio::fs::read(path).await?)
    }

    /// Delete the spooled file
    pub async fn remove(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), %err, "Failed to remove spooled upload");
            }
        }
    }
}

impl Drop for SpooledFile {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}
