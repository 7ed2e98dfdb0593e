//! Where task inputs come from and results go to.

use std::io;
use std::path::{Component, Path, PathBuf};

use ae_core::config::StorageConfig;
use ae_core::types::TaskId;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The reference no longer points at a file (stale download, cleaned
    /// inbox). Never retried.
    #[error("input {0} not found")]
    NotFound(String),
    #[error("invalid file reference {0:?}")]
    InvalidRef(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
pub trait FileStore: Send + Sync {
    /// Resolve an input reference to a readable local path.
    async fn acquire(&self, input_ref: &str) -> Result<PathBuf, StoreError>;

    /// Move a finished result out of the work area and return the
    /// reference the front-end delivers to the user.
    async fn publish(&self, task_id: TaskId, path: &Path) -> Result<String, StoreError>;
}

/// Inputs are file names inside the inbox directory; results are moved
/// into the media directory as `processed_<task>_<timestamp>.<ext>`.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    inbox: PathBuf,
    media: PathBuf,
}

impl LocalFileStore {
    pub fn new(inbox: impl Into<PathBuf>, media: impl Into<PathBuf>) -> Self {
        Self {
            inbox: inbox.into(),
            media: media.into(),
        }
    }

    pub fn from_config(storage: &StorageConfig) -> Self {
        Self::new(&storage.inbox_dir, &storage.media_dir)
    }

    pub fn media_dir(&self) -> &Path {
        &self.media
    }
}

/// Reject references that would escape the inbox.
fn checked_ref(input_ref: &str) -> Result<&Path, StoreError> {
    let path = Path::new(input_ref);
    let plain = !input_ref.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if plain {
        Ok(path)
    } else {
        Err(StoreError::InvalidRef(input_ref.to_string()))
    }
}

fn published_name(task_id: TaskId, path: &Path) -> String {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    match path.extension() {
        Some(ext) => format!("processed_{task_id}_{stamp}.{}", ext.to_string_lossy()),
        None => format!("processed_{task_id}_{stamp}"),
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn acquire(&self, input_ref: &str) -> Result<PathBuf, StoreError> {
        let path = self.inbox.join(checked_ref(input_ref)?);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            Ok(_) => Err(StoreError::NotFound(input_ref.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(input_ref.to_string()))
            }
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    async fn publish(&self, task_id: TaskId, path: &Path) -> Result<String, StoreError> {
        tokio::fs::create_dir_all(&self.media)
            .await
            .map_err(|e| StoreError::io(&self.media, e))?;
        let name = published_name(task_id, path);
        let target = self.media.join(&name);
        if let Err(e) = tokio::fs::rename(path, &target).await {
            // Work and media directories may sit on different filesystems.
            debug!(error = %e, "rename failed, copying result instead");
            tokio::fs::copy(path, &target)
                .await
                .map_err(|e| StoreError::io(path, e))?;
            tokio::fs::remove_file(path)
                .await
                .map_err(|e| StoreError::io(path, e))?;
        }
        info!(task_id = %task_id, file = %target.display(), "result published");
        Ok(name)
    }
}
