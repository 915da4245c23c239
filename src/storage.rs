//! Volume store
//!
//! Guest working directories live on distributed volumes. The agent only
//! needs two operations from them: check a path exists and remove it
//! recursively. Volumes are expected to be FUSE-mounted on the node under a
//! common base directory (`<mount_base>/<volume>`).

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::error::StorageError;

#[async_trait]
pub trait VolumeStore: Send + Sync {
    async fn exists(&self, volume: &str, path: &str) -> Result<bool, StorageError>;

    /// Recursively remove `path` and everything below it
    async fn remove_all(&self, volume: &str, path: &str) -> Result<(), StorageError>;
}

/// Volume store backed by locally mounted volumes
#[derive(Debug, Clone)]
pub struct MountedVolumeStore {
    mount_base: PathBuf,
}

impl MountedVolumeStore {
    pub fn new(mount_base: impl Into<PathBuf>) -> Self {
        Self {
            mount_base: mount_base.into(),
        }
    }

    /// Resolve a volume-relative path to its location on the node
    ///
    /// Only plain relative components are accepted so a path can never
    /// escape its volume.
    pub fn resolve(&self, volume: &str, path: &str) -> Result<PathBuf, StorageError> {
        check_relative(volume)?;
        check_relative(path)?;
        Ok(self.mount_base.join(volume).join(path))
    }
}

fn check_relative(part: &str) -> Result<(), StorageError> {
    let p = Path::new(part);
    let plain = !part.is_empty() && p.components().all(|c| matches!(c, Component::Normal(_)));
    if plain {
        Ok(())
    } else {
        Err(StorageError::InvalidPath(part.to_string()))
    }
}

#[async_trait]
impl VolumeStore for MountedVolumeStore {
    async fn exists(&self, volume: &str, path: &str) -> Result<bool, StorageError> {
        let full = self.resolve(volume, path)?;
        Ok(tokio::fs::try_exists(&full).await?)
    }

    async fn remove_all(&self, volume: &str, path: &str) -> Result<(), StorageError> {
        let full = self.resolve(volume, path)?;
        if tokio::fs::metadata(&full).await?.is_dir() {
            tokio::fs::remove_dir_all(&full).await?;
        } else {
            tokio::fs::remove_file(&full).await?;
        }
        Ok(())
    }
}
