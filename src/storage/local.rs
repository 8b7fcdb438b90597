use async_trait::async_trait;
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::{fs, io::AsyncWriteExt};
use uuid::Uuid;

use crate::{
    errors::{AppError, Result},
    storage::{BlobEntry, BlobLocation, BlobReader, BlobStore},
    utils::file::sanitize_file_name,
};

pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();

        std::fs::create_dir_all(&base_path)
            .map_err(|e| AppError::Storage(format!("Failed to create storage directory: {}", e)))?;

        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    // Only plain relative components are accepted so a location can never
    // point outside the store root.
    fn get_full_path(&self, location: &BlobLocation) -> Result<PathBuf> {
        let relative = Path::new(location.as_str());
        let is_plain = !location.as_str().is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));

        if !is_plain {
            return Err(AppError::Storage(format!("Invalid blob location: {}", location)));
        }

        Ok(self.base_path.join(relative))
    }

    async fn write_new(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for LocalStorage {
    async fn put(&self, owner_id: Uuid, name: &str, bytes: &[u8]) -> Result<BlobLocation> {
        let file_name = format!(
            "{}-{}-{}",
            Utc::now().timestamp_millis(),
            Uuid::new_v4().simple(),
            sanitize_file_name(name)
        );
        let location = BlobLocation::new(format!("{}/{}", owner_id, file_name));
        let full_path = self.get_full_path(&location)?;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await
                .map_err(|e| AppError::Storage(format!("Failed to create directory: {}", e)))?;
        }

        if let Err(e) = Self::write_new(&full_path, bytes).await {
            // A partial write must not survive as an orphan.
            if e.kind() != ErrorKind::AlreadyExists {
                let _ = fs::remove_file(&full_path).await;
            }
            return Err(AppError::Storage(format!("Failed to write blob {}: {}", location, e)));
        }

        tracing::debug!(blob = %location, size = bytes.len(), "Blob written");
        Ok(location)
    }

    async fn get(&self, location: &BlobLocation) -> Result<BlobReader> {
        let full_path = self.get_full_path(location)?;

        match fs::File::open(&full_path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(AppError::NotFound),
            Err(e) => Err(AppError::Storage(format!("Failed to open blob {}: {}", location, e))),
        }
    }

    async fn remove(&self, location: &BlobLocation) -> Result<()> {
        let full_path = self.get_full_path(location)?;

        match fs::remove_file(&full_path).await {
            Ok(()) => {
                tracing::debug!(blob = %location, "Blob removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Storage(format!("Failed to remove blob {}: {}", location, e))),
        }
    }

    async fn list(&self) -> Result<Vec<BlobEntry>> {
        let io_err = |e: std::io::Error| AppError::Storage(format!("Failed to list blobs: {}", e));
        let mut entries = Vec::new();

        let mut owners = match fs::read_dir(&self.base_path).await {
            Ok(owners) => owners,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(io_err(e)),
        };

        while let Some(owner) = owners.next_entry().await.map_err(io_err)? {
            if !owner.file_type().await.map_err(io_err)?.is_dir() {
                continue;
            }
            let Some(owner_name) = owner.file_name().to_str().map(str::to_string) else {
                continue;
            };

            let mut blobs = fs::read_dir(owner.path()).await.map_err(io_err)?;
            while let Some(blob) = blobs.next_entry().await.map_err(io_err)? {
                let metadata = blob.metadata().await.map_err(io_err)?;
                if !metadata.is_file() {
                    continue;
                }
                let Some(blob_name) = blob.file_name().to_str().map(str::to_string) else {
                    tracing::warn!(path = ?blob.path(), "Skipping blob with non UTF-8 name");
                    continue;
                };
                entries.push(BlobEntry {
                    location: BlobLocation::new(format!("{}/{}", owner_name, blob_name)),
                    modified: metadata.modified().map_err(io_err)?,
                });
            }
        }

        Ok(entries)
    }
}
