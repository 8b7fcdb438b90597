use std::sync::Arc;
use uuid::Uuid;

use crate::{
    database::LedgerRef,
    errors::{AppError, Result},
    models::{FileRecord, FileResponse, NewFile, UploadRequest},
    services::{
        metrics::MetricsService,
        quota_manager::{QuotaAccountant, UsageLease},
    },
    storage::{BlobLocation, BlobReader, BlobStore},
};

pub type BlobStoreRef = Arc<dyn BlobStore>;

/// How far a failed upload commit got.
enum CommitFailure {
    /// Nothing references the blob; it can be discarded.
    Aborted(AppError),
    /// The file record could not be rolled back and still points at the blob.
    RecordLeft { file_id: Uuid, error: AppError },
}

pub struct FileDownload {
    pub file: FileResponse,
    pub reader: BlobReader,
}

/// Orchestrates the blob store, the quota accountant and the ledger.
///
/// Upload: write blob, admit, create record, add usage. A failure after the
/// blob is written removes it again, unless a record that could not be rolled
/// back still points at it.
///
/// Delete: remove record, remove blob, subtract usage. The record goes first:
/// a crash in between leaves an orphaned blob for the sweeper, never a record
/// that points at missing bytes.
pub struct FileLifecycle {
    ledger: LedgerRef,
    blobs: BlobStoreRef,
    quota: Arc<QuotaAccountant>,
    metrics: Arc<MetricsService>,
}

impl FileLifecycle {
    pub fn new(
        ledger: LedgerRef,
        blobs: BlobStoreRef,
        quota: Arc<QuotaAccountant>,
        metrics: Arc<MetricsService>,
    ) -> Self {
        Self {
            ledger,
            blobs,
            quota,
            metrics,
        }
    }

    pub async fn list(&self, user_id: Uuid) -> Result<Vec<FileResponse>> {
        let files = self.ledger.get_files_by_user(user_id).await?;
        Ok(files.into_iter().map(FileResponse::from).collect())
    }

    pub async fn upload(&self, user_id: Uuid, upload: UploadRequest) -> Result<FileResponse> {
        let size = i64::try_from(upload.bytes.len())
            .map_err(|_| AppError::Validation("File too large".to_string()))?;

        // Bytes land before the quota decision; the lease is only taken once
        // the (possibly slow) write is done.
        let location = self.blobs.put(user_id, &upload.name, &upload.bytes).await?;
        let lease = self.quota.lease(user_id).await;

        match self.commit_upload(&lease, &upload, size, &location).await {
            Ok(record) => {
                drop(lease);
                self.metrics.record_upload(size as u64);
                tracing::info!(
                    user_id = %user_id,
                    file_id = %record.id,
                    size,
                    "File uploaded"
                );
                Ok(record.into())
            }
            Err(CommitFailure::Aborted(err)) => {
                drop(lease);
                if matches!(err, AppError::QuotaExceeded { .. }) {
                    self.metrics.record_quota_rejection();
                }
                self.discard_blob(&location, "upload aborted").await;
                Err(err)
            }
            Err(CommitFailure::RecordLeft { file_id, error }) => {
                drop(lease);
                // The record still points at these bytes; removing them would
                // leave it dangling. Reconciliation picks up the usage.
                tracing::error!(
                    user_id = %user_id,
                    file_id = %file_id,
                    blob = %location,
                    "Upload left a committed record without usage; blob kept, reconcile required"
                );
                Err(error)
            }
        }
    }

    async fn commit_upload(
        &self,
        lease: &UsageLease,
        upload: &UploadRequest,
        size: i64,
        location: &BlobLocation,
    ) -> std::result::Result<FileRecord, CommitFailure> {
        self.quota
            .admit(lease, size)
            .await
            .map_err(CommitFailure::Aborted)?;

        let record = self
            .ledger
            .create_file(NewFile {
                user_id: lease.user_id(),
                name: upload.name.clone(),
                size,
                mime_type: upload.mime_type.clone(),
                blob_location: location.clone(),
            })
            .await
            .map_err(CommitFailure::Aborted)?;

        if let Err(err) = self.quota.apply_delta(lease, size).await {
            // Usage was not raised, so the record must not survive either.
            return match self.ledger.delete_file(record.id).await {
                Ok(_) => {
                    tracing::warn!(
                        file_id = %record.id,
                        "Rolled back file record after usage update failed"
                    );
                    Err(CommitFailure::Aborted(err))
                }
                Err(rollback_err) => {
                    tracing::error!(
                        file_id = %record.id,
                        user_id = %record.user_id,
                        error = %rollback_err,
                        "Failed to roll back file record"
                    );
                    Err(CommitFailure::RecordLeft {
                        file_id: record.id,
                        error: err,
                    })
                }
            };
        }

        Ok(record)
    }

    pub async fn delete(&self, user_id: Uuid, file_id: Uuid) -> Result<()> {
        let file = self.authorize(user_id, file_id).await?;
        let lease = self.quota.lease(user_id).await;

        // A concurrent delete of the same file may have won the race; only the
        // request that actually removed the record adjusts usage.
        if !self.ledger.delete_file(file.id).await? {
            return Err(AppError::NotFound);
        }

        let removed = self.blobs.remove(&file.blob_location).await;

        if let Err(err) = self.quota.apply_delta(&lease, -file.size).await {
            tracing::error!(
                user_id = %user_id,
                file_id = %file.id,
                size = file.size,
                error = %err,
                "File record removed but usage not lowered; reconcile required"
            );
            if removed.is_err() {
                self.record_orphan(&file.blob_location, "delete");
            }
            return Err(err);
        }
        drop(lease);

        if let Err(err) = removed {
            self.record_orphan(&file.blob_location, "delete");
            return Err(err);
        }

        self.metrics.record_delete();
        tracing::info!(user_id = %user_id, file_id = %file.id, size = file.size, "File deleted");
        Ok(())
    }

    pub async fn download(&self, user_id: Uuid, file_id: Uuid) -> Result<FileDownload> {
        let file = self.authorize(user_id, file_id).await?;

        let reader = match self.blobs.get(&file.blob_location).await {
            Ok(reader) => reader,
            Err(AppError::NotFound) => {
                tracing::error!(
                    file_id = %file.id,
                    blob = %file.blob_location,
                    "File record points at a missing blob"
                );
                return Err(AppError::Storage(format!(
                    "Blob for file {} is missing",
                    file.id
                )));
            }
            Err(err) => return Err(err),
        };

        self.metrics.record_download();
        Ok(FileDownload {
            file: file.into(),
            reader,
        })
    }

    async fn authorize(&self, user_id: Uuid, file_id: Uuid) -> Result<FileRecord> {
        let file = self
            .ledger
            .get_file(file_id)
            .await?
            .ok_or(AppError::NotFound)?;

        if file.user_id != user_id {
            tracing::warn!(
                user_id = %user_id,
                file_id = %file_id,
                owner_id = %file.user_id,
                "Access to a file owned by another user refused"
            );
            return Err(AppError::Forbidden);
        }

        Ok(file)
    }

    async fn discard_blob(&self, location: &BlobLocation, reason: &str) {
        if let Err(err) = self.blobs.remove(location).await {
            tracing::error!(error = %err, reason, "Compensating blob removal failed");
            self.record_orphan(location, reason);
        }
    }

    fn record_orphan(&self, location: &BlobLocation, reason: &str) {
        self.metrics.record_orphaned_blob();
        tracing::error!(blob = %location, reason, "Orphaned blob left for the sweeper");
    }
}
