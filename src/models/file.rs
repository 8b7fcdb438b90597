use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::storage::BlobLocation;

/// Ledger row for one stored file. `blob_location` stays server-side.
#[derive(Debug, Clone, FromRow)]
pub struct FileRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub size: i64,
    pub mime_type: String,
    pub blob_location: BlobLocation,
    pub uploaded_at: DateTime<Utc>,
}

/// Insert payload; the ledger assigns `id` and `uploaded_at`.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub user_id: Uuid,
    pub name: String,
    pub size: i64,
    pub mime_type: String,
    pub blob_location: BlobLocation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileResponse {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub size: i64,
    pub mime_type: String,
    pub uploaded_at: DateTime<Utc>,
}

impl From<FileRecord> for FileResponse {
    fn from(file: FileRecord) -> Self {
        Self {
            id: file.id,
            user_id: file.user_id,
            name: file.name,
            size: file.size,
            mime_type: file.mime_type,
            uploaded_at: file.uploaded_at,
        }
    }
}

/// An upload as received from the client; size is taken from `bytes`.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}
