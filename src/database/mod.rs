use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    errors::Result,
    models::{FileRecord, NewFile, User},
    storage::BlobLocation,
};

pub mod memory;
pub mod queries;

pub use memory::MemoryLedger;
pub use queries::PgLedger;

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| crate::errors::AppError::Ledger(format!("Migration failed: {}", e)))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Durable store of user and file records.
///
/// Every method is a single-record operation. Keeping a file record and its
/// owner's `storage_used` in step is the caller's job, see
/// [`crate::services::FileLifecycle`].
#[async_trait]
pub trait MetadataLedger: Send + Sync {
    async fn get_user(&self, id: Uuid) -> Result<Option<User>>;

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>>;

    /// Creates a user with `storage_used = 0` and the quota assigned by the
    /// ledger's policy. Fails with `Conflict` when the username is taken.
    async fn create_user(&self, username: &str, password_hash: &str) -> Result<User>;

    async fn list_user_ids(&self) -> Result<Vec<Uuid>>;

    /// Newest first.
    async fn get_files_by_user(&self, user_id: Uuid) -> Result<Vec<FileRecord>>;

    async fn get_file(&self, id: Uuid) -> Result<Option<FileRecord>>;

    async fn create_file(&self, file: NewFile) -> Result<FileRecord>;

    /// Returns `false` when no record with `id` existed.
    async fn delete_file(&self, id: Uuid) -> Result<bool>;

    async fn set_user_storage_used(&self, user_id: Uuid, storage_used: i64) -> Result<()>;

    async fn sum_file_sizes(&self, user_id: Uuid) -> Result<i64>;

    async fn blob_locations(&self) -> Result<HashSet<BlobLocation>>;

    async fn ping(&self) -> Result<()>;
}

pub type LedgerRef = Arc<dyn MetadataLedger>;
