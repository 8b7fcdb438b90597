use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashSet;
use uuid::Uuid;

use crate::{
    config::QuotaPolicy,
    database::{Database, MetadataLedger},
    errors::{AppError, Result},
    models::{FileRecord, NewFile, User},
    storage::BlobLocation,
};

const USER_COLUMNS: &str = "id, username, password_hash, storage_quota, storage_used, created_at";
const FILE_COLUMNS: &str = "id, user_id, name, size, mime_type, blob_location, uploaded_at";

pub struct UserQueries;

impl UserQueries {
    pub async fn create_user(
        pool: &PgPool,
        username: &str,
        password_hash: &str,
        storage_quota: i64,
    ) -> Result<User> {
        let sql = format!(
            "INSERT INTO users (id, username, password_hash, storage_quota, storage_used)
             VALUES ($1, $2, $3, $4, 0)
             RETURNING {USER_COLUMNS}"
        );

        sqlx::query_as::<_, User>(&sql)
            .bind(Uuid::new_v4())
            .bind(username)
            .bind(password_hash)
            .bind(storage_quota)
            .fetch_one(pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                    AppError::Conflict("Username already exists".to_string())
                }
                other => AppError::Database(other),
            })
    }

    pub async fn find_by_username(pool: &PgPool, username: &str) -> Result<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE username = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(username)
            .fetch_optional(pool)
            .await?;

        Ok(user)
    }

    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(pool)
            .await?;

        Ok(user)
    }

    pub async fn list_ids(pool: &PgPool) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>("SELECT id FROM users ORDER BY created_at")
            .fetch_all(pool)
            .await?;

        Ok(ids)
    }

    pub async fn set_storage_used(pool: &PgPool, id: Uuid, storage_used: i64) -> Result<()> {
        let result = sqlx::query("UPDATE users SET storage_used = $1 WHERE id = $2")
            .bind(storage_used)
            .bind(id)
            .execute(pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }
}

pub struct FileQueries;

impl FileQueries {
    pub async fn create_file(pool: &PgPool, file: &NewFile) -> Result<FileRecord> {
        let sql = format!(
            "INSERT INTO files (id, user_id, name, size, mime_type, blob_location)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {FILE_COLUMNS}"
        );

        let record = sqlx::query_as::<_, FileRecord>(&sql)
            .bind(Uuid::new_v4())
            .bind(file.user_id)
            .bind(&file.name)
            .bind(file.size)
            .bind(&file.mime_type)
            .bind(&file.blob_location)
            .fetch_one(pool)
            .await?;

        Ok(record)
    }

    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<FileRecord>> {
        let sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE id = $1");
        let record = sqlx::query_as::<_, FileRecord>(&sql)
            .bind(id)
            .fetch_optional(pool)
            .await?;

        Ok(record)
    }

    pub async fn find_by_user(pool: &PgPool, user_id: Uuid) -> Result<Vec<FileRecord>> {
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE user_id = $1 ORDER BY uploaded_at DESC"
        );
        let records = sqlx::query_as::<_, FileRecord>(&sql)
            .bind(user_id)
            .fetch_all(pool)
            .await?;

        Ok(records)
    }

    pub async fn delete(pool: &PgPool, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM files WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn total_size_for_user(pool: &PgPool, user_id: Uuid) -> Result<i64> {
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(size), 0)::BIGINT FROM files WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(pool)
        .await?;

        Ok(total)
    }

    pub async fn all_blob_locations(pool: &PgPool) -> Result<Vec<String>> {
        let locations = sqlx::query_scalar::<_, String>("SELECT blob_location FROM files")
            .fetch_all(pool)
            .await?;

        Ok(locations)
    }
}

/// Postgres-backed ledger.
#[derive(Clone)]
pub struct PgLedger {
    database: Database,
    quota_policy: QuotaPolicy,
}

impl PgLedger {
    pub fn new(database: Database, quota_policy: QuotaPolicy) -> Self {
        Self {
            database,
            quota_policy,
        }
    }

    pub fn database(&self) -> &Database {
        &self.database
    }
}

#[async_trait]
impl MetadataLedger for PgLedger {
    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        UserQueries::find_by_id(self.database.pool(), id).await
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        UserQueries::find_by_username(self.database.pool(), username).await
    }

    async fn create_user(&self, username: &str, password_hash: &str) -> Result<User> {
        let quota = self.quota_policy.quota_for(username);
        UserQueries::create_user(self.database.pool(), username, password_hash, quota).await
    }

    async fn list_user_ids(&self) -> Result<Vec<Uuid>> {
        UserQueries::list_ids(self.database.pool()).await
    }

    async fn get_files_by_user(&self, user_id: Uuid) -> Result<Vec<FileRecord>> {
        FileQueries::find_by_user(self.database.pool(), user_id).await
    }

    async fn get_file(&self, id: Uuid) -> Result<Option<FileRecord>> {
        FileQueries::find_by_id(self.database.pool(), id).await
    }

    async fn create_file(&self, file: NewFile) -> Result<FileRecord> {
        FileQueries::create_file(self.database.pool(), &file).await
    }

    async fn delete_file(&self, id: Uuid) -> Result<bool> {
        FileQueries::delete(self.database.pool(), id).await
    }

    async fn set_user_storage_used(&self, user_id: Uuid, storage_used: i64) -> Result<()> {
        UserQueries::set_storage_used(self.database.pool(), user_id, storage_used).await
    }

    async fn sum_file_sizes(&self, user_id: Uuid) -> Result<i64> {
        FileQueries::total_size_for_user(self.database.pool(), user_id).await
    }

    async fn blob_locations(&self) -> Result<HashSet<BlobLocation>> {
        let locations = FileQueries::all_blob_locations(self.database.pool()).await?;
        Ok(locations.into_iter().map(BlobLocation::from).collect())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(self.database.pool()).await?;
        Ok(())
    }
}
