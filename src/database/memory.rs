use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    config::QuotaPolicy,
    database::MetadataLedger,
    errors::{AppError, Result},
    models::{FileRecord, NewFile, User},
    storage::BlobLocation,
};

#[derive(Default)]
struct LedgerState {
    users: HashMap<Uuid, User>,
    usernames: HashMap<String, Uuid>,
    files: HashMap<Uuid, FileRecord>,
}

/// Process-local ledger for development and tests. Contents are lost on exit.
pub struct MemoryLedger {
    quota_policy: QuotaPolicy,
    state: RwLock<LedgerState>,
}

impl MemoryLedger {
    pub fn new(quota_policy: QuotaPolicy) -> Self {
        Self {
            quota_policy,
            state: RwLock::new(LedgerState::default()),
        }
    }
}

#[async_trait]
impl MetadataLedger for MemoryLedger {
    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.state.read().await.users.get(&id).cloned())
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let state = self.state.read().await;
        Ok(state
            .usernames
            .get(username)
            .and_then(|id| state.users.get(id))
            .cloned())
    }

    async fn create_user(&self, username: &str, password_hash: &str) -> Result<User> {
        let mut state = self.state.write().await;
        if state.usernames.contains_key(username) {
            return Err(AppError::Conflict("Username already exists".to_string()));
        }

        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            storage_quota: self.quota_policy.quota_for(username),
            storage_used: 0,
            created_at: Utc::now(),
        };
        state.usernames.insert(user.username.clone(), user.id);
        state.users.insert(user.id, user.clone());

        Ok(user)
    }

    async fn list_user_ids(&self) -> Result<Vec<Uuid>> {
        let state = self.state.read().await;
        let mut users: Vec<&User> = state.users.values().collect();
        users.sort_by_key(|user| user.created_at);
        Ok(users.into_iter().map(|user| user.id).collect())
    }

    async fn get_files_by_user(&self, user_id: Uuid) -> Result<Vec<FileRecord>> {
        let state = self.state.read().await;
        let mut files: Vec<FileRecord> = state
            .files
            .values()
            .filter(|file| file.user_id == user_id)
            .cloned()
            .collect();
        files.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(files)
    }

    async fn get_file(&self, id: Uuid) -> Result<Option<FileRecord>> {
        Ok(self.state.read().await.files.get(&id).cloned())
    }

    async fn create_file(&self, file: NewFile) -> Result<FileRecord> {
        let mut state = self.state.write().await;
        if !state.users.contains_key(&file.user_id) {
            return Err(AppError::Ledger(format!("Unknown file owner {}", file.user_id)));
        }
        if state.files.values().any(|f| f.blob_location == file.blob_location) {
            return Err(AppError::Ledger(format!(
                "Blob location {} is already referenced",
                file.blob_location
            )));
        }

        let record = FileRecord {
            id: Uuid::new_v4(),
            user_id: file.user_id,
            name: file.name,
            size: file.size,
            mime_type: file.mime_type,
            blob_location: file.blob_location,
            uploaded_at: Utc::now(),
        };
        state.files.insert(record.id, record.clone());

        Ok(record)
    }

    async fn delete_file(&self, id: Uuid) -> Result<bool> {
        Ok(self.state.write().await.files.remove(&id).is_some())
    }

    async fn set_user_storage_used(&self, user_id: Uuid, storage_used: i64) -> Result<()> {
        if storage_used < 0 {
            return Err(AppError::Ledger(format!(
                "storage_used must not be negative (got {})",
                storage_used
            )));
        }

        let mut state = self.state.write().await;
        let user = state.users.get_mut(&user_id).ok_or(AppError::NotFound)?;
        if storage_used > user.storage_quota {
            return Err(AppError::Ledger(format!(
                "storage_used {} exceeds quota {}",
                storage_used, user.storage_quota
            )));
        }
        user.storage_used = storage_used;
        Ok(())
    }

    async fn sum_file_sizes(&self, user_id: Uuid) -> Result<i64> {
        let state = self.state.read().await;
        Ok(state
            .files
            .values()
            .filter(|file| file.user_id == user_id)
            .map(|file| file.size)
            .sum())
    }

    async fn blob_locations(&self) -> Result<HashSet<BlobLocation>> {
        let state = self.state.read().await;
        Ok(state
            .files
            .values()
            .map(|file| file.blob_location.clone())
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
