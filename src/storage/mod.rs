use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::errors::Result;

pub mod local;

pub use local::LocalStorage;

pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Opaque address of a blob inside the store. Never sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct BlobLocation(String);

impl BlobLocation {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for BlobLocation {
    fn from(location: String) -> Self {
        Self(location)
    }
}

impl From<&str> for BlobLocation {
    fn from(location: &str) -> Self {
        Self(location.to_string())
    }
}

impl fmt::Display for BlobLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct BlobEntry {
    pub location: BlobLocation,
    pub modified: SystemTime,
}

/// Raw byte storage, scoped per owner. Knows nothing about file metadata.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Persists `bytes` under a fresh location in `owner_id`'s namespace.
    /// `name` only contributes to the location; it never collides.
    async fn put(&self, owner_id: Uuid, name: &str, bytes: &[u8]) -> Result<BlobLocation>;

    /// Fails with `NotFound` when nothing is stored at `location`.
    async fn get(&self, location: &BlobLocation) -> Result<BlobReader>;

    /// Idempotent: removing an absent location succeeds.
    async fn remove(&self, location: &BlobLocation) -> Result<()>;

    async fn list(&self) -> Result<Vec<BlobEntry>>;
}
