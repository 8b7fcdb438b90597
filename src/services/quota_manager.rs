use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::{
    database::LedgerRef,
    errors::{AppError, Result},
    models::User,
};

type LockTable = DashMap<Uuid, Arc<Mutex<()>>>;

/// Exclusive right to read-check-write one user's `storage_used`.
///
/// Held across an admission decision and the writes that follow it, so two
/// requests for the same user can never interleave between "read usage" and
/// "write usage". Requests for different users never contend.
pub struct UsageLease {
    user_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockTable>,
}

impl UsageLease {
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }
}

impl Drop for UsageLease {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Evict the entry once nobody else holds or waits on it.
        self.locks
            .remove_if(&self.user_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Sole writer of `User::storage_used`.
///
/// The per-user locks only serialize requests within this process, so run a
/// single instance per database. The ledger refuses any `storage_used` above
/// the quota as a backstop, but it cannot stop two processes from losing each
/// other's read-modify-write.
pub struct QuotaAccountant {
    ledger: LedgerRef,
    locks: Arc<LockTable>,
}

impl QuotaAccountant {
    pub fn new(ledger: LedgerRef) -> Self {
        Self {
            ledger,
            locks: Arc::new(DashMap::new()),
        }
    }

    /// `storage_used + incoming_size <= storage_quota`. Equal to the quota is admitted.
    pub fn can_admit(user: &User, incoming_size: i64) -> bool {
        incoming_size >= 0
            && user
                .storage_used
                .checked_add(incoming_size)
                .map_or(false, |total| total <= user.storage_quota)
    }

    pub async fn lease(&self, user_id: Uuid) -> UsageLease {
        let lock = self
            .locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        UsageLease {
            user_id,
            guard: Some(lock.lock_owned().await),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Re-reads the user and checks `incoming_size` against the current usage.
    pub async fn admit(&self, lease: &UsageLease, incoming_size: i64) -> Result<User> {
        let user = self
            .ledger
            .get_user(lease.user_id)
            .await?
            .ok_or(AppError::NotFound)?;

        if !Self::can_admit(&user, incoming_size) {
            tracing::info!(
                user_id = %user.id,
                requested = incoming_size,
                storage_used = user.storage_used,
                storage_quota = user.storage_quota,
                "Upload rejected by quota"
            );
            return Err(AppError::QuotaExceeded {
                requested: incoming_size,
                remaining: user.remaining_bytes(),
            });
        }

        Ok(user)
    }

    /// Writes `storage_used + delta` back through the ledger and returns the new value.
    pub async fn apply_delta(&self, lease: &UsageLease, delta: i64) -> Result<i64> {
        let user = self
            .ledger
            .get_user(lease.user_id)
            .await?
            .ok_or(AppError::NotFound)?;

        let mut storage_used = user.storage_used.checked_add(delta).ok_or_else(|| {
            AppError::Ledger(format!("storage_used overflow for user {}", user.id))
        })?;
        if storage_used < 0 {
            tracing::error!(
                user_id = %user.id,
                storage_used = user.storage_used,
                delta,
                "Usage would go negative; clamping to zero, reconcile required"
            );
            storage_used = 0;
        }

        self.ledger
            .set_user_storage_used(user.id, storage_used)
            .await?;
        tracing::debug!(user_id = %user.id, delta, storage_used, "Storage usage updated");

        Ok(storage_used)
    }

    /// Rewrites `storage_used` to the sum of the user's file sizes.
    /// Returns the drift that was corrected (recorded minus actual).
    pub async fn reconcile(&self, user_id: Uuid) -> Result<i64> {
        let lease = self.lease(user_id).await;

        let user = self
            .ledger
            .get_user(lease.user_id)
            .await?
            .ok_or(AppError::NotFound)?;
        let actual = self.ledger.sum_file_sizes(user_id).await?;
        let drift = user.storage_used - actual;

        if drift != 0 {
            tracing::warn!(
                user_id = %user_id,
                recorded = user.storage_used,
                actual,
                "Storage usage drifted; rewriting"
            );
            self.ledger.set_user_storage_used(user_id, actual).await?;
        }

        Ok(drift)
    }

    #[cfg(test)]
    fn tracked_users(&self) -> usize {
        self.locks.len()
    }
}
