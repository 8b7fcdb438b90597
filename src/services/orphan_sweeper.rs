use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;

use crate::{
    database::LedgerRef,
    errors::Result,
    services::{file_lifecycle::BlobStoreRef, metrics::MetricsService, quota_manager::QuotaAccountant},
};

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub scanned: usize,
    pub orphaned: usize,
    pub removed: usize,
    pub failed: usize,
    pub skipped_recent: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub users: usize,
    pub corrected: usize,
    pub failed: usize,
}

/// Background repair for the two inconsistencies a crash can leave behind:
/// blobs with no file record, and `storage_used` values that drifted from the
/// sum of the owner's file sizes.
pub struct OrphanSweeper {
    ledger: LedgerRef,
    blobs: BlobStoreRef,
    quota: Arc<QuotaAccountant>,
    metrics: Arc<MetricsService>,
    grace: Duration,
}

impl OrphanSweeper {
    pub fn new(
        ledger: LedgerRef,
        blobs: BlobStoreRef,
        quota: Arc<QuotaAccountant>,
        metrics: Arc<MetricsService>,
        grace: Duration,
    ) -> Self {
        Self {
            ledger,
            blobs,
            quota,
            metrics,
            grace,
        }
    }

    /// Removes unreferenced blobs older than the grace period.
    ///
    /// Blobs are listed before the ledger is read, so an upload that commits in
    /// between is seen as referenced. Uploads still in flight are younger than
    /// the grace period and are skipped.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let entries = self.blobs.list().await?;
        let referenced = self.ledger.blob_locations().await?;
        let now = SystemTime::now();

        let mut report = SweepReport {
            scanned: entries.len(),
            ..SweepReport::default()
        };

        for entry in entries {
            if referenced.contains(&entry.location) {
                continue;
            }
            report.orphaned += 1;

            let age = now.duration_since(entry.modified).unwrap_or_default();
            if age < self.grace {
                report.skipped_recent += 1;
                continue;
            }

            match self.blobs.remove(&entry.location).await {
                Ok(()) => {
                    report.removed += 1;
                    tracing::info!(blob = %entry.location, age_secs = age.as_secs(), "Removed orphaned blob");
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(blob = %entry.location, error = %err, "Failed to remove orphaned blob");
                }
            }
        }

        self.metrics.record_swept_blobs(report.removed as u64);
        Ok(report)
    }

    pub async fn reconcile_usage(&self) -> Result<ReconcileReport> {
        let user_ids = self.ledger.list_user_ids().await?;
        let mut report = ReconcileReport {
            users: user_ids.len(),
            ..ReconcileReport::default()
        };

        for user_id in user_ids {
            match self.quota.reconcile(user_id).await {
                Ok(0) => {}
                Ok(_) => report.corrected += 1,
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(user_id = %user_id, error = %err, "Usage reconciliation failed");
                }
            }
        }

        Ok(report)
    }

    pub async fn run_once(&self) -> Result<(SweepReport, ReconcileReport)> {
        let sweep = self.sweep().await?;
        let reconcile = self.reconcile_usage().await?;

        tracing::info!(
            scanned = sweep.scanned,
            orphaned = sweep.orphaned,
            removed = sweep.removed,
            failed = sweep.failed,
            users = reconcile.users,
            corrected = reconcile.corrected,
            "Orphan sweep finished"
        );

        Ok((sweep, reconcile))
    }

    pub fn spawn(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(err) = self.run_once().await {
                    tracing::warn!(error = %err, "Orphan sweep failed");
                }
            }
        })
    }
}
