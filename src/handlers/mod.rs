use std::sync::Arc;
use std::time::Duration;

use crate::{
    auth::JwtService,
    config::Config,
    database::LedgerRef,
    errors::Result,
    services::{BlobStoreRef, FileLifecycle, MetricsService, OrphanSweeper, QuotaAccountant},
};

pub mod auth;
pub mod files;
pub mod health;
pub mod metrics;
pub mod user;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub ledger: LedgerRef,
    pub blobs: BlobStoreRef,
    pub quota: Arc<QuotaAccountant>,
    pub files: Arc<FileLifecycle>,
    pub metrics: Arc<MetricsService>,
    pub jwt: Arc<JwtService>,
}

impl AppState {
    pub fn new(config: Config, ledger: LedgerRef, blobs: BlobStoreRef) -> Result<Self> {
        let metrics = Arc::new(MetricsService::new()?);
        // One accountant per process: its lock table is what serializes a user's writes.
        let quota = Arc::new(QuotaAccountant::new(ledger.clone()));
        let files = Arc::new(FileLifecycle::new(
            ledger.clone(),
            blobs.clone(),
            quota.clone(),
            metrics.clone(),
        ));
        let jwt = Arc::new(JwtService::new(&config.jwt_secret));

        Ok(Self {
            config: Arc::new(config),
            ledger,
            blobs,
            quota,
            files,
            metrics,
            jwt,
        })
    }

    pub fn orphan_sweeper(&self) -> OrphanSweeper {
        OrphanSweeper::new(
            self.ledger.clone(),
            self.blobs.clone(),
            self.quota.clone(),
            self.metrics.clone(),
            Duration::from_secs(self.config.orphan_grace_secs),
        )
    }
}
