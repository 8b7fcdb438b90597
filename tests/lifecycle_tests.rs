use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use cloud_drive_server::{
    config::QuotaPolicy,
    database::{LedgerRef, MemoryLedger, MetadataLedger},
    errors::{AppError, Result},
    models::{FileRecord, NewFile, UploadRequest, User},
    services::{FileLifecycle, MetricsService, OrphanSweeper, QuotaAccountant},
    storage::{BlobLocation, BlobStore, LocalStorage},
};

/// Wraps a ledger and fails selected writes on demand.
struct FlakyLedger {
    inner: MemoryLedger,
    fail_create_file: AtomicBool,
    fail_set_storage_used: AtomicBool,
    fail_delete_file: AtomicBool,
}

impl FlakyLedger {
    fn new(policy: QuotaPolicy) -> Self {
        Self {
            inner: MemoryLedger::new(policy),
            fail_create_file: AtomicBool::new(false),
            fail_set_storage_used: AtomicBool::new(false),
            fail_delete_file: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MetadataLedger for FlakyLedger {
    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        self.inner.get_user(id).await
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.inner.get_user_by_username(username).await
    }

    async fn create_user(&self, username: &str, password_hash: &str) -> Result<User> {
        self.inner.create_user(username, password_hash).await
    }

    async fn list_user_ids(&self) -> Result<Vec<Uuid>> {
        self.inner.list_user_ids().await
    }

    async fn get_files_by_user(&self, user_id: Uuid) -> Result<Vec<FileRecord>> {
        self.inner.get_files_by_user(user_id).await
    }

    async fn get_file(&self, id: Uuid) -> Result<Option<FileRecord>> {
        self.inner.get_file(id).await
    }

    async fn create_file(&self, file: NewFile) -> Result<FileRecord> {
        if self.fail_create_file.load(Ordering::SeqCst) {
            return Err(AppError::Ledger("connection reset".to_string()));
        }
        self.inner.create_file(file).await
    }

    async fn delete_file(&self, id: Uuid) -> Result<bool> {
        if self.fail_delete_file.load(Ordering::SeqCst) {
            return Err(AppError::Ledger("connection reset".to_string()));
        }
        self.inner.delete_file(id).await
    }

    async fn set_user_storage_used(&self, user_id: Uuid, storage_used: i64) -> Result<()> {
        if self.fail_set_storage_used.load(Ordering::SeqCst) {
            return Err(AppError::Ledger("connection reset".to_string()));
        }
        self.inner.set_user_storage_used(user_id, storage_used).await
    }

    async fn sum_file_sizes(&self, user_id: Uuid) -> Result<i64> {
        self.inner.sum_file_sizes(user_id).await
    }

    async fn blob_locations(&self) -> Result<HashSet<BlobLocation>> {
        self.inner.blob_locations().await
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }
}

struct Harness {
    _dir: TempDir,
    ledger: LedgerRef,
    blobs: Arc<LocalStorage>,
    quota: Arc<QuotaAccountant>,
    metrics: Arc<MetricsService>,
    lifecycle: Arc<FileLifecycle>,
}

impl Harness {
    fn with_ledger(ledger: LedgerRef) -> Self {
        let dir = tempdir().unwrap();
        let blobs = Arc::new(LocalStorage::new(dir.path()).unwrap());
        let metrics = Arc::new(MetricsService::new().unwrap());
        let quota = Arc::new(QuotaAccountant::new(ledger.clone()));
        let lifecycle = Arc::new(FileLifecycle::new(
            ledger.clone(),
            blobs.clone(),
            quota.clone(),
            metrics.clone(),
        ));

        Self {
            _dir: dir,
            ledger,
            blobs,
            quota,
            metrics,
            lifecycle,
        }
    }

    fn new(quota: i64) -> Self {
        Self::with_ledger(Arc::new(MemoryLedger::new(QuotaPolicy::new(quota))))
    }

    fn sweeper(&self, grace: Duration) -> OrphanSweeper {
        OrphanSweeper::new(
            self.ledger.clone(),
            self.blobs.clone(),
            self.quota.clone(),
            self.metrics.clone(),
            grace,
        )
    }

    async fn user(&self, username: &str) -> User {
        self.ledger.create_user(username, "hash").await.unwrap()
    }

    async fn storage_used(&self, user_id: Uuid) -> i64 {
        self.ledger.get_user(user_id).await.unwrap().unwrap().storage_used
    }

    async fn blob_count(&self) -> usize {
        self.blobs.list().await.unwrap().len()
    }

    /// `storage_used` matches the owner's files, and records and blobs pair up.
    async fn assert_consistent(&self) {
        for user_id in self.ledger.list_user_ids().await.unwrap() {
            let files = self.ledger.get_files_by_user(user_id).await.unwrap();
            let total: i64 = files.iter().map(|f| f.size).sum();
            assert_eq!(self.storage_used(user_id).await, total, "usage drift for {}", user_id);
        }

        let referenced = self.ledger.blob_locations().await.unwrap();
        let stored: HashSet<BlobLocation> = self
            .blobs
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.location)
            .collect();
        assert_eq!(referenced, stored, "records and blobs disagree");
    }
}

fn upload(name: &str, size: usize) -> UploadRequest {
    UploadRequest {
        name: name.to_string(),
        mime_type: "application/octet-stream".to_string(),
        bytes: vec![0xAB; size],
    }
}

#[tokio::test]
async fn test_end_to_end_quota_scenario() {
    let h = Harness::new(1000);
    let user = h.user("alice").await;

    let first = h.lifecycle.upload(user.id, upload("a.bin", 600)).await.unwrap();
    assert_eq!(first.size, 600);
    assert_eq!(h.storage_used(user.id).await, 600);

    let err = h.lifecycle.upload(user.id, upload("b.bin", 500)).await.unwrap_err();
    match err {
        AppError::QuotaExceeded { requested, remaining } => {
            assert_eq!(requested, 500);
            assert_eq!(remaining, 400);
        }
        other => panic!("expected QuotaExceeded, got {:?}", other),
    }
    assert_eq!(h.storage_used(user.id).await, 600);
    assert_eq!(h.lifecycle.list(user.id).await.unwrap().len(), 1);
    assert_eq!(h.blob_count().await, 1);
    h.assert_consistent().await;

    h.lifecycle.delete(user.id, first.id).await.unwrap();
    assert_eq!(h.storage_used(user.id).await, 0);
    assert!(h.lifecycle.list(user.id).await.unwrap().is_empty());
    assert_eq!(h.blob_count().await, 0);
    h.assert_consistent().await;
}

#[tokio::test]
async fn test_quota_admission_boundary() {
    let h = Harness::new(1000);
    let exact = h.user("exact").await;
    let over = h.user("over").await;

    h.lifecycle.upload(exact.id, upload("a", 400)).await.unwrap();
    h.lifecycle.upload(exact.id, upload("b", 600)).await.unwrap();
    assert_eq!(h.storage_used(exact.id).await, 1000);

    // A full account still accepts an empty file.
    h.lifecycle.upload(exact.id, upload("empty", 0)).await.unwrap();
    assert_eq!(h.storage_used(exact.id).await, 1000);

    h.lifecycle.upload(over.id, upload("a", 400)).await.unwrap();
    let blobs_before = h.blob_count().await;
    let err = h.lifecycle.upload(over.id, upload("b", 601)).await.unwrap_err();
    assert!(matches!(err, AppError::QuotaExceeded { requested: 601, remaining: 600 }));
    assert_eq!(h.storage_used(over.id).await, 400);
    assert_eq!(h.blob_count().await, blobs_before);

    h.assert_consistent().await;
}

#[tokio::test]
async fn test_ownership_isolation() {
    let h = Harness::new(1000);
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;

    let file = h.lifecycle.upload(alice.id, upload("secret.txt", 10)).await.unwrap();

    assert!(matches!(
        h.lifecycle.download(bob.id, file.id).await,
        Err(AppError::Forbidden)
    ));
    assert!(matches!(
        h.lifecycle.delete(bob.id, file.id).await,
        Err(AppError::Forbidden)
    ));
    assert!(h.lifecycle.list(bob.id).await.unwrap().is_empty());

    // Nothing changed for the owner.
    assert_eq!(h.storage_used(alice.id).await, 10);
    assert!(h.lifecycle.download(alice.id, file.id).await.is_ok());
    h.assert_consistent().await;
}

#[tokio::test]
async fn test_unknown_file_is_not_found() {
    let h = Harness::new(1000);
    let alice = h.user("alice").await;

    assert!(matches!(
        h.lifecycle.download(alice.id, Uuid::new_v4()).await,
        Err(AppError::NotFound)
    ));
    assert!(matches!(
        h.lifecycle.delete(alice.id, Uuid::new_v4()).await,
        Err(AppError::NotFound)
    ));
}

#[tokio::test]
async fn test_download_returns_stored_bytes() {
    let h = Harness::new(1000);
    let alice = h.user("alice").await;

    let request = UploadRequest {
        name: "notes.txt".to_string(),
        mime_type: "text/plain".to_string(),
        bytes: b"hello drive".to_vec(),
    };
    let file = h.lifecycle.upload(alice.id, request).await.unwrap();

    let download = h.lifecycle.download(alice.id, file.id).await.unwrap();
    assert_eq!(download.file.name, "notes.txt");
    assert_eq!(download.file.mime_type, "text/plain");

    let mut reader = download.reader;
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).await.unwrap();
    assert_eq!(bytes, b"hello drive");
}

#[tokio::test]
async fn test_same_name_uploads_are_kept_apart() {
    let h = Harness::new(1000);
    let alice = h.user("alice").await;

    let first = h.lifecycle.upload(alice.id, upload("dup.txt", 3)).await.unwrap();
    let second = h.lifecycle.upload(alice.id, upload("dup.txt", 4)).await.unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(h.blob_count().await, 2);
    assert_eq!(h.storage_used(alice.id).await, 7);
    h.assert_consistent().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_uploads_cannot_jointly_overflow() {
    for _ in 0..10 {
        let h = Harness::new(1000);
        let alice = h.user("alice").await.id;

        let first = {
            let lifecycle = h.lifecycle.clone();
            tokio::spawn(async move { lifecycle.upload(alice, upload("a", 600)).await })
        };
        let second = {
            let lifecycle = h.lifecycle.clone();
            tokio::spawn(async move { lifecycle.upload(alice, upload("b", 600)).await })
        };
        let results = [first.await.unwrap(), second.await.unwrap()];

        let admitted = results.iter().filter(|r| r.is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(AppError::QuotaExceeded { .. })))
            .count();
        assert_eq!((admitted, rejected), (1, 1));
        assert_eq!(h.storage_used(alice).await, 600);
        h.assert_consistent().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_mixed_operations_keep_usage_exact() {
    let h = Harness::new(1_000_000);
    let alice = h.user("alice").await.id;

    let mut seeded = Vec::new();
    for i in 0..10 {
        let file = h.lifecycle.upload(alice, upload(&format!("seed-{}", i), 100)).await.unwrap();
        seeded.push(file.id);
    }

    let mut tasks = Vec::new();
    for (i, file_id) in seeded.into_iter().enumerate() {
        let lifecycle = h.lifecycle.clone();
        tasks.push(tokio::spawn(async move {
            lifecycle.delete(alice, file_id).await.unwrap();
        }));
        let lifecycle = h.lifecycle.clone();
        tasks.push(tokio::spawn(async move {
            lifecycle
                .upload(alice, upload(&format!("new-{}", i), 50 + i))
                .await
                .unwrap();
        }));
    }
    for result in futures::future::join_all(tasks).await {
        result.unwrap();
    }

    let expected: i64 = (0..10).map(|i| 50 + i as i64).sum();
    assert_eq!(h.storage_used(alice).await, expected);
    h.assert_consistent().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_double_delete_subtracts_once() {
    let h = Harness::new(1000);
    let alice = h.user("alice").await.id;
    h.lifecycle.upload(alice, upload("keep", 200)).await.unwrap();
    let file_id = h.lifecycle.upload(alice, upload("gone", 300)).await.unwrap().id;

    let first = {
        let lifecycle = h.lifecycle.clone();
        tokio::spawn(async move { lifecycle.delete(alice, file_id).await })
    };
    let second = {
        let lifecycle = h.lifecycle.clone();
        tokio::spawn(async move { lifecycle.delete(alice, file_id).await })
    };
    let results = [first.await.unwrap(), second.await.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().any(|r| matches!(r, Err(AppError::NotFound))));
    assert_eq!(h.storage_used(alice).await, 200);
    h.assert_consistent().await;
}

#[tokio::test]
async fn test_failed_record_creation_removes_blob() {
    let ledger = Arc::new(FlakyLedger::new(QuotaPolicy::new(1000)));
    let h = Harness::with_ledger(ledger.clone());
    let alice = h.user("alice").await;

    ledger.fail_create_file.store(true, Ordering::SeqCst);
    let err = h.lifecycle.upload(alice.id, upload("a", 100)).await.unwrap_err();
    assert!(matches!(err, AppError::Ledger(_)));

    assert_eq!(h.blob_count().await, 0);
    assert_eq!(h.storage_used(alice.id).await, 0);
    h.assert_consistent().await;
}

#[tokio::test]
async fn test_failed_usage_update_rolls_back_record_and_blob() {
    let ledger = Arc::new(FlakyLedger::new(QuotaPolicy::new(1000)));
    let h = Harness::with_ledger(ledger.clone());
    let alice = h.user("alice").await;

    ledger.fail_set_storage_used.store(true, Ordering::SeqCst);
    let err = h.lifecycle.upload(alice.id, upload("a", 100)).await.unwrap_err();
    assert!(matches!(err, AppError::Ledger(_)));

    assert!(h.lifecycle.list(alice.id).await.unwrap().is_empty());
    assert_eq!(h.blob_count().await, 0);
    ledger.fail_set_storage_used.store(false, Ordering::SeqCst);
    h.assert_consistent().await;
}

#[tokio::test]
async fn test_failed_rollback_keeps_blob_with_surviving_record() {
    let ledger = Arc::new(FlakyLedger::new(QuotaPolicy::new(1000)));
    let h = Harness::with_ledger(ledger.clone());
    let alice = h.user("alice").await.id;

    ledger.fail_set_storage_used.store(true, Ordering::SeqCst);
    ledger.fail_delete_file.store(true, Ordering::SeqCst);
    let mut request = upload("stuck.bin", 10);
    request.bytes = b"0123456789".to_vec();
    let err = h.lifecycle.upload(alice, request).await.unwrap_err();
    assert!(matches!(err, AppError::Ledger(_)));

    // The record could not be removed, so its bytes must stay readable.
    let files = h.lifecycle.list(alice).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(h.blob_count().await, 1);
    let mut download = h.lifecycle.download(alice, files[0].id).await.unwrap();
    let mut bytes = Vec::new();
    download.reader.read_to_end(&mut bytes).await.unwrap();
    assert_eq!(bytes, b"0123456789");

    // Once the ledger recovers, reconciliation accounts for the surviving file.
    ledger.fail_set_storage_used.store(false, Ordering::SeqCst);
    ledger.fail_delete_file.store(false, Ordering::SeqCst);
    assert_eq!(h.storage_used(alice).await, 0);
    let (sweep, reconcile) = h.sweeper(Duration::ZERO).run_once().await.unwrap();
    assert_eq!(sweep.orphaned, 0);
    assert_eq!(reconcile.corrected, 1);
    assert_eq!(h.storage_used(alice).await, 10);
    h.assert_consistent().await;
}

#[tokio::test]
async fn test_sweeper_removes_orphans_and_keeps_referenced_blobs() {
    let h = Harness::new(1000);
    let alice = h.user("alice").await;
    let kept = h.lifecycle.upload(alice.id, upload("kept", 10)).await.unwrap();

    // Bytes left behind by a crash between blob write and record commit.
    h.blobs.put(alice.id, "crashed.bin", b"orphan").await.unwrap();
    assert_eq!(h.blob_count().await, 2);

    // Within the grace period nothing is touched.
    let report = h.sweeper(Duration::from_secs(3600)).sweep().await.unwrap();
    assert_eq!((report.scanned, report.orphaned, report.removed), (2, 1, 0));
    assert_eq!(report.skipped_recent, 1);
    assert_eq!(h.blob_count().await, 2);

    let report = h.sweeper(Duration::ZERO).sweep().await.unwrap();
    assert_eq!((report.orphaned, report.removed, report.failed), (1, 1, 0));
    assert_eq!(h.blob_count().await, 1);
    assert!(h.lifecycle.download(alice.id, kept.id).await.is_ok());
    h.assert_consistent().await;
}

#[tokio::test]
async fn test_reconcile_repairs_drifted_usage() {
    let h = Harness::new(1000);
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;
    h.lifecycle.upload(alice.id, upload("a", 120)).await.unwrap();

    // Simulates a crash after the record commit but before the usage write.
    h.ledger.set_user_storage_used(alice.id, 0).await.unwrap();
    h.ledger.set_user_storage_used(bob.id, 50).await.unwrap();

    let (sweep, reconcile) = h.sweeper(Duration::ZERO).run_once().await.unwrap();
    assert_eq!(sweep.orphaned, 0);
    assert_eq!(reconcile.users, 2);
    assert_eq!(reconcile.corrected, 2);

    assert_eq!(h.storage_used(alice.id).await, 120);
    assert_eq!(h.storage_used(bob.id).await, 0);
    h.assert_consistent().await;
}
