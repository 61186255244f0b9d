// tests/scenarios.rs

//! End-to-end scenarios over the full stack: transactions driving the
//! tiered file system, lock publication, and LRU eviction.

use async_trait::async_trait;
use std::sync::Arc;
use tierfs::{
    EvictionMode, ExecOptions, LockManager, LockOptions, LockRegistry, MkdirOptions, RmOptions,
    RmdirOptions, Storage, StorageCaps, Tier, TierConfig, TieredFs, Transaction, TxnStatus,
    WriteOptions,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Storage wrapper that rejects writes to one path, for failure injection
struct FailingStorage {
    inner: Arc<TieredFs>,
    fail_path: String,
    message: String,
}

#[async_trait]
impl Storage for FailingStorage {
    fn caps(&self) -> StorageCaps {
        self.inner.caps()
    }

    async fn write_file(
        &self,
        path: &str,
        bytes: &[u8],
        opts: &WriteOptions,
    ) -> tierfs::Result<u64> {
        if path == self.fail_path {
            return Err(tierfs::Error::Storage(self.message.clone()));
        }
        self.inner.write_file(path, bytes, opts).await
    }

    async fn read_file(&self, path: &str) -> tierfs::Result<Vec<u8>> {
        self.inner.read_file(path).await
    }

    async fn exists(&self, path: &str) -> tierfs::Result<bool> {
        Storage::exists(self.inner.as_ref(), path).await
    }

    async fn unlink(&self, path: &str) -> tierfs::Result<()> {
        Storage::unlink(self.inner.as_ref(), path).await
    }

    async fn rm(&self, path: &str, opts: &RmOptions) -> tierfs::Result<()> {
        Storage::rm(self.inner.as_ref(), path, opts).await
    }

    async fn rmdir(&self, path: &str, opts: &RmdirOptions) -> tierfs::Result<()> {
        Storage::rmdir(self.inner.as_ref(), path, opts).await
    }

    async fn rename(&self, from: &str, to: &str, overwrite: bool) -> tierfs::Result<()> {
        Storage::rename(self.inner.as_ref(), from, to, overwrite).await
    }

    async fn mkdir(&self, path: &str, opts: &MkdirOptions) -> tierfs::Result<()> {
        Storage::mkdir(self.inner.as_ref(), path, opts).await
    }

    async fn delete_file(&self, path: &str) -> tierfs::Result<()> {
        Storage::delete_file(self.inner.as_ref(), path).await
    }
}

fn failing(fs: &Arc<TieredFs>, path: &str, message: &str) -> FailingStorage {
    FailingStorage {
        inner: Arc::clone(fs),
        fail_path: path.to_string(),
        message: message.to_string(),
    }
}

/// E1: atomic multi-write, success
#[tokio::test]
async fn e1_atomic_multi_write_success() {
    let fs = TieredFs::in_memory();

    let mut txn = Transaction::new();
    txn.write("/a.txt", b"A".to_vec()).unwrap();
    txn.write("/b.txt", b"B".to_vec()).unwrap();
    txn.write("/c.txt", b"C".to_vec()).unwrap();

    let report = txn.execute(&fs, ExecOptions::new()).await.unwrap();

    assert_eq!(txn.status(), TxnStatus::Committed);
    assert_eq!(report.operations_executed, 3);
    assert_eq!(fs.read("/a.txt").await.unwrap(), b"A");
    assert_eq!(fs.read("/b.txt").await.unwrap(), b"B");
    assert_eq!(fs.read("/c.txt").await.unwrap(), b"C");
}

/// E2: atomic multi-write, backend rejects the middle write
#[tokio::test]
async fn e2_atomic_multi_write_failure() {
    init_tracing();
    let fs = Arc::new(TieredFs::in_memory());
    let storage = failing(&fs, "/b.txt", "Disk full");

    let mut txn = Transaction::new();
    txn.write("/a.txt", b"A".to_vec()).unwrap();
    txn.write("/b.txt", b"B".to_vec()).unwrap();
    txn.write("/c.txt", b"C".to_vec()).unwrap();

    let err = txn.execute(&storage, ExecOptions::new()).await.unwrap_err();

    assert!(err.to_string().contains("Disk full"));
    assert_eq!(txn.status(), TxnStatus::RolledBack);
    assert!(txn.last_rollback_summary().is_some());
    assert!(!fs.exists("/a.txt").await);
    assert!(!fs.exists("/b.txt").await);
    assert!(!fs.exists("/c.txt").await);
}

/// E3: a failed transaction restores overwritten bytes
#[tokio::test]
async fn e3_restore_on_overwrite() {
    let fs = Arc::new(TieredFs::in_memory());
    fs.write("/existing.txt", b"existing content", &WriteOptions::default())
        .await
        .unwrap();

    let storage = failing(&fs, "/fail.txt", "injected failure");
    let mut txn = Transaction::new();
    txn.write("/existing.txt", b"overwritten".to_vec()).unwrap();
    txn.write("/fail.txt", b"x".to_vec()).unwrap();

    txn.execute(&storage, ExecOptions::new()).await.unwrap_err();

    assert_eq!(txn.status(), TxnStatus::RolledBack);
    assert_eq!(fs.read("/existing.txt").await.unwrap(), b"existing content");
    assert!(!fs.exists("/fail.txt").await);
}

/// E4: atomic lock swap publishes new content and leaves no lock file
#[tokio::test]
async fn e4_atomic_lock_swap() {
    let fs = TieredFs::in_memory();
    fs.mkdir("/dest", &MkdirOptions::default()).await.unwrap();
    fs.write("/dest/config.json", b"{\"v\":0}", &WriteOptions::default())
        .await
        .unwrap();

    let mut txn =
        Transaction::atomic_lock_swap("/dest/config.json", b"{\"v\":2}".to_vec()).unwrap();
    txn.execute(&fs, ExecOptions::new()).await.unwrap();

    assert_eq!(txn.status(), TxnStatus::Committed);
    assert_eq!(fs.read("/dest/config.json").await.unwrap(), b"{\"v\":2}");
    assert!(!fs.exists("/dest/config.json.lock").await);
}

/// E5: cross-directory move with mkdirp, success then failure variant
#[tokio::test]
async fn e5_cross_directory_move_with_mkdirp() {
    let fs = TieredFs::in_memory();
    fs.mkdir("/src", &MkdirOptions::default()).await.unwrap();
    fs.write("/src/x", b"the payload", &WriteOptions::default())
        .await
        .unwrap();

    let mut txn = Transaction::new();
    txn.rename("/src/x", "/new/deep/x", true, false).unwrap();
    txn.execute(&fs, ExecOptions::new()).await.unwrap();

    assert_eq!(fs.stat("/new/deep").await.unwrap().kind, tierfs::NodeKind::Dir);
    assert_eq!(fs.read("/new/deep/x").await.unwrap(), b"the payload");
    assert!(!fs.exists("/src/x").await);
}

#[tokio::test]
async fn e5_cross_directory_move_failure_removes_created_dirs() {
    let fs = Arc::new(TieredFs::in_memory());
    fs.mkdir("/src", &MkdirOptions::default()).await.unwrap();
    fs.write("/src/x", b"the payload", &WriteOptions::default())
        .await
        .unwrap();

    // The rename succeeds; a later deletion of a missing path fails the
    // transaction and triggers rollback
    let mut txn = Transaction::new();
    txn.rename("/src/x", "/new/deep/x", true, false).unwrap();
    txn.unlink("/not-there").unwrap();

    let err = txn.execute(fs.as_ref(), ExecOptions::new()).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(txn.status(), TxnStatus::RolledBack);

    // Move undone and the created directory chain removed
    assert_eq!(fs.read("/src/x").await.unwrap(), b"the payload");
    assert!(!fs.exists("/new/deep/x").await);
    assert!(!fs.exists("/new/deep").await);
    assert!(!fs.exists("/new").await);
}

/// E6: LRU eviction demotes the five oldest pages
#[tokio::test]
async fn e6_lru_eviction() {
    init_tracing();
    let fs = TieredFs::builder()
        .page_size(64)
        .tier_config(TierConfig {
            max_hot_pages: 10,
            eviction_threshold: 0.8,
            eviction_target: 0.5,
        })
        .eviction_mode(EvictionMode::Manual)
        .build()
        .unwrap();

    // Ten single-page files; distinct content so no dedup interferes
    let mut page_ids = Vec::new();
    for i in 0..10u8 {
        let path = format!("/p{i}");
        fs.write(&path, &[i; 64], &WriteOptions::default()).await.unwrap();
    }
    let index = fs.blobs().pages().index();
    // Ascending access stamps p0..p9
    for i in 0..10u8 {
        let blob_id = tierfs::hash::blob_id(&[i; 64]);
        let record = fs.blobs().record(&blob_id).unwrap();
        let page_id = record.page_ids[0].clone();
        index.set_last_access(&page_id, 1_000 + i as i64);
        page_ids.push(page_id);
    }

    assert!(fs.tier().should_evict());
    let result = fs.tier().run_eviction().await;

    assert_eq!(result.evicted_count, 5);
    assert!(result.errors.is_empty());
    assert_eq!(result.evicted_page_ids, page_ids[0..5].to_vec());
    assert_eq!(fs.tier().hot_page_count(), 5);

    for (i, page_id) in page_ids.iter().enumerate().take(5) {
        assert_eq!(index.get(page_id).unwrap().tier, Tier::Cold);
        // Still readable end-to-end from the cold backend
        assert_eq!(fs.read(&format!("/p{i}")).await.unwrap(), vec![i as u8; 64]);
    }
}

/// Property 7: among N concurrent try-once acquires, exactly one wins
#[tokio::test]
async fn lock_mutual_exclusion() {
    let fs: Arc<dyn Storage> = Arc::new(TieredFs::in_memory());
    let manager = Arc::new(
        LockManager::new(fs).with_registry(Arc::new(LockRegistry::new())),
    );

    let mut handles = Vec::new();
    for _ in 0..16 {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            manager.acquire("/contested", LockOptions::try_once()).await
        }));
    }

    let mut winners = Vec::new();
    let mut losers = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(guard) => winners.push(guard),
            Err(e) => {
                assert_eq!(e.code(), "EWOULDBLOCK");
                losers += 1;
            }
        }
    }

    assert_eq!(winners.len(), 1);
    assert_eq!(losers, 15);
    winners.pop().unwrap().release().await.unwrap();
    assert!(manager.registry().is_empty());
}

/// Property 4: dedup across paths, refcount-governed deletion
#[tokio::test]
async fn dedup_and_refcount_gc() {
    let fs = TieredFs::in_memory();

    fs.write("/one", b"shared bytes", &WriteOptions::default()).await.unwrap();
    fs.write("/two", b"shared bytes", &WriteOptions::default()).await.unwrap();
    assert_eq!(fs.blobs().len(), 1);

    fs.unlink("/one").await.unwrap();
    assert_eq!(fs.read("/two").await.unwrap(), b"shared bytes");

    fs.unlink("/two").await.unwrap();
    assert_eq!(fs.blobs().len(), 0);
    assert!(fs.blobs().pages().index().is_empty());
}

/// Lock manager staged write and commit over the live file system
#[tokio::test]
async fn lock_write_and_commit_roundtrip() {
    let fs = Arc::new(TieredFs::in_memory());
    fs.write("/state.json", b"v1", &WriteOptions::default()).await.unwrap();

    let storage: Arc<dyn Storage> = Arc::clone(&fs) as Arc<dyn Storage>;
    let manager = LockManager::new(storage).with_registry(Arc::new(LockRegistry::new()));

    let guard = manager.acquire("/state.json", LockOptions::try_once()).await.unwrap();
    guard.write(b"draft").await.unwrap();
    guard.refresh().await.unwrap();
    guard.commit(b"v2").await.unwrap();

    assert_eq!(fs.read("/state.json").await.unwrap(), b"v2");
    assert!(!fs.exists("/state.json.lock").await);
    assert!(!manager.is_locked("/state.json"));
}

/// Transactions compose with eviction: data written in a transaction
/// survives demotion to the cold tier
#[tokio::test]
async fn transactional_writes_survive_eviction() {
    let fs = TieredFs::builder()
        .page_size(32)
        .tier_config(TierConfig {
            max_hot_pages: 4,
            eviction_threshold: 0.5,
            eviction_target: 0.25,
        })
        .eviction_mode(EvictionMode::Manual)
        .build()
        .unwrap();

    let mut txn = Transaction::new();
    for i in 0..4u8 {
        txn.write(format!("/f{i}"), vec![i; 32]).unwrap();
    }
    txn.execute(&fs, ExecOptions::new()).await.unwrap();

    let result = fs.tier().run_eviction().await;
    assert!(result.evicted_count > 0);

    for i in 0..4u8 {
        assert_eq!(fs.read(&format!("/f{i}")).await.unwrap(), vec![i; 32]);
    }
}
