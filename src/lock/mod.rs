// src/lock/mod.rs

//! Advisory locks with exclusive-create and rename publication
//!
//! A lock on `path` is an exclusive-create of `<path>.lock` through the
//! Storage port: among concurrent acquirers exactly one create succeeds.
//! Contenders poll with exponential backoff until their timeout budget is
//! spent; a configurable staleness threshold lets a crashed holder's lock
//! be broken and re-acquired.
//!
//! The lock file doubles as a staging area: `write` stages content into it,
//! and `commit` renames it onto the target, publishing and releasing in one
//! atomic step.

use crate::error::{Error, Result};
use crate::page::now_millis;
use crate::txn::rollback::delete_best_effort;
use crate::txn::storage::{Storage, WriteOptions};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default lock file suffix
pub const DEFAULT_LOCK_SUFFIX: &str = ".lock";

/// Acquisition tuning
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Total wait budget; 0 means try exactly once
    pub timeout_ms: u64,
    /// First retry delay
    pub retry_interval_ms: u64,
    /// Growth factor applied after each failed attempt
    pub backoff_multiplier: f64,
    /// Retry delay ceiling
    pub max_retry_interval_ms: u64,
    /// Locks whose holder has not refreshed within this window are broken
    pub stale_threshold_ms: Option<u64>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            retry_interval_ms: 50,
            backoff_multiplier: 2.0,
            max_retry_interval_ms: 1_000,
            stale_threshold_ms: None,
        }
    }
}

impl LockOptions {
    /// Single attempt, no waiting
    pub fn try_once() -> Self {
        Self {
            timeout_ms: 0,
            ..Self::default()
        }
    }
}

/// Who holds a lock and since when (unix millis)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub holder_id: String,
    pub acquired_at: i64,
    pub refreshed_at: i64,
}

impl LockInfo {
    /// Milliseconds since the holder last refreshed
    pub fn age_ms(&self) -> u64 {
        (now_millis() - self.refreshed_at).max(0) as u64
    }
}

/// Record serialized into the lock file itself
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    path: String,
    #[serde(flatten)]
    info: LockInfo,
}

/// Process-wide map of held locks
#[derive(Default)]
pub struct LockRegistry {
    entries: Mutex<HashMap<String, LockInfo>>,
}

static LOCK_REGISTRY: OnceLock<Arc<LockRegistry>> = OnceLock::new();

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, created on first use
    pub fn global() -> Arc<LockRegistry> {
        Arc::clone(LOCK_REGISTRY.get_or_init(|| Arc::new(LockRegistry::new())))
    }

    pub fn get(&self, path: &str) -> Option<LockInfo> {
        self.entries.lock().get(path).cloned()
    }

    pub fn is_locked(&self, path: &str) -> bool {
        self.entries.lock().contains_key(path)
    }

    pub fn all(&self) -> HashMap<String, LockInfo> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every entry; tests only
    pub fn reset(&self) {
        self.entries.lock().clear();
    }

    fn insert(&self, path: &str, info: LockInfo) {
        self.entries.lock().insert(path.to_string(), info);
    }

    fn remove(&self, path: &str) -> Option<LockInfo> {
        self.entries.lock().remove(path)
    }

    /// Remove only if `holder_id` still owns the entry; a broken-and-
    /// reacquired lock must not lose its new holder's record
    fn remove_holder(&self, path: &str, holder_id: &str) -> bool {
        let mut entries = self.entries.lock();
        if entries
            .get(path)
            .is_some_and(|info| info.holder_id == holder_id)
        {
            entries.remove(path);
            true
        } else {
            false
        }
    }

    fn refresh(&self, path: &str, holder_id: &str) -> Option<LockInfo> {
        let mut entries = self.entries.lock();
        let info = entries.get_mut(path)?;
        if info.holder_id != holder_id {
            return None;
        }
        info.refreshed_at = now_millis();
        Some(info.clone())
    }

    /// Registry entries older than the threshold
    fn stale_paths(&self, threshold_ms: u64) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, info)| info.age_ms() >= threshold_ms)
            .map(|(path, _)| path.clone())
            .collect()
    }
}

/// Acquires and administers advisory locks over a Storage port
pub struct LockManager {
    storage: Arc<dyn Storage>,
    suffix: String,
    registry: Arc<LockRegistry>,
}

impl LockManager {
    /// Manager using the process-wide registry and the default suffix
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            suffix: DEFAULT_LOCK_SUFFIX.to_string(),
            registry: LockRegistry::global(),
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    /// Use a private registry instead of the process-wide one
    pub fn with_registry(mut self, registry: Arc<LockRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &Arc<LockRegistry> {
        &self.registry
    }

    pub fn lock_path(&self, path: &str) -> String {
        format!("{path}{}", self.suffix)
    }

    pub fn is_locked(&self, path: &str) -> bool {
        self.registry.is_locked(path)
    }

    pub fn get_lock_info(&self, path: &str) -> Option<LockInfo> {
        self.registry.get(path)
    }

    pub fn get_all_locks(&self) -> HashMap<String, LockInfo> {
        self.registry.all()
    }

    /// Acquire the lock on `path`, polling with exponential backoff
    pub async fn acquire(&self, path: &str, opts: LockOptions) -> Result<LockGuard> {
        let lock_path = self.lock_path(path);
        let holder_id = uuid::Uuid::new_v4().to_string();
        let start = Instant::now();
        let mut interval_ms = opts.retry_interval_ms.max(1);

        loop {
            let now = now_millis();
            let record = LockRecord {
                path: path.to_string(),
                info: LockInfo {
                    holder_id: holder_id.clone(),
                    acquired_at: now,
                    refreshed_at: now,
                },
            };
            let payload = serde_json::to_vec(&record)
                .map_err(|e| Error::Storage(format!("lock record encode failed: {e}")))?;

            match self
                .storage
                .write_file(&lock_path, &payload, &WriteOptions::exclusive())
                .await
            {
                Ok(_) => {
                    self.registry.insert(path, record.info.clone());
                    debug!("acquired lock on {} as {}", path, holder_id);
                    return Ok(LockGuard {
                        storage: Arc::clone(&self.storage),
                        registry: Arc::clone(&self.registry),
                        path: path.to_string(),
                        lock_path,
                        holder_id,
                        released: false,
                    });
                }
                Err(Error::Exists(_)) => {
                    if let Some(threshold) = opts.stale_threshold_ms {
                        if self.try_break_stale(path, &lock_path, threshold).await? {
                            // Broken; retry immediately
                            continue;
                        }
                    }

                    let holder = self
                        .registry
                        .get(path)
                        .map(|info| info.holder_id)
                        .unwrap_or_else(|| "unknown".to_string());

                    if opts.timeout_ms == 0 {
                        return Err(Error::WouldBlock {
                            path: path.to_string(),
                            holder,
                        });
                    }

                    let elapsed = start.elapsed().as_millis() as u64;
                    if elapsed >= opts.timeout_ms {
                        return Err(Error::TimedOut {
                            path: path.to_string(),
                            waited_ms: elapsed,
                        });
                    }

                    let budget = opts.timeout_ms - elapsed;
                    let sleep_ms = interval_ms.min(opts.max_retry_interval_ms).min(budget);
                    tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
                    interval_ms = ((interval_ms as f64) * opts.backoff_multiplier) as u64;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Break a lock older than `threshold_ms`; true when something was broken
    async fn try_break_stale(
        &self,
        path: &str,
        lock_path: &str,
        threshold_ms: u64,
    ) -> Result<bool> {
        let age_ms = match self.registry.get(path) {
            Some(info) => info.age_ms(),
            None => {
                // Orphan lock file from another process or a crash; consult
                // the record inside it, treating an unreadable one as stale
                match self.read_lock_record(lock_path).await {
                    Some(record) => record.info.age_ms(),
                    None => u64::MAX,
                }
            }
        };

        if age_ms < threshold_ms {
            return Ok(false);
        }

        warn!("breaking stale lock on {} (idle {}ms)", path, age_ms);
        match self.break_lock(path).await {
            Ok(_) => Ok(true),
            Err(_) => Err(Error::Stale {
                path: path.to_string(),
                age_ms,
            }),
        }
    }

    async fn read_lock_record(&self, lock_path: &str) -> Option<LockRecord> {
        if !self.storage.caps().read_file {
            return None;
        }
        let bytes = self.storage.read_file(lock_path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Forcibly remove a lock's registry entry and file
    pub async fn break_lock(&self, path: &str) -> Result<bool> {
        let had_entry = self.registry.remove(path).is_some();
        let lock_path = self.lock_path(path);

        match delete_best_effort(self.storage.as_ref(), &lock_path).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(had_entry),
            Err(e) => Err(e),
        }
    }

    /// Reclaim every lock idle past `threshold_ms`; returns their paths
    pub async fn cleanup_stale_locks(&self, threshold_ms: u64) -> Result<Vec<String>> {
        let victims = self.registry.stale_paths(threshold_ms);
        let mut reclaimed = Vec::with_capacity(victims.len());

        for path in victims {
            match self.break_lock(&path).await {
                Ok(_) => reclaimed.push(path),
                Err(e) => warn!("failed to reclaim stale lock on {}: {}", path, e),
            }
        }
        Ok(reclaimed)
    }
}

/// A held lock
///
/// Release explicitly with [`LockGuard::release`] or publish with
/// [`LockGuard::commit`]; a guard dropped while held only clears its
/// registry entry and leaves the lock file for staleness reclaim.
pub struct LockGuard {
    storage: Arc<dyn Storage>,
    registry: Arc<LockRegistry>,
    path: String,
    lock_path: String,
    holder_id: String,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("path", &self.path)
            .field("lock_path", &self.lock_path)
            .field("holder_id", &self.holder_id)
            .field("released", &self.released)
            .finish()
    }
}

impl LockGuard {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Stage content into the lock file, replacing prior staged content
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        self.ensure_held()?;
        self.storage
            .write_file(&self.lock_path, bytes, &WriteOptions::default())
            .await?;
        Ok(())
    }

    /// Re-stamp the lock so staleness heuristics leave it alone
    pub async fn refresh(&self) -> Result<()> {
        self.ensure_held()?;
        let info = self
            .registry
            .refresh(&self.path, &self.holder_id)
            .ok_or_else(|| Error::not_found(format!("lock on {}", self.path)))?;

        // Keep the on-storage record in step with the registry
        let record = LockRecord {
            path: self.path.clone(),
            info,
        };
        let payload = serde_json::to_vec(&record)
            .map_err(|e| Error::Storage(format!("lock record encode failed: {e}")))?;
        self.storage
            .write_file(&self.lock_path, &payload, &WriteOptions::default())
            .await?;
        Ok(())
    }

    /// Write `bytes` and atomically publish them onto the target path,
    /// releasing the lock in the same step
    pub async fn commit(mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_held()?;
        self.storage
            .write_file(&self.lock_path, bytes, &WriteOptions::default())
            .await?;
        self.storage
            .rename(&self.lock_path, &self.path, true)
            .await?;

        self.registry.remove_holder(&self.path, &self.holder_id);
        self.released = true;
        debug!("committed lock on {} via rename", self.path);
        Ok(())
    }

    /// Delete the lock file and release
    pub async fn release(mut self) -> Result<()> {
        self.ensure_held()?;
        delete_best_effort(self.storage.as_ref(), &self.lock_path).await?;
        self.registry.remove_holder(&self.path, &self.holder_id);
        self.released = true;
        debug!("released lock on {}", self.path);
        Ok(())
    }

    fn ensure_held(&self) -> Result<()> {
        if self.released {
            return Err(Error::Transaction(format!(
                "lock on {} already released",
                self.path
            )));
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                "lock on {} dropped without release; registry entry cleared, lock file remains",
                self.path
            );
            self.registry.remove_holder(&self.path, &self.holder_id);
        }
    }
}
