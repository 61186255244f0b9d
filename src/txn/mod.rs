// src/txn/mod.rs

//! Transaction engine for atomic file-system mutations
//!
//! A [`Transaction`] accumulates operations, reorders them by a fixed
//! priority, and executes them sequentially against a [`Storage`] port with
//! all-or-nothing semantics. Key behaviors:
//!
//! - **Priority ordering**: parents exist before children are written,
//!   payloads exist before they are renamed into place, deletions run after
//!   dependent moves, empty directories go last.
//! - **Undo capture**: each applied operation records enough to reverse it;
//!   a failure replays the log backwards, best-effort.
//! - **Backend transactions**: storage ports that advertise
//!   `begin_transaction` get wrapped execution instead of application-level
//!   undo; content capture is forced off while one is active, since captured
//!   reads would race the pending snapshot.
//!
//! Note that cross-class reordering applies even to the same path: a
//! `write(x)` followed by `rm(x)` in one transaction executes write first
//! and leaves `x` absent regardless of queue order. Callers that need the
//! literal order run separate transactions.

pub mod rollback;
pub mod storage;

pub use rollback::{CompletedOperation, RollbackStep, RollbackSummary, StepOutcome};
pub use storage::{
    MkdirOptions, RmOptions, RmdirOptions, Storage, StorageCaps, StorageTransaction, WriteFlag,
    WriteOptions,
};

use crate::error::{Error, Result};
use crate::fs::path::{ancestors_of, is_cross_directory, parent_of};
use rollback::rollback_completed;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A queued file-system mutation
#[derive(Debug, Clone)]
pub enum Operation {
    Write {
        path: String,
        bytes: Vec<u8>,
        opts: WriteOptions,
    },
    Unlink {
        path: String,
    },
    Rm {
        path: String,
        force: bool,
        recursive: bool,
    },
    Rmdir {
        path: String,
        recursive: bool,
    },
    Rename {
        old: String,
        new: String,
        mkdirp: bool,
        overwrite: bool,
    },
    Mkdir {
        path: String,
        recursive: bool,
        mode: Option<u32>,
    },
}

impl Operation {
    /// Execution priority; lower runs first, ties keep insertion order
    pub const fn priority(&self) -> u8 {
        match self {
            Self::Mkdir { .. } => 0,
            Self::Write { .. } => 1,
            Self::Rename { .. } => 2,
            Self::Unlink { .. } | Self::Rm { .. } => 3,
            Self::Rmdir { .. } => 4,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Write { .. } => "write",
            Self::Unlink { .. } => "unlink",
            Self::Rm { .. } => "rm",
            Self::Rmdir { .. } => "rmdir",
            Self::Rename { .. } => "rename",
            Self::Mkdir { .. } => "mkdir",
        }
    }

    /// The operation's primary path
    pub fn path(&self) -> &str {
        match self {
            Self::Write { path, .. }
            | Self::Unlink { path }
            | Self::Rm { path, .. }
            | Self::Rmdir { path, .. }
            | Self::Mkdir { path, .. } => path,
            Self::Rename { old, .. } => old,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Write { path, bytes, opts } => {
                write!(f, "write {} ({} bytes, flag {})", path, bytes.len(), opts.flag.as_str())
            }
            Self::Unlink { path } => write!(f, "unlink {path}"),
            Self::Rm { path, force, recursive } => {
                write!(f, "rm {path} (force={force}, recursive={recursive})")
            }
            Self::Rmdir { path, recursive } => write!(f, "rmdir {path} (recursive={recursive})"),
            Self::Rename { old, new, .. } => write!(f, "rename {old} -> {new}"),
            Self::Mkdir { path, recursive, .. } => write!(f, "mkdir {path} (recursive={recursive})"),
        }
    }
}

/// Transaction lifecycle; transitions are pending -> committed or
/// pending -> rolled_back, nothing else
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxnStatus {
    #[default]
    Pending,
    Committed,
    RolledBack,
}

impl TxnStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl std::fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Measurements handed to the metrics callback after execution
#[derive(Debug, Clone)]
pub struct TxnMetrics {
    pub transaction_id: String,
    pub status: TxnStatus,
    pub operations_executed: usize,
    pub operations_rolled_back: Option<usize>,
    pub total_duration_ms: u64,
    pub operation_duration_ms: u64,
    pub rollback_duration_ms: Option<u64>,
    pub used_db_transaction: bool,
    pub error_message: Option<String>,
}

type MetricsCallback = Box<dyn Fn(&TxnMetrics) + Send + Sync>;

/// Execution options
#[derive(Default)]
pub struct ExecOptions {
    /// Traverse the plan and log intended actions without touching storage
    pub dry_run: bool,
    /// Correlation token for logs and metrics; autogenerated when absent
    pub transaction_id: Option<String>,
    /// Soft wall-clock bound checked before each operation dispatch
    pub timeout_ms: Option<u64>,
    /// Capture previous content for rollback; forced off while a backend
    /// transaction is active
    pub capture_content: Option<bool>,
    /// Wrap execution in a backend transaction when the port supports it
    pub use_db_transaction: bool,
    pub on_metrics: Option<MetricsCallback>,
}

impl ExecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn with_transaction_id(mut self, id: impl Into<String>) -> Self {
        self.transaction_id = Some(id.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn without_capture(mut self) -> Self {
        self.capture_content = Some(false);
        self
    }

    pub fn with_db_transaction(mut self) -> Self {
        self.use_db_transaction = true;
        self
    }

    pub fn on_metrics(mut self, callback: impl Fn(&TxnMetrics) + Send + Sync + 'static) -> Self {
        self.on_metrics = Some(Box::new(callback));
        self
    }
}

/// Result of a successful (or dry-run) execution
#[derive(Debug, Clone)]
pub struct ExecReport {
    pub transaction_id: String,
    pub operations_executed: usize,
    pub duration_ms: u64,
    pub dry_run: bool,
    pub used_db_transaction: bool,
}

/// An ordered batch of operations executed with all-or-nothing semantics
#[derive(Debug, Default)]
pub struct Transaction {
    operations: Vec<Operation>,
    status: TxnStatus,
    last_rollback_summary: Option<RollbackSummary>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> TxnStatus {
        self.status
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Populated only after a rollback
    pub fn last_rollback_summary(&self) -> Option<&RollbackSummary> {
        self.last_rollback_summary.as_ref()
    }

    /// Queue an operation; fails unless the transaction is pending
    pub fn push(&mut self, op: Operation) -> Result<&mut Self> {
        self.check_pending("add operation to")?;
        self.operations.push(op);
        Ok(self)
    }

    pub fn write(&mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Result<&mut Self> {
        self.write_with(path, bytes, WriteOptions::default())
    }

    pub fn write_with(
        &mut self,
        path: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
        opts: WriteOptions,
    ) -> Result<&mut Self> {
        self.push(Operation::Write {
            path: path.into(),
            bytes: bytes.into(),
            opts,
        })
    }

    pub fn unlink(&mut self, path: impl Into<String>) -> Result<&mut Self> {
        self.push(Operation::Unlink { path: path.into() })
    }

    pub fn rm(&mut self, path: impl Into<String>, force: bool, recursive: bool) -> Result<&mut Self> {
        self.push(Operation::Rm {
            path: path.into(),
            force,
            recursive,
        })
    }

    pub fn rmdir(&mut self, path: impl Into<String>, recursive: bool) -> Result<&mut Self> {
        self.push(Operation::Rmdir {
            path: path.into(),
            recursive,
        })
    }

    pub fn rename(
        &mut self,
        old: impl Into<String>,
        new: impl Into<String>,
        mkdirp: bool,
        overwrite: bool,
    ) -> Result<&mut Self> {
        self.push(Operation::Rename {
            old: old.into(),
            new: new.into(),
            mkdirp,
            overwrite,
        })
    }

    pub fn mkdir(&mut self, path: impl Into<String>, recursive: bool) -> Result<&mut Self> {
        self.push(Operation::Mkdir {
            path: path.into(),
            recursive,
            mode: None,
        })
    }

    /// Stage into a temporary, publish with an overwriting rename, then
    /// clear the staging slot
    ///
    /// Reordering executes write before rename before rm; the rm targets the
    /// staging path, so the overwriting rename is what replaces the old
    /// content and the trailing rm is a no-op unless the rename never ran.
    pub fn atomic_swap(target: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let target = target.into();
        let staged = format!("{target}.tmp");

        let mut txn = Self::new();
        txn.write(&staged, bytes)?;
        txn.rm(&staged, true, false)?;
        txn.rename(&staged, &target, false, true)?;
        Ok(txn)
    }

    /// Exclusive-create a lock file, then rename it onto the target
    ///
    /// The `wx` flag guarantees mutual exclusion across competing writers;
    /// the rename atomically publishes and releases in one step.
    pub fn atomic_lock_swap(target: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let target = target.into();
        let lock_path = format!("{target}.lock");

        let mut txn = Self::new();
        txn.write_with(&lock_path, bytes, WriteOptions::exclusive())?;
        txn.rename(&lock_path, &target, false, true)?;
        Ok(txn)
    }

    /// Batch factory: one write per entry
    pub fn write_all(files: impl IntoIterator<Item = (String, Vec<u8>)>) -> Result<Self> {
        let mut txn = Self::new();
        for (path, bytes) in files {
            txn.write(path, bytes)?;
        }
        Ok(txn)
    }

    /// Batch factory: one forced rm per path
    pub fn delete_all(paths: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut txn = Self::new();
        for path in paths {
            txn.rm(path, true, false)?;
        }
        Ok(txn)
    }

    /// The execution plan: operations stably sorted by priority
    pub fn ordered_operations(&self) -> Vec<Operation> {
        let mut plan = self.operations.clone();
        plan.sort_by_key(|op| op.priority());
        plan
    }

    /// Execute the plan against `storage`
    ///
    /// On failure the completed prefix is rolled back, the summary is
    /// stored, and the original error is returned (wrapped in an aggregate
    /// when rollback itself had failures). A committed or rolled-back
    /// transaction cannot be executed again.
    pub async fn execute(
        &mut self,
        storage: &dyn Storage,
        opts: ExecOptions,
    ) -> Result<ExecReport> {
        self.check_pending("execute")?;

        let tx_id = opts
            .transaction_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let plan = self.ordered_operations();
        let start = Instant::now();

        if opts.dry_run {
            info!("[{}] dry run: {} operation(s)", tx_id, plan.len());
            for op in &plan {
                info!("[{}] would {}", tx_id, op);
            }
            return Ok(ExecReport {
                transaction_id: tx_id,
                operations_executed: 0,
                duration_ms: start.elapsed().as_millis() as u64,
                dry_run: true,
                used_db_transaction: false,
            });
        }

        let caps = storage.caps();
        let mut db_txn = None;
        if opts.use_db_transaction && caps.transactions {
            db_txn = Some(storage.begin_transaction(&tx_id).await?);
            debug!("[{}] backend transaction opened", tx_id);
        }

        // Captured-but-unused reads would race the backend snapshot
        let capture = opts.capture_content.unwrap_or(true) && db_txn.is_none();

        let mut completed: Vec<CompletedOperation> = Vec::new();
        let mut failure: Option<Error> = None;

        for op in &plan {
            if let Some(timeout_ms) = opts.timeout_ms {
                let elapsed = start.elapsed().as_millis() as u64;
                if elapsed >= timeout_ms {
                    failure = Some(Error::TimedOut {
                        path: format!("transaction {tx_id}"),
                        waited_ms: elapsed,
                    });
                    break;
                }
            }

            debug!("[{}] {}", tx_id, op);
            if let Err(e) = self
                .apply_operation(storage, &caps, op, capture, &mut completed)
                .await
            {
                warn!("[{}] {} failed: {}", tx_id, op, e);
                failure = Some(e);
                break;
            }
        }

        let operation_duration_ms = start.elapsed().as_millis() as u64;

        let executed = completed.len();

        let Some(original) = failure else {
            if let Some(txn) = db_txn {
                if let Err(e) = txn.commit().await {
                    self.status = TxnStatus::RolledBack;
                    self.emit_metrics(&opts, &tx_id, executed, operation_duration_ms, start, None, true, Some(&e));
                    return Err(e);
                }
            }

            self.status = TxnStatus::Committed;
            let used_db = opts.use_db_transaction && caps.transactions;
            self.emit_metrics(&opts, &tx_id, executed, operation_duration_ms, start, None, used_db, None);
            info!(
                "[{}] committed: {} operation(s) in {}ms",
                tx_id,
                completed.len(),
                operation_duration_ms
            );
            return Ok(ExecReport {
                transaction_id: tx_id,
                operations_executed: completed.len(),
                duration_ms: start.elapsed().as_millis() as u64,
                dry_run: false,
                used_db_transaction: used_db,
            });
        };

        // Failure path
        if let Some(txn) = db_txn {
            // The backend undoes everything; skip application-level rollback
            if let Err(e) = txn.rollback().await {
                warn!("[{}] backend transaction rollback failed: {}", tx_id, e);
            }
            self.status = TxnStatus::RolledBack;
            self.emit_metrics(&opts, &tx_id, executed, operation_duration_ms, start, None, true, Some(&original));
            return Err(original);
        }

        info!(
            "[{}] rolling back {} completed operation(s) after: {}",
            tx_id,
            completed.len(),
            original
        );
        let summary = rollback_completed(storage, &completed).await;
        let rollback_duration_ms = summary.duration_ms;
        let rollback_errors = summary.errors();
        let rolled_back = summary.steps.len();
        self.last_rollback_summary = Some(summary);
        self.status = TxnStatus::RolledBack;

        self.emit_metrics(
            &opts,
            &tx_id,
            executed,
            operation_duration_ms,
            start,
            Some((rolled_back, rollback_duration_ms)),
            false,
            Some(&original),
        );

        if rollback_errors.is_empty() {
            Err(original)
        } else {
            Err(Error::aggregate(original, rollback_errors))
        }
    }

    /// Apply one operation, pushing undo records for everything that
    /// actually changed storage
    async fn apply_operation(
        &self,
        storage: &dyn Storage,
        caps: &StorageCaps,
        op: &Operation,
        capture: bool,
        completed: &mut Vec<CompletedOperation>,
    ) -> Result<()> {
        match op {
            Operation::Write { path, bytes, opts } => {
                let (existed, previous) = self.capture_previous(storage, caps, path, capture).await;
                storage.write_file(path, bytes, opts).await?;
                completed.push(CompletedOperation::write(path, existed, previous));
            }

            Operation::Unlink { path } => {
                if !caps.unlink {
                    debug!("storage lacks unlink, skipping {}", path);
                    return Ok(());
                }
                let (_, previous) = self.capture_previous(storage, caps, path, capture).await;
                storage.unlink(path).await?;
                completed.push(CompletedOperation::delete(path, previous));
            }

            Operation::Rm {
                path,
                force,
                recursive,
            } => {
                if !caps.rm {
                    debug!("storage lacks rm, skipping {}", path);
                    return Ok(());
                }
                let record = if *recursive {
                    CompletedOperation::remove_tree(path)
                } else {
                    let (_, previous) = self.capture_previous(storage, caps, path, capture).await;
                    CompletedOperation::delete(path, previous)
                };
                storage
                    .rm(
                        path,
                        &RmOptions {
                            force: *force,
                            recursive: *recursive,
                        },
                    )
                    .await?;
                completed.push(record);
            }

            Operation::Rmdir { path, recursive } => {
                if !caps.rmdir {
                    debug!("storage lacks rmdir, skipping {}", path);
                    return Ok(());
                }
                storage
                    .rmdir(
                        path,
                        &RmdirOptions {
                            recursive: *recursive,
                        },
                    )
                    .await?;
                completed.push(CompletedOperation::rmdir(path));
            }

            Operation::Rename {
                old,
                new,
                mkdirp,
                overwrite,
            } => {
                if !caps.rename {
                    debug!("storage lacks rename, skipping {} -> {}", old, new);
                    return Ok(());
                }
                if *mkdirp && is_cross_directory(old, new) {
                    self.ensure_parent(storage, caps, new, completed).await?;
                }
                storage.rename(old, new, *overwrite).await?;
                completed.push(CompletedOperation::rename(old, new));
            }

            Operation::Mkdir {
                path,
                recursive,
                mode,
            } => {
                if !caps.mkdir {
                    debug!("storage lacks mkdir, skipping {}", path);
                    return Ok(());
                }
                storage
                    .mkdir(
                        path,
                        &MkdirOptions {
                            recursive: *recursive,
                            mode: *mode,
                        },
                    )
                    .await?;
                completed.push(CompletedOperation::mkdir(path));
            }
        }
        Ok(())
    }

    /// Previous-content capture for writes and deletes
    ///
    /// Returns `(existed, previous_content)`. Without read support the
    /// target counts as absent, which is the documented weaker-rollback
    /// trade.
    async fn capture_previous(
        &self,
        storage: &dyn Storage,
        caps: &StorageCaps,
        path: &str,
        capture: bool,
    ) -> (bool, Option<Vec<u8>>) {
        if !capture || !caps.read_file {
            return (false, None);
        }

        if caps.exists {
            match storage.exists(path).await {
                Ok(true) => (true, storage.read_file(path).await.ok()),
                Ok(false) => (false, None),
                Err(_) => (false, None),
            }
        } else {
            match storage.read_file(path).await {
                Ok(bytes) => (true, Some(bytes)),
                Err(_) => (false, None),
            }
        }
    }

    /// Create the destination parent chain for a cross-directory move,
    /// recording each directory that did not exist so rollback removes it
    async fn ensure_parent(
        &self,
        storage: &dyn Storage,
        caps: &StorageCaps,
        new: &str,
        completed: &mut Vec<CompletedOperation>,
    ) -> Result<()> {
        if !caps.mkdir {
            return Ok(());
        }
        let parent = parent_of(new);
        if parent.is_empty() || parent == "/" {
            return Ok(());
        }

        let mut missing: Vec<String> = Vec::new();
        if caps.exists {
            for dir in ancestors_of(parent) {
                if !storage.exists(&dir).await.unwrap_or(false) {
                    missing.push(dir);
                }
            }
        } else {
            missing.push(parent.to_string());
        }

        if missing.is_empty() {
            return Ok(());
        }

        storage
            .mkdir(
                parent,
                &MkdirOptions {
                    recursive: true,
                    mode: None,
                },
            )
            .await?;

        // Top-down recording; reverse replay removes deepest first
        for dir in missing {
            completed.push(CompletedOperation::mkdir(dir));
        }
        Ok(())
    }

    fn check_pending(&self, action: &str) -> Result<()> {
        if self.status != TxnStatus::Pending {
            return Err(Error::Transaction(format!(
                "cannot {action} transaction in status {}",
                self.status
            )));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_metrics(
        &self,
        opts: &ExecOptions,
        tx_id: &str,
        executed: usize,
        operation_duration_ms: u64,
        start: Instant,
        rollback: Option<(usize, u64)>,
        used_db_transaction: bool,
        error: Option<&Error>,
    ) {
        let Some(callback) = &opts.on_metrics else {
            return;
        };

        callback(&TxnMetrics {
            transaction_id: tx_id.to_string(),
            status: self.status,
            operations_executed: executed,
            operations_rolled_back: rollback.map(|(count, _)| count),
            total_duration_ms: start.elapsed().as_millis() as u64,
            operation_duration_ms,
            rollback_duration_ms: rollback.map(|(_, duration)| duration),
            used_db_transaction,
            error_message: error.map(|e| e.to_string()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};

    /// Flat KV storage double with an operation log and failure injection
    #[derive(Default)]
    struct MockStorage {
        files: Mutex<HashMap<String, Vec<u8>>>,
        dirs: Mutex<HashSet<String>>,
        log: Mutex<Vec<String>>,
        /// Fail the nth write to a path: (path, nth 1-based, message)
        fail_write: Mutex<Option<(String, usize, String)>>,
        write_counts: Mutex<HashMap<String, usize>>,
        caps: StorageCaps,
        /// Events from backend transactions
        txn_events: Arc<Mutex<Vec<&'static str>>>,
    }

    impl MockStorage {
        fn full() -> Self {
            Self {
                caps: StorageCaps::full(),
                ..Default::default()
            }
        }

        fn write_only() -> Self {
            Self::default()
        }

        fn transactional() -> Self {
            let mut storage = Self::full();
            storage.caps.transactions = true;
            storage
        }

        fn fail_write_on(self, path: &str, message: &str) -> Self {
            self.fail_nth_write_on(path, 1, message)
        }

        fn fail_nth_write_on(self, path: &str, nth: usize, message: &str) -> Self {
            *self.fail_write.lock().unwrap() =
                Some((path.to_string(), nth, message.to_string()));
            self
        }

        fn file(&self, path: &str) -> Option<Vec<u8>> {
            self.files.lock().unwrap().get(path).cloned()
        }

        fn set_file(&self, path: &str, bytes: &[u8]) {
            self.files
                .lock()
                .unwrap()
                .insert(path.to_string(), bytes.to_vec());
        }

        fn has_dir(&self, path: &str) -> bool {
            self.dirs.lock().unwrap().contains(path)
        }

        fn log_entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn record(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }
    }

    struct MockTxn {
        events: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl StorageTransaction for MockTxn {
        async fn commit(self: Box<Self>) -> crate::error::Result<()> {
            self.events.lock().unwrap().push("commit");
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> crate::error::Result<()> {
            self.events.lock().unwrap().push("rollback");
            Ok(())
        }
    }

    #[async_trait]
    impl Storage for MockStorage {
        fn caps(&self) -> StorageCaps {
            self.caps
        }

        async fn write_file(
            &self,
            path: &str,
            bytes: &[u8],
            opts: &WriteOptions,
        ) -> crate::error::Result<u64> {
            let count = {
                let mut counts = self.write_counts.lock().unwrap();
                let count = counts.entry(path.to_string()).or_insert(0);
                *count += 1;
                *count
            };
            if let Some((fail_path, nth, message)) = self.fail_write.lock().unwrap().clone()
                && fail_path == path
                && count == nth
            {
                return Err(Error::Storage(message));
            }

            let mut files = self.files.lock().unwrap();
            if opts.flag == WriteFlag::Exclusive && files.contains_key(path) {
                return Err(Error::exists(path));
            }
            if opts.flag == WriteFlag::Append {
                let entry = files.entry(path.to_string()).or_default();
                entry.extend_from_slice(bytes);
            } else {
                files.insert(path.to_string(), bytes.to_vec());
            }
            self.record(format!("write {path}"));
            Ok(bytes.len() as u64)
        }

        async fn read_file(&self, path: &str) -> crate::error::Result<Vec<u8>> {
            self.record(format!("read {path}"));
            self.file(path).ok_or_else(|| Error::not_found(path))
        }

        async fn exists(&self, path: &str) -> crate::error::Result<bool> {
            Ok(self.files.lock().unwrap().contains_key(path)
                || self.dirs.lock().unwrap().contains(path))
        }

        async fn unlink(&self, path: &str) -> crate::error::Result<()> {
            self.record(format!("unlink {path}"));
            self.files
                .lock()
                .unwrap()
                .remove(path)
                .map(|_| ())
                .ok_or_else(|| Error::not_found(path))
        }

        async fn rm(&self, path: &str, opts: &RmOptions) -> crate::error::Result<()> {
            self.record(format!("rm {path}"));
            let removed = self.files.lock().unwrap().remove(path).is_some();
            let removed = if opts.recursive {
                let mut dirs = self.dirs.lock().unwrap();
                let had_dir = dirs.remove(path);
                let prefix = format!("{path}/");
                self.files
                    .lock()
                    .unwrap()
                    .retain(|k, _| !k.starts_with(&prefix));
                dirs.retain(|d| !d.starts_with(&prefix));
                removed || had_dir
            } else {
                removed
            };
            if !removed && !opts.force {
                return Err(Error::not_found(path));
            }
            Ok(())
        }

        async fn rmdir(&self, path: &str, _opts: &RmdirOptions) -> crate::error::Result<()> {
            self.record(format!("rmdir {path}"));
            if self.dirs.lock().unwrap().remove(path) {
                Ok(())
            } else {
                Err(Error::not_found(path))
            }
        }

        async fn rename(
            &self,
            from: &str,
            to: &str,
            overwrite: bool,
        ) -> crate::error::Result<()> {
            self.record(format!("rename {from} -> {to}"));
            let mut files = self.files.lock().unwrap();
            if !overwrite && files.contains_key(to) {
                return Err(Error::exists(to));
            }
            let bytes = files.remove(from).ok_or_else(|| Error::not_found(from))?;
            files.insert(to.to_string(), bytes);
            Ok(())
        }

        async fn mkdir(&self, path: &str, opts: &MkdirOptions) -> crate::error::Result<()> {
            self.record(format!("mkdir {path}"));
            let mut dirs = self.dirs.lock().unwrap();
            if opts.recursive {
                for dir in crate::fs::path::ancestors_of(path) {
                    dirs.insert(dir);
                }
            } else {
                dirs.insert(path.to_string());
            }
            Ok(())
        }

        async fn begin_transaction(
            &self,
            _id: &str,
        ) -> crate::error::Result<Box<dyn StorageTransaction>> {
            self.txn_events.lock().unwrap().push("begin");
            Ok(Box::new(MockTxn {
                events: Arc::clone(&self.txn_events),
            }))
        }
    }

    #[test]
    fn test_priority_ordering_is_stable() {
        let mut txn = Transaction::new();
        txn.rmdir("/d", false).unwrap();
        txn.write("/b", b"b".to_vec()).unwrap();
        txn.mkdir("/d2", false).unwrap();
        txn.rm("/x", false, false).unwrap();
        txn.rename("/b", "/c", false, false).unwrap();
        txn.write("/a", b"a".to_vec()).unwrap();
        txn.unlink("/y").unwrap();

        let plan = txn.ordered_operations();
        let kinds: Vec<&str> = plan.iter().map(|op| op.kind()).collect();
        assert_eq!(
            kinds,
            vec!["mkdir", "write", "write", "rename", "rm", "unlink", "rmdir"]
        );
        // Insertion order preserved within the write class
        assert_eq!(plan[1].path(), "/b");
        assert_eq!(plan[2].path(), "/a");
    }

    #[tokio::test]
    async fn test_multi_write_commits() {
        let storage = MockStorage::full();
        let mut txn = Transaction::new();
        txn.write("/a.txt", b"A".to_vec()).unwrap();
        txn.write("/b.txt", b"B".to_vec()).unwrap();
        txn.write("/c.txt", b"C".to_vec()).unwrap();

        let report = txn.execute(&storage, ExecOptions::new()).await.unwrap();

        assert_eq!(txn.status(), TxnStatus::Committed);
        assert_eq!(report.operations_executed, 3);
        assert!(!report.dry_run);
        assert_eq!(storage.file("/a.txt").unwrap(), b"A");
        assert_eq!(storage.file("/b.txt").unwrap(), b"B");
        assert_eq!(storage.file("/c.txt").unwrap(), b"C");

        let writes: Vec<String> = storage
            .log_entries()
            .into_iter()
            .filter(|e| e.starts_with("write"))
            .collect();
        assert_eq!(writes, vec!["write /a.txt", "write /b.txt", "write /c.txt"]);
        assert!(txn.last_rollback_summary().is_none());
    }

    #[tokio::test]
    async fn test_failure_rolls_back_everything() {
        let storage = MockStorage::full().fail_write_on("/b.txt", "Disk full");
        let mut txn = Transaction::new();
        txn.write("/a.txt", b"A".to_vec()).unwrap();
        txn.write("/b.txt", b"B".to_vec()).unwrap();
        txn.write("/c.txt", b"C".to_vec()).unwrap();

        let err = txn.execute(&storage, ExecOptions::new()).await.unwrap_err();

        assert!(err.to_string().contains("Disk full"));
        assert_eq!(txn.status(), TxnStatus::RolledBack);
        assert!(storage.file("/a.txt").is_none());
        assert!(storage.file("/b.txt").is_none());
        assert!(storage.file("/c.txt").is_none());

        let summary = txn.last_rollback_summary().unwrap();
        assert!(summary.succeeded());
        assert_eq!(summary.restored_count(), 1); // /a.txt deleted again
    }

    #[tokio::test]
    async fn test_overwrite_restored_on_rollback() {
        let storage = MockStorage::full().fail_write_on("/fail.txt", "boom");
        storage.set_file("/existing.txt", b"existing content");

        let mut txn = Transaction::new();
        txn.write("/existing.txt", b"overwritten".to_vec()).unwrap();
        txn.write("/fail.txt", b"x".to_vec()).unwrap();

        let err = txn.execute(&storage, ExecOptions::new()).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(storage.file("/existing.txt").unwrap(), b"existing content");
    }

    #[tokio::test]
    async fn test_double_execute_rejected() {
        let storage = MockStorage::full();
        let mut txn = Transaction::new();
        txn.write("/a", b"x".to_vec()).unwrap();
        txn.execute(&storage, ExecOptions::new()).await.unwrap();

        let err = txn.execute(&storage, ExecOptions::new()).await.unwrap_err();
        assert!(err.to_string().contains("committed"));

        let err = txn.write("/b", b"y".to_vec()).unwrap_err();
        assert!(err.to_string().contains("committed"));
    }

    #[tokio::test]
    async fn test_rolled_back_transaction_cannot_rerun() {
        let storage = MockStorage::full().fail_write_on("/a", "nope");
        let mut txn = Transaction::new();
        txn.write("/a", b"x".to_vec()).unwrap();
        txn.execute(&storage, ExecOptions::new()).await.unwrap_err();

        assert_eq!(txn.status(), TxnStatus::RolledBack);
        let err = txn.execute(&storage, ExecOptions::new()).await.unwrap_err();
        assert!(err.to_string().contains("rolled_back"));
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let storage = MockStorage::full();
        let mut txn = Transaction::new();
        txn.write("/a", b"x".to_vec()).unwrap();
        txn.mkdir("/d", true).unwrap();

        let report = txn
            .execute(&storage, ExecOptions::new().dry_run())
            .await
            .unwrap();

        assert!(report.dry_run);
        assert_eq!(report.operations_executed, 0);
        assert_eq!(txn.status(), TxnStatus::Pending);
        assert!(storage.log_entries().is_empty());

        // Still executable for real afterwards
        txn.execute(&storage, ExecOptions::new()).await.unwrap();
        assert_eq!(txn.status(), TxnStatus::Committed);
        assert!(storage.file("/a").is_some());
    }

    #[tokio::test]
    async fn test_timeout_before_first_dispatch() {
        let storage = MockStorage::full();
        let mut txn = Transaction::new();
        txn.write("/a", b"x".to_vec()).unwrap();

        let err = txn
            .execute(&storage, ExecOptions::new().with_timeout_ms(0))
            .await
            .unwrap_err();

        assert_eq!(err.code(), "ETIMEDOUT");
        assert_eq!(txn.status(), TxnStatus::RolledBack);
        assert!(storage.file("/a").is_none());
    }

    #[tokio::test]
    async fn test_capture_disabled_weakens_rollback() {
        let storage = MockStorage::full().fail_write_on("/fail", "boom");
        storage.set_file("/existing", b"old");

        let mut txn = Transaction::new();
        txn.write("/existing", b"new".to_vec()).unwrap();
        txn.write("/fail", b"x".to_vec()).unwrap();

        txn.execute(&storage, ExecOptions::new().without_capture())
            .await
            .unwrap_err();

        // Without capture the overwrite is undone by deletion, not restore
        assert!(storage.file("/existing").is_none());
        // And no capture reads were issued
        assert!(!storage.log_entries().iter().any(|e| e.starts_with("read")));
    }

    #[tokio::test]
    async fn test_db_transaction_commit() {
        let storage = MockStorage::transactional();
        let mut txn = Transaction::new();
        txn.write("/a", b"x".to_vec()).unwrap();

        let report = txn
            .execute(&storage, ExecOptions::new().with_db_transaction())
            .await
            .unwrap();

        assert!(report.used_db_transaction);
        assert_eq!(
            storage.txn_events.lock().unwrap().clone(),
            vec!["begin", "commit"]
        );
        // Content capture forced off while the backend transaction is active
        assert!(!storage.log_entries().iter().any(|e| e.starts_with("read")));
    }

    #[tokio::test]
    async fn test_db_transaction_rollback_skips_app_undo() {
        let storage = MockStorage::transactional().fail_write_on("/b", "boom");
        let mut txn = Transaction::new();
        txn.write("/a", b"x".to_vec()).unwrap();
        txn.write("/b", b"y".to_vec()).unwrap();

        let err = txn
            .execute(&storage, ExecOptions::new().with_db_transaction())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("boom"));
        assert_eq!(txn.status(), TxnStatus::RolledBack);
        assert_eq!(
            storage.txn_events.lock().unwrap().clone(),
            vec!["begin", "rollback"]
        );
        // The backend owns the undo: /a is still there in the mock because
        // its rollback is an event, not a state change, and the engine must
        // not have deleted it itself
        assert!(storage.file("/a").is_some());
        assert!(txn.last_rollback_summary().is_none());
    }

    #[tokio::test]
    async fn test_unsupported_operations_are_noops() {
        let storage = MockStorage::write_only();
        let mut txn = Transaction::new();
        txn.mkdir("/d", true).unwrap();
        txn.write("/a", b"x".to_vec()).unwrap();
        txn.rename("/a", "/b", false, false).unwrap();
        txn.rm("/a", false, false).unwrap();
        txn.rmdir("/d", false).unwrap();

        txn.execute(&storage, ExecOptions::new()).await.unwrap();

        assert_eq!(txn.status(), TxnStatus::Committed);
        // Only the write reached storage
        assert_eq!(storage.log_entries(), vec!["write /a"]);
        assert_eq!(storage.file("/a").unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_cross_directory_rename_mkdirp_rolls_back_dirs() {
        let storage = MockStorage::full();
        storage.set_file("/src/x", b"payload");
        storage.dirs.lock().unwrap().insert("/src".to_string());

        let mut txn = Transaction::new();
        txn.rename("/src/x", "/new/deep/x", true, false).unwrap();
        // Sorted after the rename (priority 3 via rm)... a write sorts
        // before rename, so use rm of a missing path to fail after it
        txn.rm("/poison-missing", false, false).unwrap();

        let err = txn.execute(&storage, ExecOptions::new()).await.unwrap_err();
        assert!(err.is_not_found());

        // Move undone, created directories removed deepest-first
        assert_eq!(storage.file("/src/x").unwrap(), b"payload");
        assert!(storage.file("/new/deep/x").is_none());
        assert!(!storage.has_dir("/new/deep"));
        assert!(!storage.has_dir("/new"));

        let log = storage.log_entries();
        let rmdir_order: Vec<&String> =
            log.iter().filter(|e| e.starts_with("rmdir")).collect();
        assert_eq!(rmdir_order, vec!["rmdir /new/deep", "rmdir /new"]);
    }

    #[tokio::test]
    async fn test_cross_directory_rename_success_keeps_dirs() {
        let storage = MockStorage::full();
        storage.set_file("/src/x", b"payload");

        let mut txn = Transaction::new();
        txn.rename("/src/x", "/new/deep/x", true, false).unwrap();
        txn.execute(&storage, ExecOptions::new()).await.unwrap();

        assert_eq!(storage.file("/new/deep/x").unwrap(), b"payload");
        assert!(storage.has_dir("/new"));
        assert!(storage.has_dir("/new/deep"));
        assert!(storage.file("/src/x").is_none());
    }

    #[tokio::test]
    async fn test_metrics_on_success() {
        let storage = MockStorage::full();
        let seen: Arc<Mutex<Vec<TxnMetrics>>> = Arc::new(Mutex::new(Vec::new()));

        let mut txn = Transaction::new();
        txn.write("/a", b"x".to_vec()).unwrap();
        txn.write("/b", b"y".to_vec()).unwrap();

        let sink = Arc::clone(&seen);
        txn.execute(
            &storage,
            ExecOptions::new()
                .with_transaction_id("txn-test-1")
                .on_metrics(move |m| sink.lock().unwrap().push(m.clone())),
        )
        .await
        .unwrap();

        let metrics = seen.lock().unwrap();
        assert_eq!(metrics.len(), 1);
        let m = &metrics[0];
        assert_eq!(m.transaction_id, "txn-test-1");
        assert_eq!(m.status, TxnStatus::Committed);
        assert_eq!(m.operations_executed, 2);
        assert!(m.operations_rolled_back.is_none());
        assert!(m.rollback_duration_ms.is_none());
        assert!(!m.used_db_transaction);
        assert!(m.error_message.is_none());
    }

    #[tokio::test]
    async fn test_metrics_on_failure() {
        let storage = MockStorage::full().fail_write_on("/b", "Disk full");
        let seen: Arc<Mutex<Vec<TxnMetrics>>> = Arc::new(Mutex::new(Vec::new()));

        let mut txn = Transaction::new();
        txn.write("/a", b"x".to_vec()).unwrap();
        txn.write("/b", b"y".to_vec()).unwrap();

        let sink = Arc::clone(&seen);
        txn.execute(
            &storage,
            ExecOptions::new().on_metrics(move |m| sink.lock().unwrap().push(m.clone())),
        )
        .await
        .unwrap_err();

        let metrics = seen.lock().unwrap();
        let m = &metrics[0];
        assert_eq!(m.status, TxnStatus::RolledBack);
        assert_eq!(m.operations_executed, 1);
        assert_eq!(m.operations_rolled_back, Some(1));
        assert!(m.rollback_duration_ms.is_some());
        assert!(m.error_message.as_ref().unwrap().contains("Disk full"));
    }

    #[tokio::test]
    async fn test_aggregate_when_rollback_fails() {
        // Forward: overwrite /existing (write #1), then fail /boom.
        // Rollback: restoring /existing is write #2, which we poison.
        let storage = MockStorage::full().fail_nth_write_on("/existing", 2, "restore failed");
        storage.set_file("/existing", b"old");

        let mut txn = Transaction::new();
        txn.write("/existing", b"new".to_vec()).unwrap();
        txn.rm("/boom-missing", false, false).unwrap();

        let err = txn.execute(&storage, ExecOptions::new()).await.unwrap_err();

        match &err {
            Error::Aggregate {
                original,
                rollback_errors,
            } => {
                assert!(original.is_not_found());
                assert_eq!(rollback_errors.len(), 1);
                assert!(rollback_errors[0].contains("restore failed"));
            }
            other => panic!("expected aggregate, got {other}"),
        }
        assert!(!txn.last_rollback_summary().unwrap().succeeded());
    }

    #[tokio::test]
    async fn test_atomic_swap() {
        let storage = MockStorage::full();
        storage.set_file("/app/config.json", b"old config");

        let mut txn = Transaction::atomic_swap("/app/config.json", b"new config".to_vec()).unwrap();
        txn.execute(&storage, ExecOptions::new()).await.unwrap();

        assert_eq!(storage.file("/app/config.json").unwrap(), b"new config");
        assert!(storage.file("/app/config.json.tmp").is_none());

        // write before rename before rm
        let log = storage.log_entries();
        let interesting: Vec<&String> = log
            .iter()
            .filter(|e| {
                e.starts_with("write /app") || e.starts_with("rename") || e.starts_with("rm")
            })
            .collect();
        assert_eq!(
            interesting,
            vec![
                "write /app/config.json.tmp",
                "rename /app/config.json.tmp -> /app/config.json",
                "rm /app/config.json.tmp",
            ]
        );
    }

    #[tokio::test]
    async fn test_atomic_lock_swap() {
        let storage = MockStorage::full();
        storage.set_file("/dest/config.json", b"{\"v\":0}");

        let mut txn =
            Transaction::atomic_lock_swap("/dest/config.json", b"{\"v\":2}".to_vec()).unwrap();
        txn.execute(&storage, ExecOptions::new()).await.unwrap();

        assert_eq!(storage.file("/dest/config.json").unwrap(), b"{\"v\":2}");
        assert!(storage.file("/dest/config.json.lock").is_none());
    }

    #[tokio::test]
    async fn test_atomic_lock_swap_excludes_competitors() {
        let storage = MockStorage::full();
        // A competing writer already staged its lock file
        storage.set_file("/cfg.lock", b"competitor");

        let mut txn = Transaction::atomic_lock_swap("/cfg", b"mine".to_vec()).unwrap();
        let err = txn.execute(&storage, ExecOptions::new()).await.unwrap_err();

        assert_eq!(err.code(), "EEXIST");
        assert_eq!(txn.status(), TxnStatus::RolledBack);
        assert!(storage.file("/cfg").is_none());
    }

    #[tokio::test]
    async fn test_write_all_and_delete_all() {
        let storage = MockStorage::full();

        let files = vec![
            ("/a".to_string(), b"1".to_vec()),
            ("/b".to_string(), b"2".to_vec()),
        ];
        let mut txn = Transaction::write_all(files).unwrap();
        txn.execute(&storage, ExecOptions::new()).await.unwrap();
        assert!(storage.file("/a").is_some());
        assert!(storage.file("/b").is_some());

        let mut txn =
            Transaction::delete_all(vec!["/a".to_string(), "/b".to_string()]).unwrap();
        txn.execute(&storage, ExecOptions::new()).await.unwrap();
        assert!(storage.file("/a").is_none());
        assert!(storage.file("/b").is_none());
    }

    #[tokio::test]
    async fn test_empty_transaction_commits() {
        let storage = MockStorage::full();
        let mut txn = Transaction::new();
        let report = txn.execute(&storage, ExecOptions::new()).await.unwrap();

        assert_eq!(report.operations_executed, 0);
        assert_eq!(txn.status(), TxnStatus::Committed);
    }

    #[tokio::test]
    async fn test_write_then_rm_same_path_reorders() {
        let storage = MockStorage::full();
        let mut txn = Transaction::new();
        // Queue order says write after rm would survive, but cross-class
        // priority puts the write first: the path ends up absent
        txn.write("/x", b"data".to_vec()).unwrap();
        txn.rm("/x", true, false).unwrap();

        txn.execute(&storage, ExecOptions::new()).await.unwrap();
        assert!(storage.file("/x").is_none());
    }
}
