// src/lib.rs

//! Tierfs
//!
//! A POSIX-style file system over a tiered, content-addressable blob store:
//!
//! - Content addressing: files map to blobs identified by their SHA-256;
//!   identical content is stored once and shared by refcount
//! - Paged storage: blobs are chunked into fixed-size pages served from a
//!   hot backend, with LRU demotion (optionally compressed) to a cold one
//! - Atomic batches: mutations group into transactions that reorder, run
//!   sequentially, and roll back on failure from a captured undo log
//! - Advisory locks: exclusive-create lock files with staleness reclaim
//!   and atomic rename publication

pub mod backend;
pub mod blob;
pub mod codec;
mod error;
pub mod extent;
pub mod fs;
pub mod hash;
pub mod lock;
pub mod page;
pub mod tier;
pub mod txn;

pub use backend::{
    Backend, FsBackend, ListOptions, MemoryBackend, ObjectList, ObjectMeta, PutOptions,
    StoredObject, TieredBackend,
};
pub use blob::{BlobRecord, BlobStat, BlobStore};
pub use codec::{Codec, CompressionConfig, CompressionMeta, CompressionStats, Compressor};
pub use error::{Error, Result};
pub use extent::{build_extent, parse_extent, Extent};
pub use fs::{
    DirEntry, Encoding, EvictionMode, FileStat, FsConfig, FsConfigBuilder, NodeKind,
    ReaddirOptions, TieredFs, TieredFsBuilder,
};
pub use lock::{LockGuard, LockInfo, LockManager, LockOptions, LockRegistry};
pub use page::{
    ExtentLocation, PageId, PageIndex, PageMetadata, PageStore, Tier, DEFAULT_PAGE_SIZE,
};
pub use tier::{EvictionResult, PackResult, TierConfig, TierManager, TierMetrics};
pub use txn::{
    CompletedOperation, ExecOptions, ExecReport, MkdirOptions, Operation, RmOptions,
    RmdirOptions, RollbackStep, RollbackSummary, StepOutcome, Storage, StorageCaps,
    StorageTransaction, Transaction, TxnMetrics, TxnStatus, WriteFlag, WriteOptions,
};
