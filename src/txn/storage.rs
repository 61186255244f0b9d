// src/txn/storage.rs

//! Storage port consumed by the transaction engine
//!
//! A polymorphic handle over whatever actually holds files. Only
//! `write_file` is required; every other operation is a capability probed at
//! runtime. The engine treats an absent capability as a no-op, because some
//! backends genuinely have no directories to make or remove.

use crate::error::{Error, Result};
use crate::fs::config::Encoding;
use async_trait::async_trait;

/// How a write treats an existing file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteFlag {
    /// `w`: create or truncate
    #[default]
    Overwrite,
    /// `wx`: create exclusively, EEXIST when present
    Exclusive,
    /// `a`: append to existing content
    Append,
}

impl WriteFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overwrite => "w",
            Self::Exclusive => "wx",
            Self::Append => "a",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "w" => Ok(Self::Overwrite),
            "wx" => Ok(Self::Exclusive),
            "a" => Ok(Self::Append),
            other => Err(Error::invalid(format!("unknown write flag: {other}"))),
        }
    }
}

/// Options carried by a write operation
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub mode: Option<u32>,
    pub flag: WriteFlag,
    /// Hint about how the caller produced the bytes; not interpreted here
    pub encoding: Option<Encoding>,
}

impl WriteOptions {
    pub fn exclusive() -> Self {
        Self {
            flag: WriteFlag::Exclusive,
            ..Self::default()
        }
    }

    pub fn append() -> Self {
        Self {
            flag: WriteFlag::Append,
            ..Self::default()
        }
    }
}

/// Options for `rm`
#[derive(Debug, Clone, Copy, Default)]
pub struct RmOptions {
    /// Missing targets are not an error
    pub force: bool,
    /// Remove directory trees
    pub recursive: bool,
}

/// Options for `rmdir`
#[derive(Debug, Clone, Copy, Default)]
pub struct RmdirOptions {
    pub recursive: bool,
}

/// Options for `mkdir`
#[derive(Debug, Clone, Copy, Default)]
pub struct MkdirOptions {
    /// Create missing parents; existing directories are not an error
    pub recursive: bool,
    pub mode: Option<u32>,
}

/// What a storage handle can do beyond `write_file`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageCaps {
    pub read_file: bool,
    pub exists: bool,
    pub unlink: bool,
    pub rm: bool,
    pub rmdir: bool,
    pub rename: bool,
    pub mkdir: bool,
    /// Legacy single-file delete
    pub delete_file: bool,
    /// `begin_transaction` is available
    pub transactions: bool,
}

impl StorageCaps {
    /// Everything except backend transactions
    pub fn full() -> Self {
        Self {
            read_file: true,
            exists: true,
            unlink: true,
            rm: true,
            rmdir: true,
            rename: true,
            mkdir: true,
            delete_file: true,
            transactions: false,
        }
    }
}

/// A backend-level transaction handle
#[async_trait]
pub trait StorageTransaction: Send + Sync {
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// The port the transaction engine executes against
///
/// Every method is a suspension point. Optional operations default to
/// `Unsupported`, matching the capability flags.
#[async_trait]
pub trait Storage: Send + Sync {
    fn caps(&self) -> StorageCaps;

    /// Write a file, honoring the flag semantics; returns bytes written
    async fn write_file(&self, path: &str, bytes: &[u8], opts: &WriteOptions) -> Result<u64>;

    async fn read_file(&self, _path: &str) -> Result<Vec<u8>> {
        Err(Error::Unsupported("read_file"))
    }

    async fn exists(&self, _path: &str) -> Result<bool> {
        Err(Error::Unsupported("exists"))
    }

    async fn unlink(&self, _path: &str) -> Result<()> {
        Err(Error::Unsupported("unlink"))
    }

    async fn rm(&self, _path: &str, _opts: &RmOptions) -> Result<()> {
        Err(Error::Unsupported("rm"))
    }

    async fn rmdir(&self, _path: &str, _opts: &RmdirOptions) -> Result<()> {
        Err(Error::Unsupported("rmdir"))
    }

    /// Move `from` onto `to`; with `overwrite` an existing target is replaced
    async fn rename(&self, _from: &str, _to: &str, _overwrite: bool) -> Result<()> {
        Err(Error::Unsupported("rename"))
    }

    async fn mkdir(&self, _path: &str, _opts: &MkdirOptions) -> Result<()> {
        Err(Error::Unsupported("mkdir"))
    }

    /// Legacy delete used only when neither `rm` nor `unlink` is available
    async fn delete_file(&self, _path: &str) -> Result<()> {
        Err(Error::Unsupported("delete_file"))
    }

    /// Open a backend transaction correlated by `id`
    async fn begin_transaction(&self, _id: &str) -> Result<Box<dyn StorageTransaction>> {
        Err(Error::Unsupported("begin_transaction"))
    }
}
