// src/error.rs

//! Crate-wide error type with errno-style kinds
//!
//! Backend and storage errors keep their kind as they propagate; `code()`
//! yields the errno token for callers that match on it rather than on the
//! variant.

use thiserror::Error;

/// Convenience result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the file system, stores, and transaction engine
#[derive(Debug, Error)]
pub enum Error {
    /// Path or key does not exist (ENOENT)
    #[error("{0}: no such file or directory")]
    NotFound(String),

    /// Creation collided with an existing entry (EEXIST)
    #[error("{0}: file exists")]
    Exists(String),

    /// Operation expected a file but found a directory (EISDIR)
    #[error("{0}: is a directory")]
    IsDirectory(String),

    /// Operation expected a directory but found a file (ENOTDIR)
    #[error("{0}: not a directory")]
    NotADirectory(String),

    /// rmdir of a non-empty directory without recursive (ENOTEMPTY)
    #[error("{0}: directory not empty")]
    NotEmpty(String),

    /// Permission denied by the backing store (EACCES)
    #[error("{0}: permission denied")]
    Permission(String),

    /// Configuration or validation failure (EINVAL)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Mutation attempted on a read-only mount (EROFS)
    #[error("read-only file system: {0}")]
    ReadOnly(String),

    /// Rename spans an unsupported boundary (EXDEV)
    #[error("{0}: cross-device rename not supported")]
    CrossDevice(String),

    /// Lock held by another holder (EWOULDBLOCK)
    #[error("{path}: lock held by {holder}")]
    WouldBlock { path: String, holder: String },

    /// Lock wait expired (ETIMEDOUT)
    #[error("{path}: lock acquisition timed out after {waited_ms}ms")]
    TimedOut { path: String, waited_ms: u64 },

    /// Stale lock detected but not broken (ESTALE)
    #[error("{path}: stale lock, held for {age_ms}ms")]
    Stale { path: String, age_ms: u64 },

    /// The port does not implement the requested operation
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// Checksum mismatch, bad magic, or truncated frame
    #[error("corrupted data: {0}")]
    Corrupted(String),

    /// Transaction precondition or bookkeeping failure
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Error reported by a storage backend, message preserved verbatim
    #[error("{0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Original operation error joined by one or more rollback errors.
    ///
    /// The original error is always the first member; rollback errors follow
    /// in the order the steps were rolled back.
    #[error("{} ({} rollback error(s): {})", .original, .rollback_errors.len(), .rollback_errors.join("; "))]
    Aggregate {
        original: Box<Error>,
        rollback_errors: Vec<String>,
    },
}

impl Error {
    /// The errno token for this error kind
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "ENOENT",
            Self::Exists(_) => "EEXIST",
            Self::IsDirectory(_) => "EISDIR",
            Self::NotADirectory(_) => "ENOTDIR",
            Self::NotEmpty(_) => "ENOTEMPTY",
            Self::Permission(_) => "EACCES",
            Self::InvalidArgument(_) => "EINVAL",
            Self::ReadOnly(_) => "EROFS",
            Self::CrossDevice(_) => "EXDEV",
            Self::WouldBlock { .. } => "EWOULDBLOCK",
            Self::TimedOut { .. } => "ETIMEDOUT",
            Self::Stale { .. } => "ESTALE",
            Self::Unsupported(_) => "ENOSYS",
            Self::Corrupted(_) => "EBADMSG",
            Self::Transaction(_) => "EINVAL",
            Self::Storage(_) => "EIO",
            Self::Io(_) => "EIO",
            Self::Aggregate { original, .. } => original.code(),
        }
    }

    /// True if this is the ENOENT kind, on either side of an aggregate
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Aggregate { original, .. } => original.is_not_found(),
            _ => false,
        }
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    pub fn exists(path: impl Into<String>) -> Self {
        Self::Exists(path.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Wrap an original error with the rollback errors that followed it
    pub fn aggregate(original: Error, rollback_errors: Vec<String>) -> Self {
        Self::Aggregate {
            original: Box::new(original),
            rollback_errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::not_found("/a").code(), "ENOENT");
        assert_eq!(Error::exists("/a").code(), "EEXIST");
        assert_eq!(Error::ReadOnly("/".into()).code(), "EROFS");
        assert_eq!(
            Error::WouldBlock {
                path: "/a".into(),
                holder: "x".into()
            }
            .code(),
            "EWOULDBLOCK"
        );
    }

    #[test]
    fn test_aggregate_keeps_original_message() {
        let original = Error::Storage("Disk full".to_string());
        let agg = Error::aggregate(original, vec!["restore of /a failed".to_string()]);

        let msg = agg.to_string();
        assert!(msg.contains("Disk full"));
        assert!(msg.contains("restore of /a failed"));
        assert_eq!(agg.code(), "EIO");
    }

    #[test]
    fn test_aggregate_code_follows_original() {
        let agg = Error::aggregate(Error::not_found("/gone"), vec!["boom".to_string()]);
        assert_eq!(agg.code(), "ENOENT");
        assert!(agg.is_not_found());
    }
}
