//! Unified error model for the filesystem engine.
//!
//! Every layer (KV engine, stores, DAG, tree) speaks the same `Error` enum so
//! that callers can match on categories: `OutOfDate` and `Conflict` drive the
//! commit loop, `Retryable` drives the trail machinery and never escapes it.

use std::path::Path;

use thiserror::Error;

pub type FsResult<T> = Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("path not found: '{path}'")]
    NotFound { path: String },

    #[error("no entry named '{name}' in directory node '{id}'")]
    NoSuchEntry { id: String, name: String },

    #[error("no representation '{key}'")]
    NoSuchRepresentation { key: String },

    #[error("no string '{key}'")]
    NoSuchString { key: String },

    #[error("no transaction '{id}'")]
    NoSuchTransaction { id: String },

    #[error("no revision {rev}")]
    NoSuchRevision { rev: u64 },

    #[error("no copy record '{key}'")]
    NoSuchCopy { key: String },

    #[error("no node-revision '{id}'")]
    NoSuchNodeRevision { id: String },

    #[error("entry '{name}' already exists in '{path}'")]
    AlreadyExists { path: String, name: String },

    #[error("'{path}' is not a file")]
    NotFile { path: String },

    #[error("'{path}' is not a directory")]
    NotDirectory { path: String },

    #[error("attempted to write immutable node '{id}'")]
    NotMutable { id: String },

    #[error("transaction '{id}' is no longer mutable")]
    TxnNotMutable { id: String },

    #[error("the root directory cannot be deleted")]
    RootDir,

    #[error("'{name}' is not a single path component")]
    NotSinglePathComponent { name: String },

    #[error("root is not a transaction root")]
    NotTxnRoot,

    #[error("root is not a revision root")]
    NotRevisionRoot,

    #[error("merge conflict at '{path}'")]
    Conflict { path: String },

    #[error("transaction '{txn_id}' is out of date with respect to revision {youngest}")]
    OutOfDate { txn_id: String, youngest: u64 },

    #[error("checksum mismatch on '{context}': expected {expected}, actual {actual}")]
    ChecksumMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    #[error("corrupt filesystem record: {detail}")]
    Corrupt { detail: String },

    #[error("path '{path}' is already locked")]
    PathAlreadyLocked { path: String },

    #[error("lock on '{path}' is out of date with respect to revision {rev}")]
    OutOfDateLock { path: String, rev: u64 },

    #[error("token does not match lock on '{path}'")]
    BadLockToken { path: String },

    #[error("user '{user}' does not own the lock on '{path}'")]
    LockOwnerMismatch { user: String, path: String },

    #[error("operation requires a username")]
    NoUser,

    #[error("no lock on path '{path}'")]
    NotLocked { path: String },

    #[error("lock targets must be files: '{path}'")]
    NotFileLock { path: String },

    /// KV-engine deadlock or lock timeout. Handled inside `retry_txn`; never
    /// surfaced to callers of the public API.
    #[error("retryable storage failure: {detail}")]
    Retryable { detail: String },

    #[error("i/o failure during {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn not_found(path: impl Into<String>) -> Self {
        Error::NotFound { path: path.into() }
    }

    pub fn corrupt(detail: impl Into<String>) -> Self {
        Error::Corrupt { detail: detail.into() }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io { context: context.into(), source }
    }

    pub fn io_at(path: &Path, source: std::io::Error) -> Self {
        Error::Io { context: path.display().to_string(), source }
    }

    /// True for the error class the trail machinery retries transparently.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Retryable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::Retryable { detail: "lock timeout".into() }.is_retryable());
        assert!(!Error::not_found("/iota").is_retryable());
        assert!(!Error::Conflict { path: "/A/mu".into() }.is_retryable());
    }

    #[test]
    fn display_includes_context() {
        let e = Error::NoSuchEntry { id: "3.0.1".into(), name: "mu".into() };
        let s = e.to_string();
        assert!(s.contains("mu"));
        assert!(s.contains("3.0.1"));
    }
}
