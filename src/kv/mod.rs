//! The backing key-value engine.
//!
//! A [`Database`] is a set of named ordered tables. Most tables are
//! unique-key; `strings` and `changes` are duplicate-key tables where a key
//! maps to an ordered list of rows (string chunks, change records). Writes
//! happen through a single-writer [`KvTxn`]: the transaction holds the
//! database writer lock for its lifetime, buffers its writes, and applies
//! them atomically on commit, appending one crc32-framed WAL batch. Readers
//! of committed state never block.
//!
//! Failing to obtain the writer lock within the lock timeout surfaces as the
//! Retryable error category, which the trail machinery retries transparently.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{Error, FsResult};

mod txn;
mod wal;

pub use txn::KvTxn;

/// Fixed table names.
pub mod tables {
    pub const NODES: &str = "nodes";
    pub const REPRESENTATIONS: &str = "representations";
    pub const STRINGS: &str = "strings";
    pub const REVISIONS: &str = "revisions";
    pub const TRANSACTIONS: &str = "transactions";
    pub const COPIES: &str = "copies";
    pub const CHANGES: &str = "changes";
    pub const LOCKS: &str = "locks";
    pub const LOCK_TOKENS: &str = "lock-tokens";
    pub const UUIDS: &str = "uuids";
    pub const MISCELLANEOUS: &str = "miscellaneous";

    pub const ALL: &[&str] = &[
        NODES,
        REPRESENTATIONS,
        STRINGS,
        REVISIONS,
        TRANSACTIONS,
        COPIES,
        CHANGES,
        LOCKS,
        LOCK_TOKENS,
        UUIDS,
        MISCELLANEOUS,
    ];

    /// Tables where one key holds an ordered list of rows.
    pub const DUPLICATE_KEY: &[&str] = &[STRINGS, CHANGES];
}

/// How long a transaction waits for the writer lock before reporting the
/// retryable lock-timeout class.
const WRITER_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) type Rows = Vec<Vec<u8>>;
pub(crate) type TableData = BTreeMap<Vec<u8>, Rows>;

pub(crate) struct Inner {
    pub(crate) tables: RwLock<BTreeMap<String, TableData>>,
    /// Single-writer gate; held for the lifetime of each `KvTxn`.
    pub(crate) writer: Mutex<()>,
    /// Append-only log of committed batches, absent for in-memory databases.
    pub(crate) wal: Mutex<Option<wal::WalWriter>>,
    pub(crate) dir: Option<PathBuf>,
}

#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Arc<Inner>,
}

fn empty_tables() -> BTreeMap<String, TableData> {
    tables::ALL
        .iter()
        .map(|name| (name.to_string(), TableData::new()))
        .collect()
}

impl Database {
    /// A purely in-memory database. Used by unit tests and scratch work.
    pub fn memory() -> Database {
        Database {
            inner: Arc::new(Inner {
                tables: RwLock::new(empty_tables()),
                writer: Mutex::new(()),
                wal: Mutex::new(None),
                dir: None,
            }),
        }
    }

    /// Create the database directory, its empty tables, the snapshot and the
    /// write-ahead log.
    pub fn create(dir: impl AsRef<Path>) -> FsResult<Database> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| Error::io_at(&dir, e))?;
        let tables = empty_tables();
        wal::write_snapshot(&dir, &tables)?;
        let writer = wal::WalWriter::create(&dir)?;
        debug!(target: "revfs::kv", "created database at '{}'", dir.display());
        Ok(Database {
            inner: Arc::new(Inner {
                tables: RwLock::new(tables),
                writer: Mutex::new(()),
                wal: Mutex::new(Some(writer)),
                dir: Some(dir),
            }),
        })
    }

    /// Open an existing database: load the snapshot, replay the WAL, then
    /// checkpoint (rewrite the snapshot and truncate the log).
    pub fn open(dir: impl AsRef<Path>) -> FsResult<Database> {
        let dir = dir.as_ref().to_path_buf();
        let mut tables = wal::read_snapshot(&dir)?;
        let replayed = wal::replay(&dir, &mut tables)?;
        // Checkpoint so the log does not grow across sessions.
        wal::write_snapshot(&dir, &tables)?;
        let writer = wal::WalWriter::create(&dir)?;
        debug!(
            target: "revfs::kv",
            "opened database at '{}' ({} batches replayed)",
            dir.display(),
            replayed
        );
        Ok(Database {
            inner: Arc::new(Inner {
                tables: RwLock::new(tables),
                writer: Mutex::new(()),
                wal: Mutex::new(Some(writer)),
                dir: Some(dir),
            }),
        })
    }

    /// Begin a write transaction. Blocks for up to the lock timeout waiting
    /// for the writer lock; timing out reports the retryable class.
    pub fn begin(&self) -> FsResult<KvTxn<'_>> {
        let guard = self
            .inner
            .writer
            .try_lock_for(WRITER_LOCK_TIMEOUT)
            .ok_or_else(|| Error::Retryable {
                detail: "writer lock timeout".to_string(),
            })?;
        Ok(KvTxn::new(self, guard))
    }

    pub(crate) fn is_dup_table(name: &str) -> bool {
        tables::DUPLICATE_KEY.contains(&name)
    }
}

#[cfg(test)]
#[path = "kv_tests.rs"]
mod kv_tests;
