//! Write transactions over the engine's tables.

use std::collections::BTreeMap;

use parking_lot::MutexGuard;

use super::wal::WalEntry;
use super::{Database, Rows};
use crate::error::{Error, FsResult};

/// One buffered write: the key's new full row list, or removal.
#[derive(Clone, Debug)]
enum RowOp {
    Put(Rows),
    Delete,
}

/// A single-writer transaction: reads see committed state overlaid with the
/// transaction's own writes; writes are buffered and applied atomically by
/// [`KvTxn::commit`]. Dropping the transaction without committing discards
/// the buffer (abort).
pub struct KvTxn<'db> {
    db: &'db Database,
    _writer: MutexGuard<'db, ()>,
    writes: BTreeMap<(String, Vec<u8>), RowOp>,
}

impl<'db> KvTxn<'db> {
    pub(crate) fn new(db: &'db Database, writer: MutexGuard<'db, ()>) -> Self {
        KvTxn { db, _writer: writer, writes: BTreeMap::new() }
    }

    fn overlay(&self, table: &str, key: &[u8]) -> Option<&RowOp> {
        self.writes.get(&(table.to_string(), key.to_vec()))
    }

    /// All rows stored under `key`, or `None` if the key is absent.
    pub fn get_rows(&self, table: &str, key: &[u8]) -> Option<Rows> {
        match self.overlay(table, key) {
            Some(RowOp::Put(rows)) => Some(rows.clone()),
            Some(RowOp::Delete) => None,
            None => self
                .db
                .inner
                .tables
                .read()
                .get(table)
                .and_then(|t| t.get(key))
                .cloned(),
        }
    }

    /// The single row stored under `key` in a unique-key table.
    pub fn get(&self, table: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.get_rows(table, key).and_then(|rows| rows.into_iter().next())
    }

    pub fn exists(&self, table: &str, key: &[u8]) -> bool {
        self.get_rows(table, key).is_some()
    }

    /// Replace the value under `key` in a unique-key table.
    pub fn put(&mut self, table: &str, key: &[u8], value: Vec<u8>) {
        debug_assert!(!Database::is_dup_table(table), "put on dup table '{}'", table);
        self.writes
            .insert((table.to_string(), key.to_vec()), RowOp::Put(vec![value]));
    }

    /// Replace the full row list under `key`.
    pub fn put_rows(&mut self, table: &str, key: &[u8], rows: Rows) {
        self.writes.insert((table.to_string(), key.to_vec()), RowOp::Put(rows));
    }

    /// Append one row under `key` in a duplicate-key table.
    pub fn append_row(&mut self, table: &str, key: &[u8], row: Vec<u8>) {
        debug_assert!(Database::is_dup_table(table), "append on unique table '{}'", table);
        let mut rows = self.get_rows(table, key).unwrap_or_default();
        rows.push(row);
        self.put_rows(table, key, rows);
    }

    pub fn delete(&mut self, table: &str, key: &[u8]) {
        self.writes.insert((table.to_string(), key.to_vec()), RowOp::Delete);
    }

    /// Keys beginning with `prefix`, merged across committed state and the
    /// transaction's own writes, in byte order.
    pub fn scan_prefix(&self, table: &str, prefix: &[u8]) -> Vec<Vec<u8>> {
        let mut keys: Vec<Vec<u8>> = Vec::new();
        if let Some(t) = self.db.inner.tables.read().get(table) {
            for key in t.keys() {
                if key.starts_with(prefix) {
                    keys.push(key.clone());
                }
            }
        }
        for ((t, key), op) in &self.writes {
            if t != table || !key.starts_with(prefix) {
                continue;
            }
            match op {
                RowOp::Put(_) => {
                    if !keys.contains(key) {
                        keys.push(key.clone());
                    }
                }
                RowOp::Delete => keys.retain(|k| k != key),
            }
        }
        keys.sort();
        keys
    }

    /// The greatest key in `table`, if any.
    pub fn last_key(&self, table: &str) -> Option<Vec<u8>> {
        self.scan_prefix(table, b"").into_iter().next_back()
    }

    /// Apply the buffered writes to the shared tables and append them to the
    /// write-ahead log.
    pub fn commit(self) -> FsResult<()> {
        if self.writes.is_empty() {
            return Ok(());
        }
        let mut entries = Vec::with_capacity(self.writes.len());
        {
            let mut tables = self.db.inner.tables.write();
            for ((table, key), op) in &self.writes {
                let t = tables
                    .get_mut(table)
                    .ok_or_else(|| Error::corrupt(format!("unknown table '{}'", table)))?;
                match op {
                    RowOp::Put(rows) => {
                        t.insert(key.clone(), rows.clone());
                    }
                    RowOp::Delete => {
                        t.remove(key);
                    }
                }
                entries.push(WalEntry {
                    table: table.clone(),
                    key: key.clone(),
                    rows: match op {
                        RowOp::Put(rows) => Some(rows.clone()),
                        RowOp::Delete => None,
                    },
                });
            }
        }
        if let Some(writer) = self.db.inner.wal.lock().as_mut() {
            writer.append_batch(&entries)?;
        }
        Ok(())
    }
}
