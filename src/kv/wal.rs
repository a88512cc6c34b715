//! Durability: snapshot + write-ahead log.
//!
//! The snapshot (`snapshot.bin`) is the bincode image of every table,
//! written atomically via a temp file and rename. The WAL (`wal.log`) is a
//! sequence of committed batches, each framed as
//! `len: u32le | crc32: u32le | bincode bytes`. A torn tail (partial frame or
//! checksum mismatch) ends replay silently; anything before it is applied.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{Rows, TableData};
use crate::error::{Error, FsResult};

const SNAPSHOT_FILE: &str = "snapshot.bin";
const WAL_FILE: &str = "wal.log";

#[derive(Serialize, Deserialize)]
pub(crate) struct WalEntry {
    pub table: String,
    pub key: Vec<u8>,
    /// The key's new full row list, or `None` for a delete.
    pub rows: Option<Rows>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    tables: BTreeMap<String, TableData>,
}

pub(crate) fn write_snapshot(dir: &Path, tables: &BTreeMap<String, TableData>) -> FsResult<()> {
    let snap = Snapshot { version: 1, tables: tables.clone() };
    let bytes = bincode::serialize(&snap)
        .map_err(|e| Error::corrupt(format!("snapshot encode: {}", e)))?;
    let path = dir.join(SNAPSHOT_FILE);
    let tmp = path.with_extension("bin.tmp");
    std::fs::write(&tmp, &bytes).map_err(|e| Error::io_at(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| Error::io_at(&path, e))?;
    Ok(())
}

pub(crate) fn read_snapshot(dir: &Path) -> FsResult<BTreeMap<String, TableData>> {
    let path = dir.join(SNAPSHOT_FILE);
    let bytes = std::fs::read(&path).map_err(|e| Error::io_at(&path, e))?;
    let snap: Snapshot = bincode::deserialize(&bytes)
        .map_err(|e| Error::corrupt(format!("snapshot decode: {}", e)))?;
    if snap.version != 1 {
        return Err(Error::corrupt(format!("unknown snapshot version {}", snap.version)));
    }
    Ok(snap.tables)
}

/// Apply every intact WAL batch to `tables`, returning the batch count.
pub(crate) fn replay(dir: &Path, tables: &mut BTreeMap<String, TableData>) -> FsResult<usize> {
    let path = dir.join(WAL_FILE);
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(Error::io_at(&path, e)),
    };
    let mut pos = 0usize;
    let mut batches = 0usize;
    while pos + 8 <= bytes.len() {
        let len = u32::from_le_bytes(bytes[pos..pos + 4].try_into().expect("4 bytes")) as usize;
        let crc = u32::from_le_bytes(bytes[pos + 4..pos + 8].try_into().expect("4 bytes"));
        if pos + 8 + len > bytes.len() {
            break; // torn tail
        }
        let body = &bytes[pos + 8..pos + 8 + len];
        if crc32fast::hash(body) != crc {
            break;
        }
        let entries: Vec<WalEntry> = bincode::deserialize(body)
            .map_err(|e| Error::corrupt(format!("wal batch decode: {}", e)))?;
        for entry in entries {
            let t = tables
                .get_mut(&entry.table)
                .ok_or_else(|| Error::corrupt(format!("wal names unknown table '{}'", entry.table)))?;
            match entry.rows {
                Some(rows) => {
                    t.insert(entry.key, rows);
                }
                None => {
                    t.remove(&entry.key);
                }
            }
        }
        pos += 8 + len;
        batches += 1;
    }
    Ok(batches)
}

pub(crate) struct WalWriter {
    file: File,
    path: PathBuf,
}

impl WalWriter {
    /// Open the WAL for appending, truncating any previous contents (the
    /// caller has just folded them into the snapshot).
    pub fn create(dir: &Path) -> FsResult<WalWriter> {
        let path = dir.join(WAL_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::io_at(&path, e))?;
        Ok(WalWriter { file, path })
    }

    pub fn append_batch(&mut self, entries: &[WalEntry]) -> FsResult<()> {
        let body = bincode::serialize(entries)
            .map_err(|e| Error::corrupt(format!("wal batch encode: {}", e)))?;
        let mut frame = Vec::with_capacity(body.len() + 8);
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        frame.extend_from_slice(&body);
        self.file
            .write_all(&frame)
            .and_then(|_| self.file.sync_data())
            .map_err(|e| Error::io_at(&self.path, e))
    }
}
