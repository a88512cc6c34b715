//! The string store: append-only byte strings as lists of chunk rows.
//!
//! A string key maps to an ordered list of chunks in the duplicate-key
//! `strings` table. Appends may split large inputs; readers never learn the
//! chunking.

use super::{allocate_key, counters};
use crate::error::{Error, FsResult};
use crate::id::StringId;
use crate::kv::tables;
use crate::trail::Trail;

/// Upper bound on a single stored chunk row.
const MAX_CHUNK: usize = 128 * 1024;

fn require(trail: &Trail<'_>, id: &StringId) -> FsResult<Vec<Vec<u8>>> {
    trail
        .txn
        .get_rows(tables::STRINGS, id.as_str().as_bytes())
        .ok_or_else(|| Error::NoSuchString { key: id.as_str().to_string() })
}

/// Create an empty string under a freshly allocated key.
pub fn new(trail: &mut Trail<'_>) -> FsResult<StringId> {
    let key = allocate_key(trail, counters::NEXT_STRING_ID)?;
    trail
        .txn
        .put_rows(tables::STRINGS, key.as_bytes(), Vec::new());
    Ok(StringId::new(key))
}

pub fn append(trail: &mut Trail<'_>, id: &StringId, bytes: &[u8]) -> FsResult<()> {
    require(trail, id)?;
    for chunk in bytes.chunks(MAX_CHUNK) {
        trail
            .txn
            .append_row(tables::STRINGS, id.as_str().as_bytes(), chunk.to_vec());
    }
    Ok(())
}

pub fn size(trail: &Trail<'_>, id: &StringId) -> FsResult<u64> {
    Ok(require(trail, id)?.iter().map(|c| c.len() as u64).sum())
}

/// Read up to `len` bytes at `offset`; short reads happen only at the end.
pub fn read(trail: &Trail<'_>, id: &StringId, offset: u64, len: usize) -> FsResult<Vec<u8>> {
    let chunks = require(trail, id)?;
    let mut out = Vec::with_capacity(len.min(MAX_CHUNK));
    let mut skip = offset;
    for chunk in &chunks {
        let clen = chunk.len() as u64;
        if skip >= clen {
            skip -= clen;
            continue;
        }
        let start = skip as usize;
        skip = 0;
        let want = len - out.len();
        let end = chunk.len().min(start + want);
        out.extend_from_slice(&chunk[start..end]);
        if out.len() == len {
            break;
        }
    }
    Ok(out)
}

pub fn read_all(trail: &Trail<'_>, id: &StringId) -> FsResult<Vec<u8>> {
    let chunks = require(trail, id)?;
    let mut out = Vec::with_capacity(chunks.iter().map(Vec::len).sum());
    for chunk in chunks {
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

/// Truncate to zero length, keeping the key alive.
pub fn clear(trail: &mut Trail<'_>, id: &StringId) -> FsResult<()> {
    require(trail, id)?;
    trail
        .txn
        .put_rows(tables::STRINGS, id.as_str().as_bytes(), Vec::new());
    Ok(())
}

pub fn delete(trail: &mut Trail<'_>, id: &StringId) -> FsResult<()> {
    require(trail, id)?;
    trail.txn.delete(tables::STRINGS, id.as_str().as_bytes());
    Ok(())
}
