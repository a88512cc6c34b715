//! Typed stores over the KV engine's tables.
//!
//! Each submodule wraps one table (or a pair) with its record schema: skels
//! in, skels out. Key allocation for every ID kind runs through the
//! `miscellaneous` table's monotonic counters.

use crate::error::FsResult;
use crate::key;
use crate::kv::tables;
use crate::trail::Trail;

pub mod changes;
pub mod copies;
pub mod locks;
pub mod nodes;
pub mod reps;
pub mod revisions;
pub mod strings;
pub mod txns;

/// Counter keys in the `miscellaneous` table.
pub mod counters {
    pub const NEXT_NODE_ID: &str = "next-node-id";
    pub const NEXT_COPY_ID: &str = "next-copy-id";
    pub const NEXT_TXN_ID: &str = "next-txn-id";
    pub const NEXT_REP_ID: &str = "next-rep-id";
    pub const NEXT_STRING_ID: &str = "next-string-id";
}

/// Hand out the counter's current key and advance it.
pub(crate) fn allocate_key(trail: &mut Trail<'_>, counter: &str) -> FsResult<String> {
    let current = trail
        .txn
        .get(tables::MISCELLANEOUS, counter.as_bytes())
        .map(|v| String::from_utf8_lossy(&v).into_owned())
        .unwrap_or_else(|| "0".to_string());
    let next = key::next_key(&current);
    trail
        .txn
        .put(tables::MISCELLANEOUS, counter.as_bytes(), next.into_bytes());
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::Database;
    use crate::trail::retry_txn;

    #[test]
    fn counters_are_monotonic_and_independent() {
        let db = Database::memory();
        let keys = retry_txn(&db, |trail| {
            let a = allocate_key(trail, counters::NEXT_NODE_ID)?;
            let b = allocate_key(trail, counters::NEXT_NODE_ID)?;
            let c = allocate_key(trail, counters::NEXT_COPY_ID)?;
            Ok((a, b, c))
        })
        .unwrap();
        assert_eq!(keys, ("0".to_string(), "1".to_string(), "0".to_string()));

        let later = retry_txn(&db, |trail| allocate_key(trail, counters::NEXT_NODE_ID)).unwrap();
        assert_eq!(later, "2");
    }
}
