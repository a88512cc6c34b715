//! Trails: the unit of atomic work.
//!
//! A trail bundles one KV transaction with two closure stacks: *undo*
//! closures restore in-memory caches when the trail aborts (run in reverse
//! registration order), and *completion* closures run when the trail ends
//! either way (used to drop cached mutable node records so later reads
//! re-fetch). [`retry_txn`] runs a body inside a fresh trail, retrying
//! transparently on the KV engine's retryable failures; any other error
//! aborts the trail and propagates.

use tracing::debug;

use crate::error::FsResult;
use crate::kv::{Database, KvTxn};

pub struct Trail<'db> {
    pub txn: KvTxn<'db>,
    undo: Vec<Box<dyn FnOnce() + Send>>,
    completions: Vec<Box<dyn FnOnce() + Send>>,
}

impl<'db> Trail<'db> {
    fn new(txn: KvTxn<'db>) -> Self {
        Trail { txn, undo: Vec::new(), completions: Vec::new() }
    }

    /// Register a closure restoring in-memory state if this trail aborts.
    pub fn add_undo(&mut self, f: impl FnOnce() + Send + 'static) {
        self.undo.push(Box::new(f));
    }

    /// Register a closure to run when this trail completes, committed or not.
    pub fn on_completion(&mut self, f: impl FnOnce() + Send + 'static) {
        self.completions.push(Box::new(f));
    }

    fn finish_ok(self) -> FsResult<()> {
        let result = self.txn.commit();
        for f in self.completions {
            f();
        }
        result
    }

    fn finish_abort(self) {
        drop(self.txn);
        for f in self.undo.into_iter().rev() {
            f();
        }
        for f in self.completions {
            f();
        }
    }
}

/// Run `body` inside a trail. Retryable failures (KV deadlock, lock timeout)
/// abort the trail, run its undo stack, and start over with fresh state;
/// retries are unbounded. Every other outcome ends the trail once.
pub fn retry_txn<T>(
    db: &Database,
    mut body: impl FnMut(&mut Trail<'_>) -> FsResult<T>,
) -> FsResult<T> {
    loop {
        let txn = match db.begin() {
            Ok(txn) => txn,
            Err(e) if e.is_retryable() => {
                debug!(target: "revfs::trail", "retrying begin: {}", e);
                continue;
            }
            Err(e) => return Err(e),
        };
        let mut trail = Trail::new(txn);
        match body(&mut trail) {
            Ok(value) => {
                trail.finish_ok()?;
                return Ok(value);
            }
            Err(e) if e.is_retryable() => {
                debug!(target: "revfs::trail", "retrying trail: {}", e);
                trail.finish_abort();
            }
            Err(e) => {
                trail.finish_abort();
                return Err(e);
            }
        }
    }
}
