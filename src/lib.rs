//! revfs: a transactional, content-addressed versioned filesystem engine.
//!
//! The logical model is a DAG of immutable node-revisions arranged so that
//! repeated snapshots of a directory tree share unchanged subtrees; the API
//! is a tree of paths, files, directories and properties. Writes happen in
//! transactions with optimistic concurrency: commit merges the txn against
//! the youngest revision (three-way, with the txn's base as ancestor) and
//! retries until it wins or conflicts. Old file texts are stored as
//! skip-delta chains for logarithmic reconstruction cost; history walks
//! follow predecessor links and copy records across renames and copies.
//!
//! Start at [`Fs`]: create or open a repository, take a [`Root`] for a
//! revision or a transaction, and work with paths.

pub mod dag;
pub mod delta;
pub mod error;
pub mod fs;
pub mod id;
pub mod key;
pub mod kv;
pub mod skel;
pub mod store;
pub mod trail;
pub mod tree;

pub use error::{Error, FsResult};
pub use fs::{AccessContext, Fs, Txn};
pub use id::{CopyId, NodeId, NodeRevId, RepId, Revision, StringId, TxnId};
pub use skel::Proplist;
pub use store::nodes::NodeKind;
pub use tree::history::NodeHistory;
pub use tree::{Dirent, Root};
