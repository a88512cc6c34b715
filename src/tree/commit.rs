//! Commit: the three-way bubble-up merge and the optimistic retry loop.
//!
//! A txn commits against the *youngest* revision. If other commits landed
//! since the txn's base, the changes between base and youngest are merged
//! into the txn tree first (the txn tree is the only mutable one of the
//! three), the txn's base is ratcheted forward, and the commit is retried
//! until it wins the race or a real conflict surfaces.

use tracing::debug;

use crate::dag::{self, DagNode};
use crate::error::{Error, FsResult};
use crate::fs::Fs;
use crate::id::{NodeRevId, Revision, TxnId};
use crate::store::changes::{self, ChangeKind, ChangeRecord};
use crate::store::nodes;
use crate::store::{revisions, txns};
use crate::trail::{retry_txn, Trail};
use crate::tree::join_path;

/// Commit `txn_id`, merging against newer revisions as needed. Returns the
/// new revision number; `Conflict` carries the losing path.
pub(crate) fn commit_txn(fs: &Fs, txn_id: &TxnId) -> FsResult<Revision> {
    loop {
        // The current youngest revision, in a short trail of its own so the
        // revisions table is not held during the merge.
        let youngish = retry_txn(&fs.db, |trail| revisions::youngest_rev(trail))?;
        let youngish_root_id = retry_txn(&fs.db, |trail| revisions::rev_get_root(trail, youngish))?;

        retry_txn(&fs.db, |trail| merge_body(trail, txn_id, &youngish_root_id))?;

        match retry_txn(&fs.db, |trail| dag::commit_txn(trail, txn_id)) {
            Ok(rev) => return Ok(rev),
            Err(Error::OutOfDate { youngest, .. }) if youngest != youngish => {
                // Someone committed mid-merge; ratchet forward and try again.
                debug!(
                    target: "revfs::tree",
                    "txn {} lost the race to revision {}, re-merging", txn_id, youngest
                );
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Merge the youngest root into the txn: fast-forward when the txn has no
/// changes of its own, otherwise run the three-way merge with the txn's base
/// as ancestor, then ratchet the base forward to the youngest root.
fn merge_body(trail: &mut Trail<'_>, txn_id: &TxnId, source_id: &NodeRevId) -> FsResult<()> {
    let txn_root = dag::txn_root(trail, txn_id)?;
    let ancestor = dag::txn_base_root(trail, txn_id)?;
    let source = dag::get_node(trail, source_id)?;

    if ancestor.id == source.id {
        return Ok(());
    }
    if ancestor.id == txn_root.id {
        // No local changes: the txn becomes a repeat of source.
        txns::set_txn_base(trail, txn_id, source_id)?;
        txns::set_txn_root(trail, txn_id, source_id)?;
        return Ok(());
    }

    merge(trail, "/", &txn_root, &source, &ancestor, txn_id)?;
    update_ancestry(trail, &source, &txn_root.id, "/", txn_id)?;
    txns::set_txn_base(trail, txn_id, source_id)?;
    Ok(())
}

/// Record that `target` (which must be mutable in the txn) has absorbed the
/// history up through `source`: predecessor <- source, count <- source's + 1.
fn update_ancestry(
    trail: &mut Trail<'_>,
    source: &DagNode,
    target_id: &NodeRevId,
    target_path: &str,
    txn_id: &TxnId,
) -> FsResult<()> {
    if target_id.txn_id() != txn_id {
        return Err(Error::NotMutable { id: format!("{} at '{}'", target_id, target_path) });
    }
    let mut rec = nodes::get_node_revision(trail, target_id)?;
    rec.predecessor = Some(source.id.clone());
    rec.predecessor_count =
        if source.rec.predecessor_count < 0 { -1 } else { source.rec.predecessor_count + 1 };
    nodes::put_node_revision(trail, target_id, &rec);
    Ok(())
}

/// Is `a` an ancestor of `b` (or `b` itself)? Walks `b`'s predecessor chain.
fn is_ancestor(trail: &Trail<'_>, a: &NodeRevId, b: &NodeRevId) -> FsResult<bool> {
    let mut current = b.clone();
    loop {
        if &current == a {
            return Ok(true);
        }
        match nodes::get_node_revision(trail, &current)?.predecessor {
            None => return Ok(false),
            Some(pred) => current = pred,
        }
    }
}

fn conflict(path: String) -> Error {
    Error::Conflict { path }
}

/// The three-way directory merge. `target` is mutable in `txn_id`; `source`
/// is the youngest root's corresponding node; `ancestor` is the txn base's.
/// On success target has absorbed source's changes; unreconcilable
/// differences surface as `Conflict` with the offending path.
pub(crate) fn merge(
    trail: &mut Trail<'_>,
    target_path: &str,
    target: &DagNode,
    source: &DagNode,
    ancestor: &DagNode,
    txn_id: &TxnId,
) -> FsResult<()> {
    if target.id == ancestor.id {
        return Err(Error::corrupt(format!(
            "bad merge: target '{}' is identical to the ancestor",
            target_path
        )));
    }
    // No remote change, or the same change on both sides.
    if ancestor.id == source.id || source.id == target.id {
        return Ok(());
    }

    if !source.is_dir() || !target.is_dir() || !ancestor.is_dir() {
        return Err(conflict(target_path.to_string()));
    }

    // Property changes land only on up-to-date directories: any prop-key
    // drift between target and ancestor, or source and ancestor, conflicts
    // at this directory.
    {
        let t_rec = nodes::get_node_revision(trail, &target.id)?;
        let a_rec = nodes::get_node_revision(trail, &ancestor.id)?;
        let s_rec = nodes::get_node_revision(trail, &source.id)?;
        if t_rec.prop_key != a_rec.prop_key || s_rec.prop_key != a_rec.prop_key {
            return Err(conflict(target_path.to_string()));
        }
    }

    let mut s_entries = dag::dir_entries(trail, source)?;
    let mut t_entries = dag::dir_entries(trail, target)?;
    let a_entries = dag::dir_entries(trail, ancestor)?;

    for (name, a_id) in &a_entries {
        let s_id = s_entries.get(name).cloned();
        let t_id = t_entries.get(name).cloned();
        match (s_id, t_id) {
            // In all three.
            (Some(s_id), Some(t_id)) => {
                if &s_id == a_id {
                    // Source did not change the entry.
                } else if t_id == *a_id
                    || (is_ancestor(trail, a_id, &t_id)? && is_ancestor(trail, &t_id, &s_id)?)
                {
                    // Target untouched (or between ancestor and source):
                    // target takes source.
                    dag::set_entry(trail, &target.id, name, &s_id, txn_id)?;
                } else if is_ancestor(trail, &s_id, &t_id)? {
                    // Target already descends from source; leave it.
                } else {
                    // Both sides changed it independently: recurse, dirs
                    // only.
                    let s_node = dag::get_node(trail, &s_id)?;
                    let t_node = dag::get_node(trail, &t_id)?;
                    let a_node = dag::get_node(trail, a_id)?;
                    let child_path = join_path(target_path, name);
                    if !s_node.is_dir() || !t_node.is_dir() || !a_node.is_dir() {
                        return Err(conflict(child_path));
                    }
                    merge(trail, &child_path, &t_node, &s_node, &a_node, txn_id)?;
                    update_ancestry(trail, &s_node, &t_id, &child_path, txn_id)?;
                }
            }
            // In source only: its removal from target stands unless source
            // also changed it.
            (Some(s_id), None) => {
                if &s_id != a_id {
                    return Err(conflict(join_path(target_path, name)));
                }
            }
            // In target only: honor source's deletion when target left the
            // entry alone; a changed-but-related entry conflicts; an
            // unrelated one is a double delete.
            (None, Some(t_id)) => {
                if t_id == *a_id {
                    dag::delete_entry(trail, &target.id, name, txn_id)?;
                    t_entries.remove(name);
                } else if t_id.same_node(a_id) {
                    return Err(conflict(join_path(target_path, name)));
                } else {
                    undelete_change(trail, txn_id, &join_path(target_path, name));
                }
            }
            // In neither: a double delete; un-record it so this txn is not
            // credited with the removal.
            (None, None) => {
                undelete_change(trail, txn_id, &join_path(target_path, name));
            }
        }
        s_entries.remove(name);
    }

    // Entries in source but not ancestor.
    for (name, s_id) in &s_entries {
        match t_entries.get(name) {
            None => {
                dag::set_entry(trail, &target.id, name, s_id, txn_id)?;
            }
            Some(t_id) => {
                if !is_ancestor(trail, s_id, t_id)? {
                    return Err(conflict(join_path(target_path, name)));
                }
                // Twin add of the same line of history; target stays.
            }
        }
    }

    // Entries only in target are non-conflicting additions; leave them.
    Ok(())
}

/// Append a reset row cancelling any change recorded for `path` in the txn.
fn undelete_change(trail: &mut Trail<'_>, txn_id: &TxnId, path: &str) {
    changes::add_change(
        trail,
        txn_id,
        &ChangeRecord {
            path: path.to_string(),
            noderev: None,
            kind: ChangeKind::Reset,
            text_mod: false,
            prop_mod: false,
        },
    );
}

/// The folded change summary of a committed revision, keyed by path.
pub(crate) fn paths_changed(
    trail: &Trail<'_>,
    rev: Revision,
) -> FsResult<Vec<ChangeRecord>> {
    let txn_id = revisions::rev_get_txn_id(trail, rev)?;
    changes::get_changes(trail, &txn_id)
}
