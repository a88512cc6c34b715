//! Commit-time stabilization.
//!
//! Turning a transaction into a revision: walk the mutable subtree bottom-up
//! freezing reps and stamping the new revision number into each
//! node-revision, offer skip-delta deltifications along every predecessor
//! chain, append the revision record, fold the change log, and mark the txn
//! committed.

use chrono::Utc;
use tracing::debug;

use super::{dir_entries, get_node, DagNode, SKIP_DELTA_THRESHOLD};
use crate::error::{Error, FsResult};
use crate::id::{NodeRevId, Revision, TxnId};
use crate::store::nodes;
use crate::store::txns::TxnState;
use crate::store::{changes, reps, revisions, txns};
use crate::trail::Trail;

/// Commit `txn_id` directly against the youngest revision. The caller (the
/// tree layer's commit loop) is responsible for merging first; a base-root
/// mismatch here reports `OutOfDate`.
pub fn commit_txn(trail: &mut Trail<'_>, txn_id: &TxnId) -> FsResult<Revision> {
    let txn_rec = txns::get_active_txn(trail, txn_id)?;
    let youngest = revisions::youngest_rev(trail)?;
    let youngest_root = revisions::rev_get_root(trail, youngest)?;
    if txn_rec.base_root_id != youngest_root {
        return Err(Error::OutOfDate { txn_id: txn_id.as_str().to_string(), youngest });
    }

    let new_rev = youngest + 1;
    stabilize(trail, &txn_rec.root_id, new_rev, txn_id)?;

    let mut props = txn_rec.props.clone();
    props.insert("revfs:date".to_string(), Utc::now().to_rfc3339().into_bytes());
    let rev = revisions::allocate_revision(
        trail,
        &revisions::RevisionRecord { root_id: txn_rec.root_id.clone(), props },
    )?;
    debug_assert_eq!(rev, new_rev);

    changes::fold_txn_changes(trail, txn_id)?;

    let mut rec = txn_rec;
    rec.state = TxnState::Committed(rev);
    txns::put_txn(trail, txn_id, &rec);
    debug!(target: "revfs::dag", "committed txn {} as revision {}", txn_id, rev);
    Ok(rev)
}

/// Depth-first walk over the txn's mutable subtree: children first, then
/// freeze this node's reps, stamp the revision, and offer deltifications.
fn stabilize(trail: &mut Trail<'_>, id: &NodeRevId, rev: Revision, txn_id: &TxnId) -> FsResult<()> {
    if id.txn_id() != txn_id {
        return Ok(());
    }
    let mut node = get_node(trail, id)?;
    if node.is_dir() {
        for (_, child) in dir_entries(trail, &node)? {
            stabilize(trail, &child, rev, txn_id)?;
        }
    }
    if node.rec.edit_key.is_some() {
        return Err(Error::corrupt(format!(
            "node '{}' still has an edit in progress at commit",
            node.rec.created_path
        )));
    }
    for rep in [&node.rec.prop_key, &node.rec.data_key].into_iter().flatten() {
        reps::make_rep_immutable(trail, rep)?;
    }
    node.rec.created_rev = Some(rev);
    nodes::put_node_revision(trail, id, &node.rec);
    offer_skip_deltas(trail, &node)
}

/// Offer the predecessors selected by the skip-delta policy the chance to be
/// stored as deltas against the node just stabilized: always the immediate
/// predecessor, plus the ancestors at distances 2^i (i >= 2) dividing the
/// predecessor count once it reaches the threshold. The chain's oldest
/// node-revision stays fulltext.
fn offer_skip_deltas(trail: &mut Trail<'_>, node: &DagNode) -> FsResult<()> {
    let pred_id = match &node.rec.predecessor {
        None => return Ok(()),
        Some(id) => id.clone(),
    };
    let pred = get_node(trail, &pred_id)?;
    offer(trail, &pred, node)?;

    let k = node.rec.predecessor_count;
    if k < SKIP_DELTA_THRESHOLD {
        return Ok(());
    }
    let mut distance: i64 = 4;
    while distance <= k {
        if k % distance == 0 {
            if let Some(ancestor) = walk_predecessors(trail, node, distance)? {
                if ancestor.rec.predecessor_count != 0 {
                    offer(trail, &ancestor, node)?;
                }
            }
        }
        distance <<= 1;
    }
    Ok(())
}

/// Deltify `target`'s reps against `source`'s. Directories deltify their
/// property rep only; entry lists stay fulltext so directory reads remain a
/// single hop.
fn offer(trail: &mut Trail<'_>, target: &DagNode, source: &DagNode) -> FsResult<()> {
    if let (Some(t), Some(s)) = (&target.rec.prop_key, &source.rec.prop_key) {
        if t != s {
            reps::rep_deltify(trail, t, s)?;
        }
    }
    if !source.is_dir() {
        if let (Some(t), Some(s)) = (&target.rec.data_key, &source.rec.data_key) {
            if t != s {
                reps::rep_deltify(trail, t, s)?;
            }
        }
    }
    Ok(())
}

/// The ancestor `distance` predecessor links back from `node`, if the chain
/// reaches that far.
fn walk_predecessors(
    trail: &Trail<'_>,
    node: &DagNode,
    distance: i64,
) -> FsResult<Option<DagNode>> {
    let mut current = node.clone();
    for _ in 0..distance {
        match &current.rec.predecessor {
            None => return Ok(None),
            Some(pred) => current = get_node(trail, pred)?,
        }
    }
    Ok(Some(current))
}
