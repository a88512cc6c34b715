//! Path history traversal.
//!
//! A [`NodeHistory`] walks a path backward through revisions, following
//! predecessor links within a line of history and copy records across
//! copies. Copy crossing leans on the same copy-id inheritance bookkeeping
//! the write path uses: the last *real* copy dominating the walked path
//! tells us where the node lived before the copy.

use crate::dag;
use crate::error::{Error, FsResult};
use crate::fs::Fs;
use crate::id::{CopyId, Revision};
use crate::store::copies::{self, CopyKind, CopyRecord};
use crate::store::txns;
use crate::trail::{retry_txn, Trail};
use crate::tree::{
    canonicalize_path, join_path, open_path, path_remainder, CopyInherit, ParentPath, Root,
    RootKind,
};

/// A point in a path's history, plus the hints needed to keep walking.
#[derive(Debug, Clone)]
pub struct NodeHistory {
    pub(crate) path: String,
    pub(crate) revision: Revision,
    /// Where to resume after reporting a copy destination.
    hint: Option<(String, Revision)>,
    /// False until the first reportable location has been produced.
    interesting: bool,
}

impl NodeHistory {
    /// The `(path, revision)` this history object currently points at.
    pub fn location(&self) -> (&str, Revision) {
        (&self.path, self.revision)
    }
}

impl Root {
    /// Begin a history walk at `path` in this revision root.
    pub fn node_history(&self, path: &str) -> FsResult<NodeHistory> {
        if self.revision().is_none() {
            return Err(Error::NotRevisionRoot);
        }
        let canon = canonicalize_path(path);
        if self.check_path(&canon)?.is_none() {
            return Err(Error::not_found(&canon));
        }
        Ok(NodeHistory {
            path: canon,
            revision: self.revision().expect("revision root"),
            hint: None,
            interesting: false,
        })
    }
}

impl Fs {
    /// The previous interesting location of `history`, or `None` when the
    /// walk is done. With `cross_copies` false the walk stops at the first
    /// copy boundary.
    pub fn history_prev(
        &self,
        history: &NodeHistory,
        cross_copies: bool,
    ) -> FsResult<Option<NodeHistory>> {
        // The root directory changes in every revision and is never a copy
        // target; its history is just a countdown.
        if history.path == "/" {
            if !history.interesting {
                return Ok(Some(NodeHistory { interesting: true, ..history.clone() }));
            }
            if history.revision > 0 {
                return Ok(Some(NodeHistory {
                    path: "/".to_string(),
                    revision: history.revision - 1,
                    hint: None,
                    interesting: true,
                }));
            }
            return Ok(None);
        }

        let mut current = history.clone();
        loop {
            let next = retry_txn(&self.db, |trail| {
                history_prev_body(trail, self, &current, cross_copies)
            })?;
            match next {
                None => return Ok(None),
                Some(h) if h.interesting => return Ok(Some(h)),
                Some(h) => current = h,
            }
        }
    }
}

/// One step of the history search; may produce an uninteresting
/// intermediate location that the caller loops over.
fn history_prev_body(
    trail: &mut Trail<'_>,
    fs: &Fs,
    history: &NodeHistory,
    cross_copies: bool,
) -> FsResult<Option<NodeHistory>> {
    let mut path = history.path.clone();
    let mut revision = history.revision;
    let mut reported = history.interesting;

    // A prior report left hints: it was a copy destination. Resume from the
    // copy source, or stop if copies are walls.
    if let Some((hint_path, hint_rev)) = &history.hint {
        if !cross_copies {
            return Ok(None);
        }
        path = hint_path.clone();
        revision = *hint_rev;
        reported = false;
    }

    let root = Root::new(fs.clone(), RootKind::Revision(revision));
    let walk = open_path(trail, &root, &path, false)?;
    let mut node = walk.leaf_node().expect("history path exists").clone();
    let mut commit_path = node.rec.created_path.clone();
    let mut commit_rev = commit_rev_of(&node)?;
    let mut retry = false;

    // At most one interesting history point per revision: either this
    // revision committed the node (report it, then next time move to the
    // predecessor), or the interesting point is older.
    if revision == commit_rev {
        if !reported {
            return Ok(Some(NodeHistory {
                path: commit_path,
                revision: commit_rev,
                hint: None,
                interesting: true,
            }));
        }
        match &node.rec.predecessor {
            None => return Ok(None),
            Some(pred) => {
                node = dag::get_node(trail, pred)?;
                commit_path = node.rec.created_path.clone();
                commit_rev = commit_rev_of(&node)?;
            }
        }
    }

    // The last copy that would dominate this path if it were made mutable.
    let (end_copy_id, prefetched) = examine_copy_inheritance(trail, &walk)?;

    let mut src_loc: Option<(String, Revision)> = None;
    let mut dst_rev: Option<Revision> = None;
    if node.id.copy_id() != &end_copy_id {
        let copy = match prefetched {
            Some(copy) => copy,
            None => copies::get_copy(trail, &end_copy_id)?,
        };
        let dst_node = dag::get_node(trail, &copy.dst_noderev)?;
        let copy_dst = dst_node.rec.created_path.clone();
        // Only relevant if our path is the copy destination or beneath it.
        if let Some(remainder) = path_remainder(&copy_dst, &path) {
            let src_rev = txns::txn_get_revision(trail, &copy.src_txn)?;
            dst_rev = txns::txn_get_revision(trail, copy.dst_noderev.txn_id())?;
            if let Some(src_rev) = src_rev {
                let src_path = if remainder.is_empty() {
                    copy.src_path.clone()
                } else {
                    join_path(&copy.src_path, remainder)
                };
                src_loc = Some((src_path, src_rev));
            }
            if copy.kind == CopyKind::Soft {
                retry = true;
            }
        }
    }

    match (src_loc, dst_rev) {
        // A copy that does not pre-date the node's own commit: report the
        // destination location, hinting at the source for the next step.
        (Some((src_path, src_rev)), Some(dst_rev)) if src_rev >= commit_rev => {
            // The copy destination can coincide with the report we just
            // made; in that case take another lap.
            if dst_rev == revision && reported {
                retry = true;
            }
            Ok(Some(NodeHistory {
                path,
                revision: dst_rev,
                hint: Some((src_path, src_rev)),
                interesting: !retry,
            }))
        }
        _ => Ok(Some(NodeHistory {
            path: commit_path,
            revision: commit_rev,
            hint: None,
            interesting: true,
        })),
    }
}

fn commit_rev_of(node: &dag::DagNode) -> FsResult<Revision> {
    node.rec
        .created_rev
        .ok_or_else(|| Error::corrupt(format!("history reached uncommitted node {}", node.id)))
}

/// Walk the parent-path chain leaf-to-root for the copy id that last
/// affected the leaf, returning the copy record too when it was fetched on
/// the way.
fn examine_copy_inheritance(
    trail: &Trail<'_>,
    walk: &ParentPath,
) -> FsResult<(CopyId, Option<CopyRecord>)> {
    for (i, step) in walk.steps.iter().enumerate().rev() {
        let node = step.node.as_ref().expect("history walk steps all exist");
        let copy_id = node.id.copy_id().clone();
        if i == 0 {
            return Ok((copy_id, None));
        }
        if matches!(step.inherit, CopyInherit::ThisNode) {
            if copy_id.is_zero() {
                return Ok((copy_id, None));
            }
            let copy = copies::get_copy(trail, &copy_id)?;
            if copy.kind != CopyKind::Soft {
                return Ok((copy_id, Some(copy)));
            }
        }
        // Otherwise the answer depends on the parent; keep climbing.
    }
    unreachable!("walk always contains the root step");
}

/// `(path, revision)` pairs (youngest first) at which the file at `path` in
/// `end_rev` changed, back to `start_rev`, with copy crossing.
pub(crate) fn get_file_revs(
    fs: &Fs,
    path: &str,
    start_rev: Revision,
    end_rev: Revision,
) -> FsResult<Vec<(String, Revision)>> {
    let root = Root::new(fs.clone(), RootKind::Revision(end_rev));
    if root.check_path(path)? != Some(crate::store::nodes::NodeKind::File) {
        return Err(Error::NotFile { path: canonicalize_path(path) });
    }
    let mut out = Vec::new();
    let mut history = root.node_history(path)?;
    while let Some(next) = fs.history_prev(&history, true)? {
        let (p, rev) = next.location();
        if rev < start_rev {
            break;
        }
        out.push((p.to_string(), rev));
        history = next;
    }
    Ok(out)
}
