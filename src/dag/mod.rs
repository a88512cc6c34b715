//! The DAG layer.
//!
//! Exposes immutable dag-node handles over the node-revision store and
//! implements the write discipline that makes the DAG look like a mutable
//! tree: just-in-time cloning of nodes along the spine of a transaction,
//! copy-on-write representations for directory entries and properties, copy
//! bookkeeping, and the commit-time stabilization walk with its skip-delta
//! offers.
//!
//! A [`DagNode`] is a snapshot handle: the id plus the record as read inside
//! some trail. Mutating operations write through the stores and return fresh
//! handles; cached handles for mutable nodes are the tree layer's problem to
//! invalidate across trails.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{debug, trace};

use crate::error::{Error, FsResult};
use crate::id::{CopyId, NodeRevId, RepId, Revision, TxnId};
use crate::skel::{proplist_from_skel, proplist_to_skel, Proplist, Skel};
use crate::store::nodes::{self, NodeKind, NodeRevision};
use crate::store::txns::TxnState;
use crate::store::{changes, copies, reps, revisions, txns};
use crate::trail::Trail;

mod commit;
pub use commit::commit_txn;

/// Deltification distances: the immediate predecessor always, and when the
/// predecessor count reaches `SKIP_DELTA_THRESHOLD`, the predecessors at
/// distances 2^i (i >= 2) dividing the count. Distance 2 is skipped and the
/// chain's oldest node stays fulltext.
pub(crate) const SKIP_DELTA_THRESHOLD: i64 = 32;

#[derive(Debug, Clone)]
pub struct DagNode {
    pub id: NodeRevId,
    pub rec: NodeRevision,
}

impl DagNode {
    pub fn kind(&self) -> NodeKind {
        self.rec.kind
    }

    pub fn is_dir(&self) -> bool {
        self.rec.kind == NodeKind::Dir
    }

    /// A node-revision is mutable exactly when it belongs to the given txn.
    pub fn is_mutable(&self, txn_id: &TxnId) -> bool {
        self.id.txn_id() == txn_id
    }
}

pub fn get_node(trail: &Trail<'_>, id: &NodeRevId) -> FsResult<DagNode> {
    Ok(DagNode { id: id.clone(), rec: nodes::get_node_revision(trail, id)? })
}

pub fn revision_root(trail: &Trail<'_>, rev: Revision) -> FsResult<DagNode> {
    let id = revisions::rev_get_root(trail, rev)?;
    get_node(trail, &id)
}

pub fn txn_root(trail: &Trail<'_>, txn_id: &TxnId) -> FsResult<DagNode> {
    let rec = txns::get_txn(trail, txn_id)?;
    get_node(trail, &rec.root_id)
}

pub fn txn_base_root(trail: &Trail<'_>, txn_id: &TxnId) -> FsResult<DagNode> {
    let rec = txns::get_txn(trail, txn_id)?;
    get_node(trail, &rec.base_root_id)
}

fn require_mutable(node: &DagNode, txn_id: &TxnId) -> FsResult<()> {
    if node.is_mutable(txn_id) {
        Ok(())
    } else {
        Err(Error::NotMutable { id: node.id.to_string() })
    }
}

fn require_dir(node: &DagNode) -> FsResult<()> {
    if node.is_dir() {
        Ok(())
    } else {
        Err(Error::NotDirectory { path: node.rec.created_path.clone() })
    }
}

/// Build a successor record of `rec`: same content references, predecessor
/// pointing back, not yet committed, not itself a copy destination.
fn successor_record(rec: &NodeRevision, predecessor: &NodeRevId) -> NodeRevision {
    NodeRevision {
        created_rev: None,
        predecessor: Some(predecessor.clone()),
        predecessor_count: if rec.predecessor_count < 0 { -1 } else { rec.predecessor_count + 1 },
        copy_root: None,
        edit_key: None,
        ..rec.clone()
    }
}

/// Make the txn's root mutable: on first write, install a successor of the
/// base root as the txn root. Idempotent.
pub fn clone_root(trail: &mut Trail<'_>, txn_id: &TxnId) -> FsResult<DagNode> {
    let txn_rec = txns::get_active_txn(trail, txn_id)?;
    if txn_rec.root_id != txn_rec.base_root_id {
        return get_node(trail, &txn_rec.root_id);
    }
    let base = get_node(trail, &txn_rec.base_root_id)?;
    let new_id = nodes::new_successor_id(&base.id, None, txn_id);
    let rec = successor_record(&base.rec, &base.id);
    nodes::put_node_revision(trail, &new_id, &rec);
    txns::set_txn_root(trail, txn_id, &new_id)?;
    trace!(target: "revfs::dag", "cloned root {} -> {}", base.id, new_id);
    Ok(DagNode { id: new_id, rec })
}

/// Clone `name` under a mutable `parent`: if the child already belongs to
/// this txn it is returned as-is, otherwise a successor is created with the
/// chosen copy id and the parent entry is rewritten to point at it.
pub fn clone_child(
    trail: &mut Trail<'_>,
    parent: &DagNode,
    name: &str,
    copy_id: Option<&CopyId>,
    created_path: &str,
    txn_id: &TxnId,
) -> FsResult<DagNode> {
    require_dir(parent)?;
    require_mutable(parent, txn_id)?;
    let child_id = lookup_entry(trail, parent, name)?;
    if child_id.txn_id() == txn_id {
        return get_node(trail, &child_id);
    }
    let child_rec = nodes::get_node_revision(trail, &child_id)?;
    let new_id = nodes::new_successor_id(&child_id, copy_id, txn_id);
    let mut rec = successor_record(&child_rec, &child_id);
    rec.created_path = created_path.to_string();
    nodes::put_node_revision(trail, &new_id, &rec);
    set_entry(trail, &parent.id, name, &new_id, txn_id)?;
    trace!(target: "revfs::dag", "cloned child '{}': {} -> {}", name, child_id, new_id);
    Ok(DagNode { id: new_id, rec })
}

// ---------- directory entries ----------

fn entries_to_skel(entries: &BTreeMap<String, NodeRevId>) -> Skel {
    Skel::list(
        entries
            .iter()
            .map(|(name, id)| {
                Skel::list(vec![Skel::atom_str(name), Skel::atom_str(&id.to_string())])
            })
            .collect(),
    )
}

fn entries_from_skel(skel: &Skel) -> FsResult<BTreeMap<String, NodeRevId>> {
    let bad = || Error::corrupt("malformed directory entries list");
    let mut entries = BTreeMap::new();
    for item in skel.as_list().ok_or_else(bad)? {
        let pair = item.as_list().ok_or_else(bad)?;
        if pair.len() != 2 {
            return Err(bad());
        }
        let name = pair[0].as_str().ok_or_else(bad)?.to_string();
        let id = NodeRevId::parse(pair[1].as_str().ok_or_else(bad)?)?;
        entries.insert(name, id);
    }
    Ok(entries)
}

/// The parsed entries list of a directory. A directory with no data rep is
/// empty.
pub fn dir_entries(trail: &Trail<'_>, dir: &DagNode) -> FsResult<BTreeMap<String, NodeRevId>> {
    require_dir(dir)?;
    match &dir.rec.data_key {
        None => Ok(BTreeMap::new()),
        Some(rep) => {
            let bytes = reps::contents(trail, rep)?;
            entries_from_skel(&Skel::parse(&bytes)?)
        }
    }
}

fn lookup_entry(trail: &Trail<'_>, dir: &DagNode, name: &str) -> FsResult<NodeRevId> {
    dir_entries(trail, dir)?
        .remove(name)
        .ok_or_else(|| Error::NoSuchEntry { id: dir.id.to_string(), name: name.to_string() })
}

/// Open the node that `name` refers to under `dir`.
pub fn open_child(trail: &Trail<'_>, dir: &DagNode, name: &str) -> FsResult<DagNode> {
    let id = lookup_entry(trail, dir, name)?;
    get_node(trail, &id)
}

/// Make the directory's entries rep writable (cloning it when absent or
/// shared with an immutable node-revision) and parse it.
fn mutable_entries(
    trail: &mut Trail<'_>,
    dir_id: &NodeRevId,
    txn_id: &TxnId,
) -> FsResult<(RepId, BTreeMap<String, NodeRevId>)> {
    let mut dir = get_node(trail, dir_id)?;
    require_dir(&dir)?;
    require_mutable(&dir, txn_id)?;

    let rep = reps::get_mutable_rep(trail, dir.rec.data_key.as_ref())?;
    if dir.rec.data_key.as_ref() != Some(&rep) {
        dir.rec.data_key = Some(rep.clone());
        nodes::put_node_revision(trail, &dir.id, &dir.rec);
    }
    let bytes = reps::contents(trail, &rep)?;
    let entries = if bytes.is_empty() {
        BTreeMap::new()
    } else {
        entries_from_skel(&Skel::parse(&bytes)?)?
    };
    Ok((rep, entries))
}

fn require_single_component(name: &str) -> FsResult<()> {
    if name.is_empty() || name.contains('/') {
        return Err(Error::NotSinglePathComponent { name: name.to_string() });
    }
    Ok(())
}

/// Rewrite (or insert) one entry of a mutable directory.
pub fn set_entry(
    trail: &mut Trail<'_>,
    dir_id: &NodeRevId,
    name: &str,
    target: &NodeRevId,
    txn_id: &TxnId,
) -> FsResult<()> {
    require_single_component(name)?;
    let (rep, mut entries) = mutable_entries(trail, dir_id, txn_id)?;
    entries.insert(name.to_string(), target.clone());
    write_entries(trail, &rep, &entries)
}

fn write_entries(
    trail: &mut Trail<'_>,
    rep: &RepId,
    entries: &BTreeMap<String, NodeRevId>,
) -> FsResult<()> {
    reps::clear_contents(trail, rep)?;
    reps::append_contents(trail, rep, &entries_to_skel(entries).unparse())
}

/// Create a new file or directory entry under a mutable parent. The new node
/// starts its own line of history and shares the parent's copy id.
pub fn make_child(
    trail: &mut Trail<'_>,
    parent: &DagNode,
    name: &str,
    kind: NodeKind,
    created_path: &str,
    txn_id: &TxnId,
) -> FsResult<DagNode> {
    require_dir(parent)?;
    require_mutable(parent, txn_id)?;
    if dir_entries(trail, parent)?.contains_key(name) {
        return Err(Error::AlreadyExists {
            path: parent.rec.created_path.clone(),
            name: name.to_string(),
        });
    }
    let rec = match kind {
        NodeKind::Dir => NodeRevision::new_dir(created_path),
        NodeKind::File => NodeRevision::new_file(created_path),
    };
    let id = nodes::new_node_id(trail, parent.id.copy_id(), txn_id)?;
    nodes::put_node_revision(trail, &id, &rec);
    set_entry(trail, &parent.id, name, &id, txn_id)?;
    debug!(target: "revfs::dag", "created {} '{}' as {}", kind.as_str(), created_path, id);
    Ok(DagNode { id, rec })
}

/// Remove `name` from a mutable directory, reclaiming any node-revisions,
/// reps and strings beneath it that belong to this txn. Immutable parts of
/// the subtree are shared history and stay.
pub fn delete_entry(
    trail: &mut Trail<'_>,
    dir_id: &NodeRevId,
    name: &str,
    txn_id: &TxnId,
) -> FsResult<()> {
    let (rep, mut entries) = mutable_entries(trail, dir_id, txn_id)?;
    let child_id = entries
        .remove(name)
        .ok_or_else(|| Error::NoSuchEntry { id: dir_id.to_string(), name: name.to_string() })?;
    if child_id.txn_id() == txn_id {
        delete_if_mutable(trail, &child_id, txn_id)?;
    }
    write_entries(trail, &rep, &entries)
}

/// Recursively delete a mutable node-revision, its mutable descendants and
/// their mutable reps and substrate strings.
pub fn delete_if_mutable(trail: &mut Trail<'_>, id: &NodeRevId, txn_id: &TxnId) -> FsResult<()> {
    if id.txn_id() != txn_id {
        return Ok(());
    }
    let node = get_node(trail, id)?;
    if node.is_dir() {
        for (_, child) in dir_entries(trail, &node)? {
            delete_if_mutable(trail, &child, txn_id)?;
        }
    }
    for rep in [&node.rec.prop_key, &node.rec.data_key, &node.rec.edit_key]
        .into_iter()
        .flatten()
    {
        reps::delete_rep_if_mutable(trail, rep)?;
    }
    nodes::delete_node_revision(trail, id)?;
    trace!(target: "revfs::dag", "reclaimed mutable node {}", id);
    Ok(())
}

// ---------- properties ----------

pub fn get_proplist(trail: &Trail<'_>, node: &DagNode) -> FsResult<Proplist> {
    match &node.rec.prop_key {
        None => Ok(Proplist::new()),
        Some(rep) => {
            let bytes = reps::contents(trail, rep)?;
            if bytes.is_empty() {
                return Ok(Proplist::new());
            }
            proplist_from_skel(&Skel::parse(&bytes)?)
        }
    }
}

pub fn set_proplist(
    trail: &mut Trail<'_>,
    node_id: &NodeRevId,
    props: &Proplist,
    txn_id: &TxnId,
) -> FsResult<()> {
    let mut node = get_node(trail, node_id)?;
    require_mutable(&node, txn_id)?;
    let rep = reps::get_mutable_rep(trail, node.rec.prop_key.as_ref())?;
    if node.rec.prop_key.as_ref() != Some(&rep) {
        node.rec.prop_key = Some(rep.clone());
        nodes::put_node_revision(trail, &node.id, &node.rec);
    }
    reps::clear_contents(trail, &rep)?;
    reps::append_contents(trail, &rep, &proplist_to_skel(props).unparse())
}

// ---------- file contents ----------

fn require_file(node: &DagNode) -> FsResult<()> {
    match node.rec.kind {
        NodeKind::File => Ok(()),
        NodeKind::Dir => Err(Error::NotFile { path: node.rec.created_path.clone() }),
    }
}

pub fn file_length(trail: &Trail<'_>, node: &DagNode) -> FsResult<u64> {
    require_file(node)?;
    match &node.rec.data_key {
        None => Ok(0),
        Some(rep) => reps::contents_size(trail, rep),
    }
}

pub fn file_md5(trail: &Trail<'_>, node: &DagNode) -> FsResult<[u8; 16]> {
    require_file(node)?;
    match &node.rec.data_key {
        None => Ok(md5::compute(b"").0),
        Some(rep) => reps::fulltext_md5(trail, rep),
    }
}

pub fn file_read(trail: &Trail<'_>, node: &DagNode, offset: u64, len: usize) -> FsResult<Vec<u8>> {
    require_file(node)?;
    match &node.rec.data_key {
        None => Ok(Vec::new()),
        Some(rep) => reps::read_range(trail, rep, offset, len),
    }
}

/// Start an edit on a mutable file: any previous in-progress edit rep is
/// destroyed and a fresh mutable fulltext takes its place. Returns the rep
/// to write through.
pub fn begin_edit(trail: &mut Trail<'_>, node_id: &NodeRevId, txn_id: &TxnId) -> FsResult<RepId> {
    let mut node = get_node(trail, node_id)?;
    require_file(&node)?;
    require_mutable(&node, txn_id)?;
    if let Some(old) = node.rec.edit_key.take() {
        reps::delete_rep_if_mutable(trail, &old)?;
    }
    let rep = reps::get_mutable_rep(trail, None)?;
    node.rec.edit_key = Some(rep.clone());
    nodes::put_node_revision(trail, &node.id, &node.rec);
    Ok(rep)
}

/// Move a finished edit rep into the data slot, discarding the old mutable
/// data rep and validating the result checksum when one was promised.
pub fn finalize_edits(
    trail: &mut Trail<'_>,
    node_id: &NodeRevId,
    expected_md5: Option<[u8; 16]>,
    txn_id: &TxnId,
) -> FsResult<()> {
    let mut node = get_node(trail, node_id)?;
    require_file(&node)?;
    require_mutable(&node, txn_id)?;
    let edit = match node.rec.edit_key.take() {
        None => return Ok(()),
        Some(rep) => rep,
    };
    if let Some(expected) = expected_md5 {
        let actual = md5::compute(&reps::contents(trail, &edit)?).0;
        if actual != expected {
            return Err(Error::ChecksumMismatch {
                context: node.rec.created_path.clone(),
                expected: reps::hex(&expected),
                actual: reps::hex(&actual),
            });
        }
    }
    if let Some(old) = node.rec.data_key.take() {
        reps::delete_rep_if_mutable(trail, &old)?;
    }
    node.rec.data_key = Some(edit);
    nodes::put_node_revision(trail, &node.id, &node.rec);
    Ok(())
}

// ---------- copies ----------

/// Install `from_node` (as of `from_rev`, at `from_path`) under
/// `to_dir[entry]`. With `preserve_history` a successor node-revision under
/// a fresh copy id records the provenance and a `real` copy record is
/// written; without it the entry simply links to the existing node-revision.
#[allow(clippy::too_many_arguments)]
pub fn copy(
    trail: &mut Trail<'_>,
    to_dir: &DagNode,
    entry: &str,
    from_node: &DagNode,
    preserve_history: bool,
    from_rev: Revision,
    from_path: &str,
    to_path: &str,
    txn_id: &TxnId,
) -> FsResult<NodeRevId> {
    require_dir(to_dir)?;
    require_mutable(to_dir, txn_id)?;
    if !preserve_history {
        if from_node.is_mutable(txn_id) {
            return Err(Error::NotMutable { id: from_node.id.to_string() });
        }
        set_entry(trail, &to_dir.id, entry, &from_node.id, txn_id)?;
        return Ok(from_node.id.clone());
    }

    let copy_id = copies::reserve_copy_id(trail)?;
    let new_id = nodes::new_successor_id(&from_node.id, Some(&copy_id), txn_id);
    let mut rec = successor_record(&from_node.rec, &from_node.id);
    rec.created_path = to_path.to_string();
    rec.copy_root = Some((from_rev, from_path.to_string()));
    nodes::put_node_revision(trail, &new_id, &rec);

    let src_txn = revisions::rev_get_txn_id(trail, from_rev)?;
    copies::put_copy(
        trail,
        &copy_id,
        &copies::CopyRecord {
            kind: copies::CopyKind::Real,
            src_path: from_path.to_string(),
            src_txn,
            dst_noderev: new_id.clone(),
        },
    );
    txns::add_txn_copy(trail, txn_id, &copy_id)?;
    set_entry(trail, &to_dir.id, entry, &new_id, txn_id)?;
    debug!(
        target: "revfs::dag",
        "copied '{}'@{} to '{}' as {} (copy id {})",
        from_path, from_rev, to_path, new_id, copy_id
    );
    Ok(new_id)
}

/// The `(revision, path)` this node-revision was copied from, if it is the
/// destination of a copy.
pub fn copied_from(node: &DagNode) -> Option<(Revision, String)> {
    node.rec.copy_root.clone()
}

// ---------- bootstrap and teardown ----------

/// Create revision 0: an empty root directory `0.0.0` and a revision record
/// carrying a creation date.
pub fn init_fs(trail: &mut Trail<'_>) -> FsResult<()> {
    // Burn txn key "0" so no live transaction can ever share the bootstrap
    // txn segment of the root id, then mint node id "0": the root is 0.0.0.
    let burned = crate::store::allocate_key(trail, crate::store::counters::NEXT_TXN_ID)?;
    debug_assert_eq!(burned, "0");
    let root_id = nodes::new_node_id(trail, &CopyId::zero(), &TxnId::new("0"))?;
    let mut rec = NodeRevision::new_dir("/");
    rec.created_rev = Some(0);
    nodes::put_node_revision(trail, &root_id, &rec);

    let mut props = Proplist::new();
    props.insert("revfs:date".to_string(), Utc::now().to_rfc3339().into_bytes());
    let rev = revisions::allocate_revision(
        trail,
        &revisions::RevisionRecord { root_id: root_id.clone(), props },
    )?;
    debug_assert_eq!(rev, 0);

    // The bootstrap txn gets a committed record of its own so that txn-id
    // lookups (base revisions, copy sources) resolve for revision 0 too.
    txns::put_txn(
        trail,
        &TxnId::new("0"),
        &txns::TxnRecord {
            root_id: root_id.clone(),
            base_root_id: root_id.clone(),
            props: Proplist::new(),
            copies: Vec::new(),
            state: TxnState::Committed(0),
        },
    );
    debug!(target: "revfs::dag", "initialized filesystem, root {}", root_id);
    Ok(())
}

/// Tear down an active txn: reclaim its mutable subtree, changes and copies,
/// then drop the record (passing through the dead state).
pub fn purge_txn(trail: &mut Trail<'_>, txn_id: &TxnId) -> FsResult<()> {
    let mut rec = txns::get_active_txn(trail, txn_id)?;
    rec.state = TxnState::Dead;
    txns::put_txn(trail, txn_id, &rec);

    delete_if_mutable(trail, &rec.root_id, txn_id)?;
    changes::delete_changes(trail, txn_id);
    for copy_id in &rec.copies {
        copies::delete_copy(trail, copy_id)?;
    }
    txns::delete_txn(trail, txn_id)?;
    debug!(target: "revfs::dag", "aborted txn {}", txn_id);
    Ok(())
}
