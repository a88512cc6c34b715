//! The tree layer: the path-based API over the DAG.
//!
//! A [`Root`] names either a committed revision or an in-progress
//! transaction. Reads walk paths through the DAG with a per-root node cache;
//! writes open the path, clone the spine just-in-time (`make_path_mutable`,
//! with copy-id inheritance decided per component) and then issue DAG
//! operations, recording a change row for every mutation. Commit lives in
//! [`commit`], history traversal in [`history`].

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::dag::{self, DagNode};
use crate::delta;
use crate::error::{Error, FsResult};
use crate::fs::Fs;
use crate::id::{NodeRevId, RepId, Revision, TxnId};
use crate::skel::Proplist;
use crate::store::changes::{self, ChangeKind, ChangeRecord};
use crate::store::nodes::NodeKind;
use crate::store::{copies, reps, revisions, txns};
use crate::trail::{retry_txn, Trail};

pub(crate) mod commit;
pub mod history;


// ---------- paths ----------

/// Canonical absolute form: leading slash, single separators, no trailing
/// slash (except the root itself).
pub fn canonicalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    out.push('/');
    for component in path.split('/').filter(|c| !c.is_empty()) {
        if !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(component);
    }
    out
}

pub fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

fn components(canon: &str) -> impl Iterator<Item = &str> {
    canon.split('/').filter(|c| !c.is_empty())
}

/// `child` relative to `dir`, when `child` equals or descends from it.
pub fn path_remainder<'a>(dir: &str, child: &'a str) -> Option<&'a str> {
    if child == dir {
        return Some("");
    }
    let prefix = if dir == "/" { "/".to_string() } else { format!("{}/", dir) };
    child.strip_prefix(prefix.as_str())
}

// ---------- roots ----------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootKind {
    Revision(Revision),
    Txn(TxnId),
}

/// A revision root or a txn root; every tree operation starts here.
#[derive(Clone)]
pub struct Root {
    pub(crate) fs: Fs,
    pub(crate) kind: RootKind,
    /// Path -> dag node cache; dropped wholesale when a trail that mutated
    /// this root completes.
    cache: Arc<Mutex<HashMap<String, DagNode>>>,
}

/// One directory entry as reported by [`Root::dir_entries`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub id: NodeRevId,
    pub kind: NodeKind,
}

impl Root {
    pub(crate) fn new(fs: Fs, kind: RootKind) -> Root {
        Root { fs, kind, cache: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub fn is_txn_root(&self) -> bool {
        matches!(self.kind, RootKind::Txn(_))
    }

    pub fn revision(&self) -> Option<Revision> {
        match &self.kind {
            RootKind::Revision(rev) => Some(*rev),
            RootKind::Txn(_) => None,
        }
    }

    pub fn txn_id(&self) -> Option<&TxnId> {
        match &self.kind {
            RootKind::Txn(id) => Some(id),
            RootKind::Revision(_) => None,
        }
    }

    fn require_txn(&self) -> FsResult<&TxnId> {
        self.txn_id().ok_or(Error::NotTxnRoot)
    }

    pub(crate) fn root_node(&self, trail: &Trail<'_>) -> FsResult<DagNode> {
        match &self.kind {
            RootKind::Revision(rev) => dag::revision_root(trail, *rev),
            RootKind::Txn(id) => dag::txn_root(trail, id),
        }
    }

    /// The txn id used for copy-id inheritance decisions along a walk: the
    /// mutability txn for txn roots, the creating txn for revision roots.
    pub(crate) fn walk_txn_id(&self, trail: &Trail<'_>) -> FsResult<TxnId> {
        match &self.kind {
            RootKind::Txn(id) => Ok(id.clone()),
            RootKind::Revision(rev) => revisions::rev_get_txn_id(trail, *rev),
        }
    }

    fn cache_get(&self, path: &str) -> Option<DagNode> {
        self.cache.lock().get(path).cloned()
    }

    fn cache_set(&self, path: &str, node: &DagNode) {
        self.cache.lock().insert(path.to_string(), node.clone());
    }

    /// Arrange for the node cache to be dropped when `trail` completes,
    /// committed or aborted, so later reads re-fetch records this trail may
    /// have rewritten.
    pub(crate) fn invalidate_on_completion(&self, trail: &mut Trail<'_>) {
        let cache = Arc::clone(&self.cache);
        trail.on_completion(move || cache.lock().clear());
    }
}

// ---------- parent paths ----------

/// Copy-id inheritance decision for one walked component, made against the
/// txn in which the node might be made mutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CopyInherit {
    /// Keep the node's own copy id (already mutable, or accessed via its
    /// original copy destination path).
    ThisNode,
    /// Take the parent's copy id.
    Parent,
    /// Mint a fresh copy id and record a soft copy from the given path.
    New(String),
}

pub(crate) struct PathStep {
    /// `None` only for an optional missing last component.
    pub node: Option<DagNode>,
    /// Entry name in the parent; `None` for the root step.
    pub name: Option<String>,
    /// Path from the root down to this step, canonical.
    pub path: String,
    pub inherit: CopyInherit,
}

/// The walked chain from the root down to a path's leaf; `steps[0]` is the
/// root directory.
pub(crate) struct ParentPath {
    pub steps: Vec<PathStep>,
}

impl ParentPath {
    pub fn leaf(&self) -> &PathStep {
        self.steps.last().expect("walk has at least the root step")
    }

    pub fn leaf_node(&self) -> Option<&DagNode> {
        self.leaf().node.as_ref()
    }

    /// The step holding the leaf's parent directory, if the leaf is not the
    /// root itself.
    pub fn parent_of_leaf(&self) -> Option<&PathStep> {
        (self.steps.len() >= 2).then(|| &self.steps[self.steps.len() - 2])
    }
}

/// Decide how a not-yet-mutable `child` (walked via `path`, under `parent`)
/// would inherit a copy id if made mutable in `txn_id`.
fn get_copy_inheritance(
    trail: &Trail<'_>,
    parent: &DagNode,
    child: &DagNode,
    path: &str,
    txn_id: &TxnId,
) -> FsResult<CopyInherit> {
    if child.id.txn_id() == txn_id {
        return Ok(CopyInherit::ThisNode);
    }
    let child_copy = child.id.copy_id();
    if child_copy.is_zero() || child_copy == parent.id.copy_id() {
        return Ok(CopyInherit::Parent);
    }
    // The child carries a copy id of its own. If that copy's destination is
    // a different line of history, the branch point is above us and the
    // parent's decision rules.
    let copy = copies::get_copy(trail, child_copy)?;
    if !copy.dst_noderev.same_node(&child.id) {
        return Ok(CopyInherit::Parent);
    }
    // Accessed via its original path, the node keeps its own copy id; via
    // any other path it is a nested branched node and needs a new one.
    if child.rec.created_path == path {
        Ok(CopyInherit::ThisNode)
    } else {
        Ok(CopyInherit::New(child.rec.created_path.clone()))
    }
}

/// Walk `path` from the root, yielding a [`ParentPath`]. With
/// `last_optional`, a missing final component yields a trailing step with no
/// node instead of `NotFound`.
pub(crate) fn open_path(
    trail: &Trail<'_>,
    root: &Root,
    path: &str,
    last_optional: bool,
) -> FsResult<ParentPath> {
    let canon = canonicalize_path(path);
    let txn_id = root.walk_txn_id(trail)?;
    let here = root.root_node(trail)?;
    let mut steps = vec![PathStep {
        node: Some(here),
        name: None,
        path: "/".to_string(),
        inherit: CopyInherit::ThisNode,
    }];

    let parts: Vec<&str> = components(&canon).collect();
    for (i, name) in parts.iter().enumerate() {
        let is_last = i + 1 == parts.len();
        let here = steps
            .last()
            .and_then(|s| s.node.clone())
            .expect("intermediate steps always have nodes");
        if !here.is_dir() {
            return Err(Error::NotDirectory { path: steps.last().unwrap().path.clone() });
        }
        let path_so_far = join_path(&steps.last().unwrap().path, name);
        let child = match root.cache_get(&path_so_far) {
            Some(node) => Some(node),
            None => match dag::open_child(trail, &here, name) {
                Ok(node) => {
                    root.cache_set(&path_so_far, &node);
                    Some(node)
                }
                Err(Error::NoSuchEntry { .. }) if last_optional && is_last => None,
                Err(Error::NoSuchEntry { .. }) => return Err(Error::not_found(&canon)),
                Err(e) => return Err(e),
            },
        };
        let inherit = match &child {
            Some(node) => get_copy_inheritance(trail, &here, node, &path_so_far, &txn_id)?,
            None => CopyInherit::ThisNode,
        };
        steps.push(PathStep {
            node: child,
            name: Some(name.to_string()),
            path: path_so_far,
            inherit,
        });
    }
    Ok(ParentPath { steps })
}

/// Open the node at `path` or fail with `NotFound`.
pub(crate) fn get_dag(trail: &Trail<'_>, root: &Root, path: &str) -> FsResult<DagNode> {
    let walk = open_path(trail, root, path, false)?;
    walk.leaf_node()
        .cloned()
        .ok_or_else(|| Error::not_found(canonicalize_path(path)))
}

/// Clone the spine so the node at the walk's leaf belongs to the root's txn.
/// Newly minted soft copy ids get a copy record and a note in the txn.
pub(crate) fn make_path_mutable(
    trail: &mut Trail<'_>,
    root: &Root,
    walk: &mut ParentPath,
    step_index: usize,
) -> FsResult<()> {
    let txn_id = root.require_txn()?.clone();
    let node = walk.steps[step_index]
        .node
        .clone()
        .expect("make_path_mutable on an existing node");
    if node.is_mutable(&txn_id) {
        return Ok(());
    }

    let clone = if step_index == 0 {
        dag::clone_root(trail, &txn_id)?
    } else {
        make_path_mutable(trail, root, walk, step_index - 1)?;
        let parent = walk.steps[step_index - 1].node.clone().expect("parent exists");
        let name = walk.steps[step_index].name.clone().expect("non-root step has a name");
        let child_path = walk.steps[step_index].path.clone();

        let (copy_id, soft_src) = match &walk.steps[step_index].inherit {
            CopyInherit::ThisNode => (None, None),
            CopyInherit::Parent => (Some(parent.id.copy_id().clone()), None),
            CopyInherit::New(src_path) => {
                let id = copies::reserve_copy_id(trail)?;
                (Some(id), Some(src_path.clone()))
            }
        };
        let old_child_txn = node.id.txn_id().clone();
        let clone =
            dag::clone_child(trail, &parent, &name, copy_id.as_ref(), &child_path, &txn_id)?;
        if let Some(src_path) = soft_src {
            let copy_id = clone.id.copy_id().clone();
            copies::put_copy(
                trail,
                &copy_id,
                &copies::CopyRecord {
                    kind: copies::CopyKind::Soft,
                    src_path,
                    src_txn: old_child_txn,
                    dst_noderev: clone.id.clone(),
                },
            );
            txns::add_txn_copy(trail, &txn_id, &copy_id)?;
        }
        clone
    };
    walk.steps[step_index].node = Some(clone);
    walk.steps[step_index].inherit = CopyInherit::ThisNode;
    root.invalidate_on_completion(trail);
    Ok(())
}

fn make_leaf_mutable(trail: &mut Trail<'_>, root: &Root, walk: &mut ParentPath) -> FsResult<()> {
    let leaf = walk.steps.len() - 1;
    make_path_mutable(trail, root, walk, leaf)
}

// ---------- change bookkeeping ----------

#[allow(clippy::too_many_arguments)]
fn add_change(
    trail: &mut Trail<'_>,
    txn_id: &TxnId,
    path: &str,
    noderev: &NodeRevId,
    kind: ChangeKind,
    text_mod: bool,
    prop_mod: bool,
) {
    changes::add_change(
        trail,
        txn_id,
        &ChangeRecord {
            path: path.to_string(),
            noderev: Some(noderev.clone()),
            kind,
            text_mod,
            prop_mod,
        },
    );
}

// ---------- read operations ----------

impl Root {
    /// The kind of the node at `path`, or `None` if nothing is there.
    pub fn check_path(&self, path: &str) -> FsResult<Option<NodeKind>> {
        retry_txn(&self.fs.db, |trail| match get_dag(trail, self, path) {
            Ok(node) => Ok(Some(node.kind())),
            Err(Error::NotFound { .. }) | Err(Error::NotDirectory { .. }) => Ok(None),
            Err(e) => Err(e),
        })
    }

    pub fn node_id(&self, path: &str) -> FsResult<NodeRevId> {
        retry_txn(&self.fs.db, |trail| Ok(get_dag(trail, self, path)?.id))
    }

    /// The revision that committed the node at `path`; `None` while it is
    /// still mutable in a txn.
    pub fn node_created_rev(&self, path: &str) -> FsResult<Option<Revision>> {
        retry_txn(&self.fs.db, |trail| Ok(get_dag(trail, self, path)?.rec.created_rev))
    }

    pub fn node_created_path(&self, path: &str) -> FsResult<String> {
        retry_txn(&self.fs.db, |trail| Ok(get_dag(trail, self, path)?.rec.created_path))
    }

    pub fn node_proplist(&self, path: &str) -> FsResult<Proplist> {
        retry_txn(&self.fs.db, |trail| {
            let node = get_dag(trail, self, path)?;
            dag::get_proplist(trail, &node)
        })
    }

    pub fn node_prop(&self, path: &str, name: &str) -> FsResult<Option<Vec<u8>>> {
        Ok(self.node_proplist(path)?.remove(name))
    }

    pub fn dir_entries(&self, path: &str) -> FsResult<BTreeMap<String, Dirent>> {
        retry_txn(&self.fs.db, |trail| {
            let node = get_dag(trail, self, path)?;
            if !node.is_dir() {
                return Err(Error::NotDirectory { path: canonicalize_path(path) });
            }
            let mut out = BTreeMap::new();
            for (name, id) in dag::dir_entries(trail, &node)? {
                let kind = dag::get_node(trail, &id)?.kind();
                out.insert(name, Dirent { id, kind });
            }
            Ok(out)
        })
    }

    pub fn file_length(&self, path: &str) -> FsResult<u64> {
        retry_txn(&self.fs.db, |trail| {
            let node = get_dag(trail, self, path)?;
            ensure_file(&node, path)?;
            dag::file_length(trail, &node)
        })
    }

    pub fn file_md5_checksum(&self, path: &str) -> FsResult<[u8; 16]> {
        retry_txn(&self.fs.db, |trail| {
            let node = get_dag(trail, self, path)?;
            ensure_file(&node, path)?;
            dag::file_md5(trail, &node)
        })
    }

    /// The file's entire contents.
    pub fn file_contents(&self, path: &str) -> FsResult<Vec<u8>> {
        retry_txn(&self.fs.db, |trail| {
            let node = get_dag(trail, self, path)?;
            ensure_file(&node, path)?;
            let len = dag::file_length(trail, &node)?;
            dag::file_read(trail, &node, 0, len as usize)
        })
    }

    /// A trail-independent read stream over the file's contents; each chunk
    /// read runs in its own trail.
    pub fn file_contents_stream(&self, path: &str) -> FsResult<FileContents> {
        let (node, size) = retry_txn(&self.fs.db, |trail| {
            let node = get_dag(trail, self, path)?;
            ensure_file(&node, path)?;
            let size = dag::file_length(trail, &node)?;
            Ok((node, size))
        })?;
        Ok(FileContents { root: self.clone(), rep: node.rec.data_key, size, pos: 0 })
    }

    /// True when the two paths' property reps differ (rep-key comparison,
    /// not a byte-level diff).
    pub fn props_changed(&self, path: &str, other: &Root, other_path: &str) -> FsResult<bool> {
        let a = retry_txn(&self.fs.db, |trail| Ok(get_dag(trail, self, path)?.rec.prop_key))?;
        let b = retry_txn(
            &other.fs.db,
            |trail| Ok(get_dag(trail, other, other_path)?.rec.prop_key),
        )?;
        Ok(a != b)
    }

    /// True when the two paths' data reps differ (rep-key comparison).
    pub fn contents_changed(&self, path: &str, other: &Root, other_path: &str) -> FsResult<bool> {
        let a = retry_txn(&self.fs.db, |trail| Ok(get_dag(trail, self, path)?.rec.data_key))?;
        let b = retry_txn(
            &other.fs.db,
            |trail| Ok(get_dag(trail, other, other_path)?.rec.data_key),
        )?;
        Ok(a != b)
    }

    /// The `(revision, path)` a copied node was copied from.
    pub fn copied_from(&self, path: &str) -> FsResult<Option<(Revision, String)>> {
        retry_txn(&self.fs.db, |trail| Ok(dag::copied_from(&get_dag(trail, self, path)?)))
    }
}

fn ensure_file(node: &DagNode, path: &str) -> FsResult<()> {
    match node.kind() {
        NodeKind::File => Ok(()),
        NodeKind::Dir => Err(Error::NotFile { path: canonicalize_path(path) }),
    }
}

/// Streaming file reader; see [`Root::file_contents_stream`].
pub struct FileContents {
    root: Root,
    rep: Option<RepId>,
    size: u64,
    pos: u64,
}

impl FileContents {
    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Read up to `len` bytes from the current position; empty at EOF.
    pub fn read_chunk(&mut self, len: usize) -> FsResult<Vec<u8>> {
        if self.pos >= self.size {
            return Ok(Vec::new());
        }
        let rep = match &self.rep {
            None => return Ok(Vec::new()),
            Some(rep) => rep.clone(),
        };
        let pos = self.pos;
        let chunk =
            retry_txn(&self.root.fs.db, move |trail| reps::read_range(trail, &rep, pos, len))?;
        self.pos += chunk.len() as u64;
        Ok(chunk)
    }
}

impl std::io::Read for FileContents {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let chunk = self
            .read_chunk(buf.len())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }
}

// ---------- write operations ----------

impl Root {
    pub fn make_dir(&self, path: &str) -> FsResult<()> {
        self.make_node(path, NodeKind::Dir)
    }

    pub fn make_file(&self, path: &str) -> FsResult<()> {
        self.make_node(path, NodeKind::File)
    }

    fn make_node(&self, path: &str, kind: NodeKind) -> FsResult<()> {
        let txn_id = self.require_txn()?.clone();
        let canon = canonicalize_path(path);
        self.fs.allow_locked_operation(&canon, false)?;
        retry_txn(&self.fs.db, |trail| {
            let mut walk = open_path(trail, self, &canon, true)?;
            let name = match walk.leaf().name.clone() {
                None => return Err(Error::RootDir),
                Some(name) => name,
            };
            if walk.leaf_node().is_some() {
                let parent = walk.parent_of_leaf().map(|s| s.path.clone()).unwrap_or_default();
                return Err(Error::AlreadyExists { path: parent, name });
            }
            let parent_index = walk.steps.len() - 2;
            make_path_mutable(trail, self, &mut walk, parent_index)?;
            let parent = walk.steps[parent_index].node.clone().expect("parent exists");
            let node = dag::make_child(trail, &parent, &name, kind, &canon, &txn_id)?;
            add_change(trail, &txn_id, &canon, &node.id, ChangeKind::Add, false, false);
            self.invalidate_on_completion(trail);
            Ok(())
        })
    }

    pub fn delete(&self, path: &str) -> FsResult<()> {
        let txn_id = self.require_txn()?.clone();
        let canon = canonicalize_path(path);
        self.fs.allow_locked_operation(&canon, true)?;
        retry_txn(&self.fs.db, |trail| {
            let mut walk = open_path(trail, self, &canon, false)?;
            if walk.steps.len() < 2 {
                return Err(Error::RootDir);
            }
            let deleted_id = walk.leaf_node().expect("leaf exists").id.clone();
            let name = walk.leaf().name.clone().expect("non-root leaf has a name");
            let parent_index = walk.steps.len() - 2;
            make_path_mutable(trail, self, &mut walk, parent_index)?;
            let parent = walk.steps[parent_index].node.clone().expect("parent exists");
            dag::delete_entry(trail, &parent.id, &name, &txn_id)?;
            add_change(trail, &txn_id, &canon, &deleted_id, ChangeKind::Delete, false, false);
            self.invalidate_on_completion(trail);
            Ok(())
        })
    }

    /// Copy `from_path`@`from_root` (a revision root) to `to_path` in this
    /// txn, preserving history. Copying a node onto an entry that already
    /// resolves to the same node-revision is a no-op.
    pub fn copy(&self, from_root: &Root, from_path: &str, to_path: &str) -> FsResult<()> {
        self.copy_helper(from_root, from_path, to_path, true)
    }

    /// Like [`Root::copy`] but without history: the entry just links to the
    /// existing node-revision.
    pub fn revision_link(&self, from_root: &Root, from_path: &str, to_path: &str) -> FsResult<()> {
        self.copy_helper(from_root, from_path, to_path, false)
    }

    fn copy_helper(
        &self,
        from_root: &Root,
        from_path: &str,
        to_path: &str,
        preserve_history: bool,
    ) -> FsResult<()> {
        let txn_id = self.require_txn()?.clone();
        let from_rev = from_root.revision().ok_or(Error::NotRevisionRoot)?;
        let from_canon = canonicalize_path(from_path);
        let to_canon = canonicalize_path(to_path);
        self.fs.allow_locked_operation(&to_canon, true)?;
        retry_txn(&self.fs.db, |trail| {
            let from_node = get_dag(trail, from_root, &from_canon)?;
            let mut walk = open_path(trail, self, &to_canon, true)?;
            let name = match walk.leaf().name.clone() {
                None => return Err(Error::RootDir),
                Some(name) => name,
            };
            // Re-copying the same node over itself changes nothing; this is
            // what makes a nested copy inside an already-copied tree a no-op.
            if let Some(existing) = walk.leaf_node() {
                if existing.id == from_node.id {
                    trace!(
                        target: "revfs::tree",
                        "copy of '{}' to '{}' is a no-op", from_canon, to_canon
                    );
                    return Ok(());
                }
            }
            let existed = walk.leaf_node().is_some();
            let parent_index = walk.steps.len() - 2;
            make_path_mutable(trail, self, &mut walk, parent_index)?;
            let parent = walk.steps[parent_index].node.clone().expect("parent exists");
            let new_id = dag::copy(
                trail,
                &parent,
                &name,
                &from_node,
                preserve_history,
                from_rev,
                &from_canon,
                &to_canon,
                &txn_id,
            )?;
            let kind = if existed { ChangeKind::Replace } else { ChangeKind::Add };
            add_change(trail, &txn_id, &to_canon, &new_id, kind, false, false);
            self.invalidate_on_completion(trail);
            Ok(())
        })
    }

    /// Set (or with `None`, remove) one property of the node at `path`.
    pub fn change_node_prop(
        &self,
        path: &str,
        name: &str,
        value: Option<Vec<u8>>,
    ) -> FsResult<()> {
        let txn_id = self.require_txn()?.clone();
        let canon = canonicalize_path(path);
        self.fs.allow_locked_operation(&canon, false)?;
        retry_txn(&self.fs.db, |trail| {
            let mut walk = open_path(trail, self, &canon, false)?;
            make_leaf_mutable(trail, self, &mut walk)?;
            let node = walk.leaf_node().expect("leaf exists").clone();
            let mut props = dag::get_proplist(trail, &node)?;
            match &value {
                Some(v) => props.insert(name.to_string(), v.clone()),
                None => props.remove(name),
            };
            dag::set_proplist(trail, &node.id, &props, &txn_id)?;
            add_change(trail, &txn_id, &canon, &node.id, ChangeKind::Modify, false, true);
            self.invalidate_on_completion(trail);
            Ok(())
        })
    }

    /// Replace the file's contents wholesale, validating `result_md5` when
    /// given.
    pub fn apply_text(
        &self,
        path: &str,
        result_md5: Option<[u8; 16]>,
        text: &[u8],
    ) -> FsResult<()> {
        let txn_id = self.require_txn()?.clone();
        let canon = canonicalize_path(path);
        self.fs.allow_locked_operation(&canon, false)?;
        retry_txn(&self.fs.db, |trail| {
            let mut walk = open_path(trail, self, &canon, false)?;
            make_leaf_mutable(trail, self, &mut walk)?;
            let node = walk.leaf_node().expect("leaf exists").clone();
            ensure_file(&node, &canon)?;
            let edit = dag::begin_edit(trail, &node.id, &txn_id)?;
            reps::append_contents(trail, &edit, text)?;
            dag::finalize_edits(trail, &node.id, result_md5, &txn_id)?;
            add_change(trail, &txn_id, &canon, &node.id, ChangeKind::Modify, true, false);
            self.invalidate_on_completion(trail);
            Ok(())
        })
    }

    /// Start a delta-driven edit of the file at `path`. The current contents
    /// are the delta source; windows pushed at the returned applier build
    /// the new contents. `base_md5`, when given, must match the current
    /// contents.
    pub fn apply_textdelta(
        &self,
        path: &str,
        base_md5: Option<[u8; 16]>,
        result_md5: Option<[u8; 16]>,
    ) -> FsResult<TextDeltaApplier> {
        let txn_id = self.require_txn()?.clone();
        let canon = canonicalize_path(path);
        self.fs.allow_locked_operation(&canon, false)?;
        let (node_id, edit, source) = retry_txn(&self.fs.db, |trail| {
            let mut walk = open_path(trail, self, &canon, false)?;
            make_leaf_mutable(trail, self, &mut walk)?;
            let node = walk.leaf_node().expect("leaf exists").clone();
            ensure_file(&node, &canon)?;
            if let Some(expected) = base_md5 {
                let actual = dag::file_md5(trail, &node)?;
                if actual != expected {
                    return Err(Error::ChecksumMismatch {
                        context: canon.clone(),
                        expected: reps::hex(&expected),
                        actual: reps::hex(&actual),
                    });
                }
            }
            let source = node.rec.data_key.clone();
            let edit = dag::begin_edit(trail, &node.id, &txn_id)?;
            self.invalidate_on_completion(trail);
            Ok((node.id.clone(), edit, source))
        })?;
        Ok(TextDeltaApplier {
            root: self.clone(),
            txn_id,
            path: canon,
            node_id,
            edit,
            source,
            result_md5,
            done: false,
        })
    }
}

/// Window consumer returned by [`Root::apply_textdelta`]. Push windows in
/// order; push `None` to finish, which installs the edit as the file's
/// contents (validating the promised result checksum) and records the
/// change.
pub struct TextDeltaApplier {
    root: Root,
    txn_id: TxnId,
    path: String,
    node_id: NodeRevId,
    edit: RepId,
    source: Option<RepId>,
    result_md5: Option<[u8; 16]>,
    done: bool,
}

impl TextDeltaApplier {
    pub fn apply_window(&mut self, window: Option<&delta::Window>) -> FsResult<()> {
        if self.done {
            return Err(Error::corrupt("window handler called after the final window"));
        }
        match window {
            Some(w) => {
                let source = self.source.clone();
                let edit = self.edit.clone();
                let sview_offset = w.sview_offset;
                let sview_len = w.sview_len as usize;
                let w = w.clone();
                retry_txn(&self.root.fs.db, move |trail| {
                    let sview = match (&source, sview_len) {
                        (_, 0) => Vec::new(),
                        (None, _) => Vec::new(),
                        (Some(rep), _) => reps::read_range(trail, rep, sview_offset, sview_len)?,
                    };
                    let tview = w.apply(&sview)?;
                    reps::append_contents(trail, &edit, &tview)
                })
            }
            None => {
                self.done = true;
                let txn_id = self.txn_id.clone();
                let node_id = self.node_id.clone();
                let path = self.path.clone();
                let result_md5 = self.result_md5;
                let root = self.root.clone();
                retry_txn(&self.root.fs.db, move |trail| {
                    dag::finalize_edits(trail, &node_id, result_md5, &txn_id)?;
                    add_change(trail, &txn_id, &path, &node_id, ChangeKind::Modify, true, false);
                    root.invalidate_on_completion(trail);
                    Ok(())
                })
            }
        }
    }

    /// Convenience: feed a full window list and the terminating `None`.
    pub fn apply_windows(&mut self, windows: &[delta::Window]) -> FsResult<()> {
        for w in windows {
            self.apply_window(Some(w))?;
        }
        self.apply_window(None)
    }
}
