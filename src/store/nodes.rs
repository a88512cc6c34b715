//! The node-revision store.
//!
//! One record per node-revision, keyed by the `<node>.<copy>.<txn>` id.
//! The header carries kind, the committed revision (empty while the node is
//! still mutable), the created path, the predecessor link and count, and the
//! copy root when the node is a copy destination. The body carries the
//! property and data rep keys plus the transient edit key on files mid-write.

use super::{allocate_key, counters};
use crate::error::{Error, FsResult};
use crate::id::{CopyId, NodeId, NodeRevId, RepId, Revision, TxnId};
use crate::kv::tables;
use crate::skel::Skel;
use crate::trail::Trail;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Dir => "dir",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRevision {
    pub kind: NodeKind,
    /// The revision that committed this node-revision; `None` while mutable.
    pub created_rev: Option<Revision>,
    /// The canonical path this node-revision was created at.
    pub created_path: String,
    pub predecessor: Option<NodeRevId>,
    /// `-1` when unknown, else `1 + predecessor.predecessor_count`.
    pub predecessor_count: i64,
    /// `(revision, path)` of the copy root when this node heads a copy.
    pub copy_root: Option<(Revision, String)>,
    pub prop_key: Option<RepId>,
    pub data_key: Option<RepId>,
    /// Present only while a file edit is in progress.
    pub edit_key: Option<RepId>,
}

impl NodeRevision {
    pub fn new_dir(created_path: impl Into<String>) -> Self {
        NodeRevision {
            kind: NodeKind::Dir,
            created_rev: None,
            created_path: created_path.into(),
            predecessor: None,
            predecessor_count: 0,
            copy_root: None,
            prop_key: None,
            data_key: None,
            edit_key: None,
        }
    }

    pub fn new_file(created_path: impl Into<String>) -> Self {
        NodeRevision { kind: NodeKind::File, ..NodeRevision::new_dir(created_path) }
    }

    fn to_skel(&self) -> Skel {
        let mut header = vec![
            Skel::atom_str(self.kind.as_str()),
            match self.created_rev {
                Some(rev) => Skel::atom_str(&rev.to_string()),
                None => Skel::empty_atom(),
            },
            Skel::atom_str(&self.created_path),
            match &self.predecessor {
                Some(id) => Skel::atom_str(&id.to_string()),
                None => Skel::empty_atom(),
            },
            Skel::atom_str(&self.predecessor_count.to_string()),
        ];
        if let Some((rev, path)) = &self.copy_root {
            header.push(Skel::atom_str(&rev.to_string()));
            header.push(Skel::atom_str(path));
        }
        let rep_atom = |key: &Option<RepId>| match key {
            Some(id) => Skel::atom_str(id.as_str()),
            None => Skel::empty_atom(),
        };
        let mut items = vec![
            Skel::list(header),
            rep_atom(&self.prop_key),
            rep_atom(&self.data_key),
        ];
        if self.edit_key.is_some() {
            items.push(rep_atom(&self.edit_key));
        }
        Skel::list(items)
    }

    fn from_skel(skel: &Skel, id: &str) -> FsResult<NodeRevision> {
        let bad = || Error::corrupt(format!("malformed node-revision '{}'", id));
        let items = skel.as_list().ok_or_else(bad)?;
        if items.len() != 3 && items.len() != 4 {
            return Err(bad());
        }
        let header = items[0].as_list().ok_or_else(bad)?;
        if header.len() != 5 && header.len() != 7 {
            return Err(bad());
        }
        let kind = match header[0].as_str().ok_or_else(bad)? {
            "file" => NodeKind::File,
            "dir" => NodeKind::Dir,
            _ => return Err(bad()),
        };
        let created_rev = match header[1].as_atom().ok_or_else(bad)? {
            b if b.is_empty() => None,
            b => Some(
                std::str::from_utf8(b)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(bad)?,
            ),
        };
        let created_path = header[2].as_str().ok_or_else(bad)?.to_string();
        let predecessor = match header[3].as_atom().ok_or_else(bad)? {
            b if b.is_empty() => None,
            b => Some(NodeRevId::parse(std::str::from_utf8(b).map_err(|_| bad())?)?),
        };
        let predecessor_count: i64 = header[4]
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(bad)?;
        let copy_root = if header.len() == 7 {
            let rev: Revision = header[5].as_str().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
            let path = header[6].as_str().ok_or_else(bad)?.to_string();
            Some((rev, path))
        } else {
            None
        };
        let rep_key = |skel: &Skel| -> FsResult<Option<RepId>> {
            match skel.as_str().ok_or_else(bad)? {
                "" => Ok(None),
                key => Ok(Some(RepId::new(key))),
            }
        };
        Ok(NodeRevision {
            kind,
            created_rev,
            created_path,
            predecessor,
            predecessor_count,
            copy_root,
            prop_key: rep_key(&items[1])?,
            data_key: rep_key(&items[2])?,
            edit_key: match items.get(3) {
                Some(s) => rep_key(s)?,
                None => None,
            },
        })
    }
}

pub fn get_node_revision(trail: &Trail<'_>, id: &NodeRevId) -> FsResult<NodeRevision> {
    let bytes = trail
        .txn
        .get(tables::NODES, id.to_string().as_bytes())
        .ok_or_else(|| Error::NoSuchNodeRevision { id: id.to_string() })?;
    NodeRevision::from_skel(&Skel::parse(&bytes)?, &id.to_string())
}

pub fn put_node_revision(trail: &mut Trail<'_>, id: &NodeRevId, rec: &NodeRevision) {
    trail
        .txn
        .put(tables::NODES, id.to_string().as_bytes(), rec.to_skel().unparse());
}

pub fn delete_node_revision(trail: &mut Trail<'_>, id: &NodeRevId) -> FsResult<()> {
    if !trail.txn.exists(tables::NODES, id.to_string().as_bytes()) {
        return Err(Error::NoSuchNodeRevision { id: id.to_string() });
    }
    trail.txn.delete(tables::NODES, id.to_string().as_bytes());
    Ok(())
}

/// Allocate a brand-new node id and compose it with `copy` and `txn`.
pub fn new_node_id(trail: &mut Trail<'_>, copy: &CopyId, txn: &TxnId) -> FsResult<NodeRevId> {
    let node = allocate_key(trail, counters::NEXT_NODE_ID)?;
    Ok(NodeRevId::new(NodeId::new(node), copy.clone(), txn.clone()))
}

/// A successor id: same node, the given copy id (or the old one when
/// `copy` is `None`), the given txn.
pub fn new_successor_id(old: &NodeRevId, copy: Option<&CopyId>, txn: &TxnId) -> NodeRevId {
    NodeRevId::new(
        old.node_id().clone(),
        copy.cloned().unwrap_or_else(|| old.copy_id().clone()),
        txn.clone(),
    )
}
