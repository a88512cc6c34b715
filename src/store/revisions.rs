//! The revision store.
//!
//! One record per committed revision: the root node-revision id and the
//! revision proplist. Keys are fixed-width decimals so byte order equals
//! numeric order and the youngest revision is the table's last key.

use crate::error::{Error, FsResult};
use crate::id::{NodeRevId, Revision, TxnId};
use crate::kv::tables;
use crate::skel::{proplist_from_skel, proplist_to_skel, Proplist, Skel};
use crate::trail::Trail;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionRecord {
    pub root_id: NodeRevId,
    pub props: Proplist,
}

fn rev_key(rev: Revision) -> Vec<u8> {
    format!("{:020}", rev).into_bytes()
}

impl RevisionRecord {
    fn to_skel(&self) -> Skel {
        Skel::list(vec![
            Skel::atom_str("revision"),
            Skel::atom_str(&self.root_id.to_string()),
            proplist_to_skel(&self.props),
        ])
    }

    fn from_skel(skel: &Skel, rev: Revision) -> FsResult<RevisionRecord> {
        let bad = || Error::corrupt(format!("malformed revision record {}", rev));
        let items = skel.as_list().ok_or_else(bad)?;
        if items.len() != 3 || !items[0].is_atom_str("revision") {
            return Err(bad());
        }
        Ok(RevisionRecord {
            root_id: NodeRevId::parse(items[1].as_str().ok_or_else(bad)?)?,
            props: proplist_from_skel(&items[2])?,
        })
    }
}

pub fn get_revision(trail: &Trail<'_>, rev: Revision) -> FsResult<RevisionRecord> {
    let bytes = trail
        .txn
        .get(tables::REVISIONS, &rev_key(rev))
        .ok_or(Error::NoSuchRevision { rev })?;
    RevisionRecord::from_skel(&Skel::parse(&bytes)?, rev)
}

pub fn put_revision(trail: &mut Trail<'_>, rev: Revision, rec: &RevisionRecord) {
    trail
        .txn
        .put(tables::REVISIONS, &rev_key(rev), rec.to_skel().unparse());
}

/// The youngest committed revision. Every filesystem has at least rev 0.
pub fn youngest_rev(trail: &Trail<'_>) -> FsResult<Revision> {
    let key = trail
        .txn
        .last_key(tables::REVISIONS)
        .ok_or_else(|| Error::corrupt("revisions table is empty"))?;
    std::str::from_utf8(&key)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::corrupt("malformed revision key"))
}

/// Append a new revision record under the next revision number.
pub fn allocate_revision(trail: &mut Trail<'_>, rec: &RevisionRecord) -> FsResult<Revision> {
    let rev = match trail.txn.last_key(tables::REVISIONS) {
        Some(_) => youngest_rev(trail)? + 1,
        None => 0,
    };
    put_revision(trail, rev, rec);
    Ok(rev)
}

pub fn rev_get_root(trail: &Trail<'_>, rev: Revision) -> FsResult<NodeRevId> {
    Ok(get_revision(trail, rev)?.root_id)
}

/// The txn that produced `rev` (the txn segment of the revision's root id).
pub fn rev_get_txn_id(trail: &Trail<'_>, rev: Revision) -> FsResult<TxnId> {
    Ok(get_revision(trail, rev)?.root_id.txn_id().clone())
}
