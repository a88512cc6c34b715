//! The copy store.
//!
//! One record per copy id: the copy kind (`real` for explicit copies, `soft`
//! for implicit branch points minted by copy-id inheritance), the source
//! path and source txn id, and the destination node-revision.

use super::{allocate_key, counters};
use crate::error::{Error, FsResult};
use crate::id::{CopyId, NodeRevId, TxnId};
use crate::kv::tables;
use crate::skel::Skel;
use crate::trail::Trail;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyKind {
    Real,
    Soft,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRecord {
    pub kind: CopyKind,
    pub src_path: String,
    pub src_txn: TxnId,
    pub dst_noderev: NodeRevId,
}

impl CopyRecord {
    fn to_skel(&self) -> Skel {
        Skel::list(vec![
            Skel::atom_str("copy"),
            Skel::atom_str(match self.kind {
                CopyKind::Real => "real",
                CopyKind::Soft => "soft",
            }),
            Skel::atom_str(&self.src_path),
            Skel::atom_str(self.src_txn.as_str()),
            Skel::atom_str(&self.dst_noderev.to_string()),
        ])
    }

    fn from_skel(skel: &Skel, key: &str) -> FsResult<CopyRecord> {
        let bad = || Error::corrupt(format!("malformed copy record '{}'", key));
        let items = skel.as_list().ok_or_else(bad)?;
        if items.len() != 5 || !items[0].is_atom_str("copy") {
            return Err(bad());
        }
        let kind = match items[1].as_str().ok_or_else(bad)? {
            "real" => CopyKind::Real,
            "soft" => CopyKind::Soft,
            _ => return Err(bad()),
        };
        Ok(CopyRecord {
            kind,
            src_path: items[2].as_str().ok_or_else(bad)?.to_string(),
            src_txn: TxnId::new(items[3].as_str().ok_or_else(bad)?),
            dst_noderev: NodeRevId::parse(items[4].as_str().ok_or_else(bad)?)?,
        })
    }
}

pub fn reserve_copy_id(trail: &mut Trail<'_>) -> FsResult<CopyId> {
    // Copy id "0" is the no-copy sentinel; the counter starts above it.
    let mut key = allocate_key(trail, counters::NEXT_COPY_ID)?;
    if key == "0" {
        key = allocate_key(trail, counters::NEXT_COPY_ID)?;
    }
    Ok(CopyId::new(key))
}

pub fn get_copy(trail: &Trail<'_>, id: &CopyId) -> FsResult<CopyRecord> {
    let bytes = trail
        .txn
        .get(tables::COPIES, id.as_str().as_bytes())
        .ok_or_else(|| Error::NoSuchCopy { key: id.as_str().to_string() })?;
    CopyRecord::from_skel(&Skel::parse(&bytes)?, id.as_str())
}

pub fn put_copy(trail: &mut Trail<'_>, id: &CopyId, rec: &CopyRecord) {
    trail
        .txn
        .put(tables::COPIES, id.as_str().as_bytes(), rec.to_skel().unparse());
}

pub fn delete_copy(trail: &mut Trail<'_>, id: &CopyId) -> FsResult<()> {
    get_copy(trail, id)?;
    trail.txn.delete(tables::COPIES, id.as_str().as_bytes());
    Ok(())
}
