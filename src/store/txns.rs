//! The transaction store.
//!
//! Tracks active, committed and dead transactions: root and base-root ids,
//! the proplist, the copy ids minted inside the txn, and the state. The
//! record survives commit (state becomes `(committed rev)`) because copy
//! records reference source txn ids that the history engine later resolves
//! to revisions.

use super::{allocate_key, counters};
use crate::error::{Error, FsResult};
use crate::id::{CopyId, NodeRevId, Revision, TxnId};
use crate::kv::tables;
use crate::skel::{proplist_from_skel, proplist_to_skel, Proplist, Skel};
use crate::trail::Trail;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Dead,
    Committed(Revision),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnRecord {
    pub root_id: NodeRevId,
    pub base_root_id: NodeRevId,
    pub props: Proplist,
    pub copies: Vec<CopyId>,
    pub state: TxnState,
}

impl TxnRecord {
    fn to_skel(&self) -> Skel {
        Skel::list(vec![
            Skel::atom_str("transaction"),
            Skel::atom_str(&self.root_id.to_string()),
            Skel::atom_str(&self.base_root_id.to_string()),
            proplist_to_skel(&self.props),
            Skel::list(self.copies.iter().map(|c| Skel::atom_str(c.as_str())).collect()),
            match self.state {
                TxnState::Active => Skel::atom_str("active"),
                TxnState::Dead => Skel::atom_str("dead"),
                TxnState::Committed(rev) => Skel::list(vec![
                    Skel::atom_str("committed"),
                    Skel::atom_str(&rev.to_string()),
                ]),
            },
        ])
    }

    fn from_skel(skel: &Skel, id: &str) -> FsResult<TxnRecord> {
        let bad = || Error::corrupt(format!("malformed transaction record '{}'", id));
        let items = skel.as_list().ok_or_else(bad)?;
        if items.len() != 6 || !items[0].is_atom_str("transaction") {
            return Err(bad());
        }
        let copies = items[4]
            .as_list()
            .ok_or_else(bad)?
            .iter()
            .map(|s| s.as_str().map(CopyId::new).ok_or_else(bad))
            .collect::<FsResult<Vec<_>>>()?;
        let state = if items[5].is_atom_str("active") {
            TxnState::Active
        } else if items[5].is_atom_str("dead") {
            TxnState::Dead
        } else {
            let pair = items[5].as_list().ok_or_else(bad)?;
            if pair.len() != 2 || !pair[0].is_atom_str("committed") {
                return Err(bad());
            }
            TxnState::Committed(pair[1].as_str().and_then(|s| s.parse().ok()).ok_or_else(bad)?)
        };
        Ok(TxnRecord {
            root_id: NodeRevId::parse(items[1].as_str().ok_or_else(bad)?)?,
            base_root_id: NodeRevId::parse(items[2].as_str().ok_or_else(bad)?)?,
            props: proplist_from_skel(&items[3])?,
            copies,
            state,
        })
    }
}

/// Allocate a txn id and write the initial active record.
pub fn create_txn(trail: &mut Trail<'_>, base_root_id: &NodeRevId) -> FsResult<TxnId> {
    let id = TxnId::new(allocate_key(trail, counters::NEXT_TXN_ID)?);
    let rec = TxnRecord {
        root_id: base_root_id.clone(),
        base_root_id: base_root_id.clone(),
        props: Proplist::new(),
        copies: Vec::new(),
        state: TxnState::Active,
    };
    put_txn(trail, &id, &rec);
    Ok(id)
}

pub fn get_txn(trail: &Trail<'_>, id: &TxnId) -> FsResult<TxnRecord> {
    let bytes = trail
        .txn
        .get(tables::TRANSACTIONS, id.as_str().as_bytes())
        .ok_or_else(|| Error::NoSuchTransaction { id: id.as_str().to_string() })?;
    TxnRecord::from_skel(&Skel::parse(&bytes)?, id.as_str())
}

/// Like [`get_txn`], but only for transactions that can still be written.
pub fn get_active_txn(trail: &Trail<'_>, id: &TxnId) -> FsResult<TxnRecord> {
    let rec = get_txn(trail, id)?;
    match rec.state {
        TxnState::Active => Ok(rec),
        _ => Err(Error::TxnNotMutable { id: id.as_str().to_string() }),
    }
}

pub fn put_txn(trail: &mut Trail<'_>, id: &TxnId, rec: &TxnRecord) {
    trail
        .txn
        .put(tables::TRANSACTIONS, id.as_str().as_bytes(), rec.to_skel().unparse());
}

pub fn delete_txn(trail: &mut Trail<'_>, id: &TxnId) -> FsResult<()> {
    get_txn(trail, id)?;
    trail.txn.delete(tables::TRANSACTIONS, id.as_str().as_bytes());
    Ok(())
}

pub fn set_txn_root(trail: &mut Trail<'_>, id: &TxnId, root: &NodeRevId) -> FsResult<()> {
    let mut rec = get_active_txn(trail, id)?;
    rec.root_id = root.clone();
    put_txn(trail, id, &rec);
    Ok(())
}

pub fn set_txn_base(trail: &mut Trail<'_>, id: &TxnId, base_root: &NodeRevId) -> FsResult<()> {
    let mut rec = get_active_txn(trail, id)?;
    rec.base_root_id = base_root.clone();
    put_txn(trail, id, &rec);
    Ok(())
}

/// Record a copy id minted inside the txn.
pub fn add_txn_copy(trail: &mut Trail<'_>, id: &TxnId, copy: &CopyId) -> FsResult<()> {
    let mut rec = get_active_txn(trail, id)?;
    if !rec.copies.contains(copy) {
        rec.copies.push(copy.clone());
        put_txn(trail, id, &rec);
    }
    Ok(())
}

/// The revision a committed txn produced.
pub fn txn_get_revision(trail: &Trail<'_>, id: &TxnId) -> FsResult<Option<Revision>> {
    match get_txn(trail, id)?.state {
        TxnState::Committed(rev) => Ok(Some(rev)),
        _ => Ok(None),
    }
}

/// Ids of every transaction still in the active state.
pub fn list_active_txns(trail: &Trail<'_>) -> FsResult<Vec<TxnId>> {
    let mut out = Vec::new();
    for key in trail.txn.scan_prefix(tables::TRANSACTIONS, b"") {
        let id = TxnId::new(String::from_utf8_lossy(&key).into_owned());
        if matches!(get_txn(trail, &id)?.state, TxnState::Active) {
            out.push(id);
        }
    }
    Ok(out)
}
