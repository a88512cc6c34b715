//! The changes log.
//!
//! Every mutation inside a txn appends one change row under the txn's key in
//! the duplicate-key `changes` table. At commit the raw rows are folded in
//! place into a per-revision summary; [`fold_changes`] is a pure function
//! over the ordered row list and is idempotent, so re-folding a folded log
//! is a no-op.

use std::collections::HashMap;

use crate::error::{Error, FsResult};
use crate::id::{NodeRevId, TxnId};
use crate::kv::tables;
use crate::skel::Skel;
use crate::trail::Trail;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Delete,
    Replace,
    Modify,
    /// Cancels every earlier record on its path; never survives a fold.
    Reset,
}

impl ChangeKind {
    fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Add => "add",
            ChangeKind::Delete => "delete",
            ChangeKind::Replace => "replace",
            ChangeKind::Modify => "modify",
            ChangeKind::Reset => "reset",
        }
    }

    fn parse(s: &str) -> Option<ChangeKind> {
        match s {
            "add" => Some(ChangeKind::Add),
            "delete" => Some(ChangeKind::Delete),
            "replace" => Some(ChangeKind::Replace),
            "modify" => Some(ChangeKind::Modify),
            "reset" => Some(ChangeKind::Reset),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub path: String,
    pub noderev: Option<NodeRevId>,
    pub kind: ChangeKind,
    pub text_mod: bool,
    pub prop_mod: bool,
}

fn bool_atom(b: bool) -> Skel {
    Skel::atom_str(if b { "true" } else { "false" })
}

impl ChangeRecord {
    fn to_skel(&self) -> Skel {
        Skel::list(vec![
            Skel::atom_str("change"),
            Skel::atom_str(&self.path),
            match &self.noderev {
                Some(id) => Skel::atom_str(&id.to_string()),
                None => Skel::empty_atom(),
            },
            Skel::atom_str(self.kind.as_str()),
            bool_atom(self.text_mod),
            bool_atom(self.prop_mod),
        ])
    }

    fn from_skel(skel: &Skel) -> FsResult<ChangeRecord> {
        let bad = || Error::corrupt("malformed change record");
        let items = skel.as_list().ok_or_else(bad)?;
        if items.len() != 6 || !items[0].is_atom_str("change") {
            return Err(bad());
        }
        let noderev = match items[2].as_str().ok_or_else(bad)? {
            "" => None,
            s => Some(NodeRevId::parse(s)?),
        };
        let parse_bool = |s: &Skel| match s.as_str() {
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            _ => Err(bad()),
        };
        Ok(ChangeRecord {
            path: items[1].as_str().ok_or_else(bad)?.to_string(),
            noderev,
            kind: items[3].as_str().and_then(ChangeKind::parse).ok_or_else(bad)?,
            text_mod: parse_bool(&items[4])?,
            prop_mod: parse_bool(&items[5])?,
        })
    }
}

pub fn add_change(trail: &mut Trail<'_>, txn_id: &TxnId, rec: &ChangeRecord) {
    trail.txn.append_row(
        tables::CHANGES,
        txn_id.as_str().as_bytes(),
        rec.to_skel().unparse(),
    );
}

/// The raw, unfolded row list for a txn, in append order.
pub fn get_changes(trail: &Trail<'_>, txn_id: &TxnId) -> FsResult<Vec<ChangeRecord>> {
    let rows = trail
        .txn
        .get_rows(tables::CHANGES, txn_id.as_str().as_bytes())
        .unwrap_or_default();
    rows.iter()
        .map(|row| ChangeRecord::from_skel(&Skel::parse(row)?))
        .collect()
}

pub fn delete_changes(trail: &mut Trail<'_>, txn_id: &TxnId) {
    trail.txn.delete(tables::CHANGES, txn_id.as_str().as_bytes());
}

/// Replace the txn's rows with their folded form.
pub fn fold_txn_changes(trail: &mut Trail<'_>, txn_id: &TxnId) -> FsResult<()> {
    let folded = fold_changes(get_changes(trail, txn_id)?);
    trail.txn.put_rows(
        tables::CHANGES,
        txn_id.as_str().as_bytes(),
        folded.iter().map(|r| r.to_skel().unparse()).collect(),
    );
    Ok(())
}

/// Coalesce an ordered change log:
/// - `reset` drops every earlier record on its path (and itself);
/// - `add` after `delete` becomes `replace`;
/// - `delete` after `add` removes the path entirely;
/// - later records on a surviving path merge into the earlier one, keeping
///   its kind, taking the newer node-revision and OR-ing the mod flags.
///
/// Output keeps first-appearance path order.
pub fn fold_changes(records: Vec<ChangeRecord>) -> Vec<ChangeRecord> {
    let mut order: Vec<String> = Vec::new();
    let mut folded: HashMap<String, ChangeRecord> = HashMap::new();

    for rec in records {
        if rec.kind == ChangeKind::Reset {
            folded.remove(&rec.path);
            order.retain(|p| p != &rec.path);
            continue;
        }
        match folded.remove(&rec.path) {
            None => {
                order.push(rec.path.clone());
                folded.insert(rec.path.clone(), rec);
            }
            Some(prev) => {
                // merge_pair returns None for add-then-delete; the stale
                // order entry is harmless, the final filter drops it.
                if let Some(merged) = merge_pair(prev, rec) {
                    folded.insert(merged.path.clone(), merged);
                }
            }
        }
    }

    order
        .into_iter()
        .filter_map(|p| folded.remove(&p))
        .collect()
}

fn merge_pair(prev: ChangeRecord, next: ChangeRecord) -> Option<ChangeRecord> {
    debug_assert_eq!(prev.path, next.path);
    match (prev.kind, next.kind) {
        // add then delete: the txn never touched the path after all.
        (ChangeKind::Add, ChangeKind::Delete) => None,
        // delete then add: a replacement.
        (ChangeKind::Delete, ChangeKind::Add) => Some(ChangeRecord {
            kind: ChangeKind::Replace,
            ..next
        }),
        (_, ChangeKind::Delete) => Some(ChangeRecord { kind: ChangeKind::Delete, ..next }),
        // Everything else keeps the earlier kind and absorbs the newer
        // node-revision and flags.
        (kind, _) => Some(ChangeRecord {
            path: next.path,
            noderev: next.noderev.or(prev.noderev),
            kind,
            text_mod: prev.text_mod || next.text_mod,
            prop_mod: prev.prop_mod || next.prop_mod,
        }),
    }
}

#[cfg(test)]
#[path = "changes_tests.rs"]
mod changes_tests;
