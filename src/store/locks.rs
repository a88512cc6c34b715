//! The lock stores.
//!
//! Two tables: `locks` maps token -> lock record, `lock-tokens` maps path ->
//! token. Expired locks are treated as absent everywhere and purged lazily
//! when a query trips over them.

use chrono::{DateTime, Utc};

use crate::error::{Error, FsResult};
use crate::kv::tables;
use crate::skel::Skel;
use crate::trail::Trail;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub path: String,
    pub token: String,
    pub owner: String,
    pub comment: Option<String>,
    pub is_dav_comment: bool,
    pub creation_date: DateTime<Utc>,
    pub expiration_date: Option<DateTime<Utc>>,
}

impl LockRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_date.map(|exp| exp <= now).unwrap_or(false)
    }

    fn to_skel(&self) -> Skel {
        Skel::list(vec![
            Skel::atom_str("lock"),
            Skel::atom_str(&self.path),
            Skel::atom_str(&self.token),
            Skel::atom_str(&self.owner),
            match &self.comment {
                Some(c) => Skel::atom_str(c),
                None => Skel::empty_atom(),
            },
            Skel::atom_str(if self.is_dav_comment { "true" } else { "false" }),
            Skel::atom_str(&self.creation_date.to_rfc3339()),
            match &self.expiration_date {
                Some(d) => Skel::atom_str(&d.to_rfc3339()),
                None => Skel::empty_atom(),
            },
        ])
    }

    fn from_skel(skel: &Skel, token: &str) -> FsResult<LockRecord> {
        let bad = || Error::corrupt(format!("malformed lock record '{}'", token));
        let items = skel.as_list().ok_or_else(bad)?;
        if items.len() != 8 || !items[0].is_atom_str("lock") {
            return Err(bad());
        }
        let date = |s: &Skel| -> FsResult<DateTime<Utc>> {
            DateTime::parse_from_rfc3339(s.as_str().ok_or_else(bad)?)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|_| bad())
        };
        Ok(LockRecord {
            path: items[1].as_str().ok_or_else(bad)?.to_string(),
            token: items[2].as_str().ok_or_else(bad)?.to_string(),
            owner: items[3].as_str().ok_or_else(bad)?.to_string(),
            comment: match items[4].as_str().ok_or_else(bad)? {
                "" => None,
                c => Some(c.to_string()),
            },
            is_dav_comment: items[5].is_atom_str("true"),
            creation_date: date(&items[6])?,
            expiration_date: match items[7].as_atom().ok_or_else(bad)? {
                b if b.is_empty() => None,
                _ => Some(date(&items[7])?),
            },
        })
    }
}

/// Write both the lock record and the path index entry.
pub fn put_lock(trail: &mut Trail<'_>, rec: &LockRecord) {
    trail
        .txn
        .put(tables::LOCKS, rec.token.as_bytes(), rec.to_skel().unparse());
    trail
        .txn
        .put(tables::LOCK_TOKENS, rec.path.as_bytes(), rec.token.clone().into_bytes());
}

fn get_lock_by_token(trail: &Trail<'_>, token: &str) -> FsResult<Option<LockRecord>> {
    match trail.txn.get(tables::LOCKS, token.as_bytes()) {
        None => Ok(None),
        Some(bytes) => Ok(Some(LockRecord::from_skel(&Skel::parse(&bytes)?, token)?)),
    }
}

/// The live lock on exactly `path`, purging it first if it has expired.
pub fn get_lock(trail: &mut Trail<'_>, path: &str, now: DateTime<Utc>) -> FsResult<Option<LockRecord>> {
    let token = match trail.txn.get(tables::LOCK_TOKENS, path.as_bytes()) {
        None => return Ok(None),
        Some(t) => String::from_utf8_lossy(&t).into_owned(),
    };
    let rec = match get_lock_by_token(trail, &token)? {
        // Dangling index entry; repair it.
        None => {
            trail.txn.delete(tables::LOCK_TOKENS, path.as_bytes());
            return Ok(None);
        }
        Some(rec) => rec,
    };
    if rec.is_expired(now) {
        remove_lock(trail, &rec);
        return Ok(None);
    }
    Ok(Some(rec))
}

pub fn remove_lock(trail: &mut Trail<'_>, rec: &LockRecord) {
    trail.txn.delete(tables::LOCKS, rec.token.as_bytes());
    trail.txn.delete(tables::LOCK_TOKENS, rec.path.as_bytes());
}

/// Live locks at `path` and, when `recurse` is set, beneath it. Component
/// boundaries are honored: `/A` covers `/A/mu` but not `/Ab`.
pub fn locks_under(
    trail: &mut Trail<'_>,
    path: &str,
    recurse: bool,
    now: DateTime<Utc>,
) -> FsResult<Vec<LockRecord>> {
    let mut out = Vec::new();
    if let Some(rec) = get_lock(trail, path, now)? {
        out.push(rec);
    }
    if !recurse {
        return Ok(out);
    }
    let prefix = if path == "/" { "/".to_string() } else { format!("{}/", path) };
    for key in trail.txn.scan_prefix(tables::LOCK_TOKENS, prefix.as_bytes()) {
        let child = String::from_utf8_lossy(&key).into_owned();
        if child == path {
            continue;
        }
        if let Some(rec) = get_lock(trail, &child, now)? {
            out.push(rec);
        }
    }
    Ok(out)
}
