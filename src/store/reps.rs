//! The representation store.
//!
//! A representation is the indirection between a node-revision's property or
//! data slot and substrate strings: either a fulltext pointing at one string,
//! or an ordered list of delta windows, each holding one svndiff window in a
//! string of its own, applied over a source representation. Mutable reps are
//! always fulltext; immutable fulltexts may later be re-expressed as deltas
//! (`deltify`) and back (`undeltify`).

use tracing::debug;

use super::{allocate_key, counters, strings};
use crate::delta;
use crate::error::{Error, FsResult};
use crate::id::{RepId, StringId};
use crate::kv::tables;
use crate::skel::Skel;
use crate::trail::Trail;

/// Longest admissible delta chain; anything deeper is treated as corruption
/// (the skip-delta policy keeps real chains logarithmic).
const MAX_CHAIN: usize = 64;

/// Copy granularity when materializing a fulltext into a new mutable rep.
const COPY_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepWindow {
    /// Offset of this window's text within the rep's fulltext.
    pub target_offset: u64,
    pub target_len: u64,
    /// MD5 of the rep's entire fulltext, recorded per window.
    pub checksum: [u8; 16],
    pub source: RepId,
    /// The svndiff window bytes.
    pub string: StringId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Representation {
    Fulltext { mutable: bool, string: StringId },
    Delta { windows: Vec<RepWindow> },
}

impl Representation {
    pub fn is_mutable(&self) -> bool {
        matches!(self, Representation::Fulltext { mutable: true, .. })
    }

    fn to_skel(&self) -> Skel {
        match self {
            Representation::Fulltext { mutable, string } => {
                let mut header = vec![Skel::atom_str("fulltext")];
                if *mutable {
                    header.push(Skel::atom_str("mutable"));
                }
                Skel::list(vec![Skel::list(header), Skel::atom_str(string.as_str())])
            }
            Representation::Delta { windows } => {
                let mut items = vec![Skel::list(vec![Skel::atom_str("delta")])];
                for w in windows {
                    items.push(Skel::list(vec![
                        Skel::atom_str(&w.target_offset.to_string()),
                        Skel::list(vec![
                            Skel::atom_str(&w.target_len.to_string()),
                            Skel::list(vec![
                                Skel::atom_str("md5"),
                                Skel::atom(w.checksum.to_vec()),
                            ]),
                            Skel::atom_str(w.source.as_str()),
                            Skel::list(vec![
                                Skel::atom_str("svndiff"),
                                Skel::atom_str("0"),
                                Skel::atom_str(w.string.as_str()),
                            ]),
                        ]),
                    ]));
                }
                Skel::list(items)
            }
        }
    }

    fn from_skel(skel: &Skel, key: &str) -> FsResult<Representation> {
        let bad = || Error::corrupt(format!("malformed representation '{}'", key));
        let items = skel.as_list().ok_or_else(bad)?;
        let header = items.first().and_then(Skel::as_list).ok_or_else(bad)?;
        let kind = header.first().and_then(Skel::as_str).ok_or_else(bad)?;
        let mutable = header.iter().skip(1).any(|s| s.is_atom_str("mutable"));
        match kind {
            "fulltext" => {
                if items.len() != 2 {
                    return Err(bad());
                }
                let string = items[1].as_str().ok_or_else(bad)?;
                Ok(Representation::Fulltext {
                    mutable,
                    string: StringId::new(string),
                })
            }
            "delta" => {
                if mutable {
                    return Err(Error::corrupt(format!(
                        "mutable delta representation '{}'",
                        key
                    )));
                }
                let mut windows = Vec::with_capacity(items.len() - 1);
                for item in &items[1..] {
                    let pair = item.as_list().ok_or_else(bad)?;
                    if pair.len() != 2 {
                        return Err(bad());
                    }
                    let target_offset: u64 = pair[0]
                        .as_str()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(bad)?;
                    let body = pair[1].as_list().ok_or_else(bad)?;
                    if body.len() != 4 {
                        return Err(bad());
                    }
                    let target_len: u64 = body[0]
                        .as_str()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(bad)?;
                    let md5 = body[1].as_list().ok_or_else(bad)?;
                    if md5.len() != 2 || !md5[0].is_atom_str("md5") {
                        return Err(bad());
                    }
                    let checksum: [u8; 16] = md5[1]
                        .as_atom()
                        .and_then(|b| b.try_into().ok())
                        .ok_or_else(bad)?;
                    let source = body[2].as_str().ok_or_else(bad)?;
                    let diff = body[3].as_list().ok_or_else(bad)?;
                    if diff.len() != 3 || !diff[0].is_atom_str("svndiff") {
                        return Err(bad());
                    }
                    let string = diff[2].as_str().ok_or_else(bad)?;
                    windows.push(RepWindow {
                        target_offset,
                        target_len,
                        checksum,
                        source: RepId::new(source),
                        string: StringId::new(string),
                    });
                }
                Ok(Representation::Delta { windows })
            }
            _ => Err(bad()),
        }
    }
}

pub fn read_rep(trail: &Trail<'_>, id: &RepId) -> FsResult<Representation> {
    let bytes = trail
        .txn
        .get(tables::REPRESENTATIONS, id.as_str().as_bytes())
        .ok_or_else(|| Error::NoSuchRepresentation { key: id.as_str().to_string() })?;
    Representation::from_skel(&Skel::parse(&bytes)?, id.as_str())
}

pub fn write_rep(trail: &mut Trail<'_>, id: &RepId, rep: &Representation) {
    trail.txn.put(
        tables::REPRESENTATIONS,
        id.as_str().as_bytes(),
        rep.to_skel().unparse(),
    );
}

pub fn write_new_rep(trail: &mut Trail<'_>, rep: &Representation) -> FsResult<RepId> {
    let key = allocate_key(trail, counters::NEXT_REP_ID)?;
    let id = RepId::new(key);
    write_rep(trail, &id, rep);
    Ok(id)
}

/// Remove the rep record only; substrate strings are the caller's problem.
pub fn delete_rep(trail: &mut Trail<'_>, id: &RepId) -> FsResult<()> {
    read_rep(trail, id)?;
    trail.txn.delete(tables::REPRESENTATIONS, id.as_str().as_bytes());
    Ok(())
}

/// Every substrate string the rep owns.
fn rep_strings(rep: &Representation) -> Vec<StringId> {
    match rep {
        Representation::Fulltext { string, .. } => vec![string.clone()],
        Representation::Delta { windows } => windows.iter().map(|w| w.string.clone()).collect(),
    }
}

pub fn contents_size(trail: &Trail<'_>, id: &RepId) -> FsResult<u64> {
    match read_rep(trail, id)? {
        Representation::Fulltext { string, .. } => strings::size(trail, &string),
        Representation::Delta { windows } => Ok(windows
            .iter()
            .map(|w| w.target_offset + w.target_len)
            .max()
            .unwrap_or(0)),
    }
}

/// Read `len` bytes of the rep's fulltext starting at `offset`, short only
/// at the end. Delta reps replay the windows whose target span intersects
/// the request; each window's source view is read recursively from its
/// source rep.
pub fn read_range(trail: &Trail<'_>, id: &RepId, offset: u64, len: usize) -> FsResult<Vec<u8>> {
    read_range_at_depth(trail, id, offset, len, 0)
}

fn read_range_at_depth(
    trail: &Trail<'_>,
    id: &RepId,
    offset: u64,
    len: usize,
    depth: usize,
) -> FsResult<Vec<u8>> {
    if depth > MAX_CHAIN {
        return Err(Error::corrupt(format!(
            "delta chain through '{}' exceeds {} links",
            id,
            MAX_CHAIN
        )));
    }
    match read_rep(trail, id)? {
        Representation::Fulltext { string, .. } => strings::read(trail, &string, offset, len),
        Representation::Delta { windows } => {
            let mut out = Vec::new();
            let end = offset + len as u64;
            for w in &windows {
                let wstart = w.target_offset;
                let wend = w.target_offset + w.target_len;
                if wend <= offset {
                    continue;
                }
                if wstart >= end {
                    break;
                }
                let svndiff = strings::read_all(trail, &w.string)?;
                let window = delta::parse_window_string(&svndiff)?;
                let sview = read_range_at_depth(
                    trail,
                    &w.source,
                    window.sview_offset,
                    window.sview_len as usize,
                    depth + 1,
                )?;
                let tview = window.apply(&sview)?;
                let from = offset.saturating_sub(wstart) as usize;
                let to = (end.min(wend) - wstart) as usize;
                if from > tview.len() || to > tview.len() {
                    return Err(Error::corrupt(format!(
                        "window of '{}' shorter than its declared span",
                        id
                    )));
                }
                out.extend_from_slice(&tview[from..to]);
            }
            Ok(out)
        }
    }
}

/// The rep's entire fulltext. Delta reconstructions are verified against the
/// recorded window checksum.
pub fn contents(trail: &Trail<'_>, id: &RepId) -> FsResult<Vec<u8>> {
    let size = contents_size(trail, id)?;
    let text = read_range(trail, id, 0, size as usize)?;
    if let Representation::Delta { windows } = read_rep(trail, id)? {
        if let Some(expected) = windows.first().map(|w| w.checksum) {
            let actual = md5::compute(&text).0;
            if actual != expected {
                return Err(Error::ChecksumMismatch {
                    context: format!("representation '{}'", id),
                    expected: hex(&expected),
                    actual: hex(&actual),
                });
            }
        }
    }
    Ok(text)
}

/// MD5 of the rep's fulltext. Delta reps answer from the recorded window
/// checksum without reconstructing.
pub fn fulltext_md5(trail: &Trail<'_>, id: &RepId) -> FsResult<[u8; 16]> {
    match read_rep(trail, id)? {
        Representation::Delta { windows } if !windows.is_empty() => Ok(windows[0].checksum),
        _ => Ok(md5::compute(&contents(trail, id)?).0),
    }
}

pub(crate) fn hex(digest: &[u8; 16]) -> String {
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Append to a mutable fulltext rep's string.
pub fn append_contents(trail: &mut Trail<'_>, id: &RepId, bytes: &[u8]) -> FsResult<()> {
    match read_rep(trail, id)? {
        Representation::Fulltext { mutable: true, string } => strings::append(trail, &string, bytes),
        _ => Err(Error::NotMutable { id: id.as_str().to_string() }),
    }
}

/// Truncate a mutable fulltext rep to zero length.
pub fn clear_contents(trail: &mut Trail<'_>, id: &RepId) -> FsResult<()> {
    match read_rep(trail, id)? {
        Representation::Fulltext { mutable: true, string } => strings::clear(trail, &string),
        _ => Err(Error::NotMutable { id: id.as_str().to_string() }),
    }
}

/// The copy-on-write pivot. `None` (or an absent slot) allocates a fresh
/// empty mutable fulltext; a mutable rep is returned unchanged; an immutable
/// rep is deep-copied into a new mutable fulltext.
pub fn get_mutable_rep(trail: &mut Trail<'_>, id: Option<&RepId>) -> FsResult<RepId> {
    let id = match id {
        None => {
            let string = strings::new(trail)?;
            return write_new_rep(trail, &Representation::Fulltext { mutable: true, string });
        }
        Some(id) => id,
    };
    let rep = read_rep(trail, id)?;
    if rep.is_mutable() {
        return Ok(id.clone());
    }
    let string = strings::new(trail)?;
    let size = contents_size(trail, id)?;
    let mut offset = 0u64;
    while offset < size {
        let chunk = read_range(trail, id, offset, COPY_CHUNK)?;
        if chunk.is_empty() {
            return Err(Error::corrupt(format!("short read copying rep '{}'", id)));
        }
        offset += chunk.len() as u64;
        strings::append(trail, &string, &chunk)?;
    }
    write_new_rep(trail, &Representation::Fulltext { mutable: true, string })
}

/// Freeze a mutable rep. Immutable reps pass through untouched.
pub fn make_rep_immutable(trail: &mut Trail<'_>, id: &RepId) -> FsResult<()> {
    match read_rep(trail, id)? {
        Representation::Fulltext { mutable: true, string } => {
            write_rep(trail, id, &Representation::Fulltext { mutable: false, string });
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Delete a mutable rep and its strings; a no-op on immutable reps.
pub fn delete_rep_if_mutable(trail: &mut Trail<'_>, id: &RepId) -> FsResult<()> {
    let rep = read_rep(trail, id)?;
    if !rep.is_mutable() {
        return Ok(());
    }
    for s in rep_strings(&rep) {
        strings::delete(trail, &s)?;
    }
    trail.txn.delete(tables::REPRESENTATIONS, id.as_str().as_bytes());
    Ok(())
}

/// Every rep reachable from `id` through window sources.
fn source_closure(trail: &Trail<'_>, id: &RepId) -> FsResult<Vec<RepId>> {
    let mut seen = vec![id.clone()];
    let mut queue = vec![id.clone()];
    while let Some(next) = queue.pop() {
        if seen.len() > MAX_CHAIN {
            return Err(Error::corrupt(format!("delta chain through '{}' does not terminate", id)));
        }
        if let Representation::Delta { windows } = read_rep(trail, &next)? {
            for w in windows {
                if !seen.contains(&w.source) {
                    seen.push(w.source.clone());
                    queue.push(w.source.clone());
                }
            }
        }
    }
    Ok(seen)
}

/// Offer to re-express immutable `target` as a delta against immutable
/// `source`. Declines silently when target and source coincide, when either
/// is mutable, when the delta would create a cycle, or when the delta is not
/// strictly smaller than the stored fulltext.
pub fn rep_deltify(trail: &mut Trail<'_>, target: &RepId, source: &RepId) -> FsResult<()> {
    if target == source {
        return Ok(());
    }
    let target_rep = read_rep(trail, target)?;
    let source_rep = read_rep(trail, source)?;
    if target_rep.is_mutable() || source_rep.is_mutable() {
        return Ok(());
    }
    // Re-expressing target against something that reconstructs *through*
    // target would loop forever.
    if source_closure(trail, source)?.contains(target) {
        return Ok(());
    }

    let target_text = contents(trail, target)?;
    let source_text = contents(trail, source)?;
    let checksum = md5::compute(&target_text).0;

    let windows = delta::diff(&source_text, &target_text);
    let mut encoded: Vec<(u64, u64, Vec<u8>)> = Vec::with_capacity(windows.len());
    let mut toff = 0u64;
    let mut delta_size = 0u64;
    for (i, w) in windows.iter().enumerate() {
        let bytes = delta::write_window_string(w, i == 0);
        delta_size += bytes.len() as u64;
        encoded.push((toff, w.tview_len, bytes));
        toff += w.tview_len;
    }

    let stored = stored_size(trail, &target_rep)?;
    if delta_size >= stored {
        debug!(
            target: "revfs::reps",
            "declining deltification of '{}': {} delta bytes vs {} stored",
            target, delta_size, stored
        );
        return Ok(());
    }

    let mut rep_windows = Vec::with_capacity(encoded.len());
    for (offset, len, bytes) in encoded {
        let string = strings::new(trail)?;
        strings::append(trail, &string, &bytes)?;
        rep_windows.push(RepWindow {
            target_offset: offset,
            target_len: len,
            checksum,
            source: source.clone(),
            string,
        });
    }
    for s in rep_strings(&target_rep) {
        strings::delete(trail, &s)?;
    }
    write_rep(trail, target, &Representation::Delta { windows: rep_windows });
    debug!(
        target: "revfs::reps",
        "deltified '{}' against '{}': {} -> {} bytes",
        target, source, stored, delta_size
    );
    Ok(())
}

/// Bytes the rep currently occupies in the string store.
fn stored_size(trail: &Trail<'_>, rep: &Representation) -> FsResult<u64> {
    let mut total = 0;
    for s in rep_strings(rep) {
        total += strings::size(trail, &s)?;
    }
    Ok(total)
}

/// Re-express a delta rep as an immutable fulltext.
pub fn rep_undeltify(trail: &mut Trail<'_>, id: &RepId) -> FsResult<()> {
    let rep = read_rep(trail, id)?;
    let windows = match &rep {
        Representation::Fulltext { .. } => return Ok(()),
        Representation::Delta { windows } => windows,
    };
    let text = contents(trail, id)?;
    let string = strings::new(trail)?;
    strings::append(trail, &string, &text)?;
    for w in windows {
        strings::delete(trail, &w.string)?;
    }
    write_rep(trail, id, &Representation::Fulltext { mutable: false, string });
    Ok(())
}

#[cfg(test)]
#[path = "reps_tests.rs"]
mod reps_tests;
