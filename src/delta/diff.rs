//! A block-matching delta producer.
//!
//! Greedy matcher: hash fixed-size source blocks, scan the target, extend
//! candidate matches as far as they go, spill unmatched bytes into the
//! window's new data. Not the cleverest delta in the world, but the framing
//! and interpreter are the contract; this producer only has to be correct
//! and to find the long runs that make skip-deltas worth storing.

use std::collections::HashMap;

use super::{DeltaOp, Window, WINDOW_SIZE};

const BLOCK_SIZE: usize = 64;

/// Source views larger than this are narrowed to the target window's own
/// offset range, keeping per-window state bounded.
const MAX_SOURCE_VIEW: usize = 1024 * 1024;

fn block_hash(block: &[u8]) -> u64 {
    // FNV-1a.
    let mut h: u64 = 0xcbf29ce484222325;
    for &b in block {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

/// Compute delta windows reconstructing `target` from `source`.
pub fn diff(source: &[u8], target: &[u8]) -> Vec<Window> {
    let mut windows = Vec::new();
    let mut toff = 0usize;
    loop {
        let tlen = (target.len() - toff).min(WINDOW_SIZE);
        let tview = &target[toff..toff + tlen];

        let (soff, sview) = if source.len() <= MAX_SOURCE_VIEW {
            (0usize, source)
        } else {
            let start = toff.min(source.len());
            let end = (toff + MAX_SOURCE_VIEW).min(source.len());
            (start, &source[start..end])
        };

        windows.push(diff_window(soff as u64, sview, tview));
        toff += tlen;
        if toff >= target.len() {
            break;
        }
    }
    windows
}

fn diff_window(sview_offset: u64, sview: &[u8], tview: &[u8]) -> Window {
    let mut blocks: HashMap<u64, Vec<usize>> = HashMap::new();
    let mut i = 0;
    while i + BLOCK_SIZE <= sview.len() {
        blocks.entry(block_hash(&sview[i..i + BLOCK_SIZE])).or_default().push(i);
        i += BLOCK_SIZE;
    }

    let mut ops: Vec<DeltaOp> = Vec::new();
    let mut new_data: Vec<u8> = Vec::new();
    let mut pending_new = 0u64;
    let mut pos = 0usize;

    while pos < tview.len() {
        let matched = if pos + BLOCK_SIZE <= tview.len() {
            best_match(sview, &blocks, tview, pos)
        } else {
            None
        };
        match matched {
            Some((soff, len)) => {
                if pending_new > 0 {
                    ops.push(DeltaOp::CopyNew { len: pending_new });
                    pending_new = 0;
                }
                ops.push(DeltaOp::CopySource { offset: soff as u64, len: len as u64 });
                pos += len;
            }
            None => {
                new_data.push(tview[pos]);
                pending_new += 1;
                pos += 1;
            }
        }
    }
    if pending_new > 0 {
        ops.push(DeltaOp::CopyNew { len: pending_new });
    }

    Window {
        sview_offset,
        sview_len: sview.len() as u64,
        tview_len: tview.len() as u64,
        ops,
        new_data,
    }
}

/// The longest match starting at `tview[pos]` among source blocks with the
/// same hash, extended forward byte by byte (and backward never: blocks are
/// aligned, starts are exact).
fn best_match(
    sview: &[u8],
    blocks: &HashMap<u64, Vec<usize>>,
    tview: &[u8],
    pos: usize,
) -> Option<(usize, usize)> {
    let h = block_hash(&tview[pos..pos + BLOCK_SIZE]);
    let candidates = blocks.get(&h)?;
    let mut best: Option<(usize, usize)> = None;
    for &soff in candidates {
        if sview[soff..soff + BLOCK_SIZE] != tview[pos..pos + BLOCK_SIZE] {
            continue;
        }
        let mut len = BLOCK_SIZE;
        while soff + len < sview.len()
            && pos + len < tview.len()
            && sview[soff + len] == tview[pos + len]
        {
            len += 1;
        }
        if best.map(|(_, blen)| len > blen).unwrap_or(true) {
            best = Some((soff, len));
        }
    }
    best
}
