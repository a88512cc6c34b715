//! Binary delta windows (svndiff).
//!
//! A delta stream opens with the 4-byte magic `SVN\0` and continues with
//! self-delimiting windows. Each window describes one contiguous span of
//! target text as instructions over a source view, earlier target-view
//! output, and fresh bytes carried in the window. Integers are MSB-first
//! base-128 varints.
//!
//! The delta *algorithm* producing windows lives in [`diff`]; the engine
//! only relies on the framing and the interpreter here.

use crate::error::{Error, FsResult};

mod diff;
pub use diff::diff;

pub const SVNDIFF_MAGIC: &[u8; 4] = b"SVN\0";

/// Target text per window when chunking a deltification.
pub const WINDOW_SIZE: usize = 100 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaOp {
    /// Copy `len` bytes from offset `offset` of the source view.
    CopySource { offset: u64, len: u64 },
    /// Copy `len` bytes from offset `offset` of the target view produced so
    /// far. May overlap its own output (run-length expansion).
    CopyTarget { offset: u64, len: u64 },
    /// Copy the next `len` bytes of the window's new data.
    CopyNew { len: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    /// Offset of the source view within the source text.
    pub sview_offset: u64,
    /// Length of the source view.
    pub sview_len: u64,
    /// Length of the target text this window reconstructs.
    pub tview_len: u64,
    pub ops: Vec<DeltaOp>,
    pub new_data: Vec<u8>,
}

impl Window {
    /// Reconstruct this window's target view from its source view.
    pub fn apply(&self, sview: &[u8]) -> FsResult<Vec<u8>> {
        if sview.len() as u64 != self.sview_len {
            return Err(Error::corrupt(format!(
                "svndiff window wants {} source bytes, got {}",
                self.sview_len,
                sview.len()
            )));
        }
        let mut target = Vec::with_capacity(self.tview_len as usize);
        let mut new_pos = 0usize;
        for op in &self.ops {
            match *op {
                DeltaOp::CopySource { offset, len } => {
                    let (start, end) = (offset as usize, (offset + len) as usize);
                    if end > sview.len() {
                        return Err(Error::corrupt("svndiff source copy out of range"));
                    }
                    target.extend_from_slice(&sview[start..end]);
                }
                DeltaOp::CopyTarget { offset, len } => {
                    let start = offset as usize;
                    if start >= target.len() && len > 0 {
                        return Err(Error::corrupt("svndiff target copy out of range"));
                    }
                    for i in 0..len as usize {
                        let b = target[start + i];
                        target.push(b);
                    }
                }
                DeltaOp::CopyNew { len } => {
                    let end = new_pos + len as usize;
                    if end > self.new_data.len() {
                        return Err(Error::corrupt("svndiff new-data copy out of range"));
                    }
                    target.extend_from_slice(&self.new_data[new_pos..end]);
                    new_pos = end;
                }
            }
        }
        if target.len() as u64 != self.tview_len {
            return Err(Error::corrupt(format!(
                "svndiff window produced {} bytes, declared {}",
                target.len(),
                self.tview_len
            )));
        }
        Ok(target)
    }
}

fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    let mut bytes = [0u8; 10];
    let mut n = 0;
    loop {
        bytes[n] = (v & 0x7f) as u8;
        v >>= 7;
        n += 1;
        if v == 0 {
            break;
        }
    }
    for i in (0..n).rev() {
        let cont = if i == 0 { 0 } else { 0x80 };
        out.push(bytes[i] | cont);
    }
}

fn read_varint(input: &[u8], pos: &mut usize) -> FsResult<u64> {
    let mut v: u64 = 0;
    loop {
        let b = *input
            .get(*pos)
            .ok_or_else(|| Error::corrupt("truncated svndiff varint"))?;
        *pos += 1;
        v = v
            .checked_shl(7)
            .ok_or_else(|| Error::corrupt("svndiff varint overflow"))?
            | (b & 0x7f) as u64;
        if b & 0x80 == 0 {
            return Ok(v);
        }
    }
}

fn write_instruction(out: &mut Vec<u8>, op: &DeltaOp) {
    let (selector, offset, len) = match *op {
        DeltaOp::CopySource { offset, len } => (0u8, Some(offset), len),
        DeltaOp::CopyTarget { offset, len } => (1u8, Some(offset), len),
        DeltaOp::CopyNew { len } => (2u8, None, len),
    };
    if len > 0 && len < 64 {
        out.push((selector << 6) | len as u8);
    } else {
        out.push(selector << 6);
        write_varint(out, len);
    }
    if let Some(offset) = offset {
        write_varint(out, offset);
    }
}

fn read_instruction(input: &[u8], pos: &mut usize) -> FsResult<DeltaOp> {
    let b = *input
        .get(*pos)
        .ok_or_else(|| Error::corrupt("truncated svndiff instruction"))?;
    *pos += 1;
    let selector = b >> 6;
    let short_len = (b & 0x3f) as u64;
    let len = if short_len == 0 { read_varint(input, pos)? } else { short_len };
    match selector {
        0 => {
            let offset = read_varint(input, pos)?;
            Ok(DeltaOp::CopySource { offset, len })
        }
        1 => {
            let offset = read_varint(input, pos)?;
            Ok(DeltaOp::CopyTarget { offset, len })
        }
        2 => Ok(DeltaOp::CopyNew { len }),
        _ => Err(Error::corrupt("unknown svndiff instruction selector")),
    }
}

/// Serialize one window. `with_header` prepends the stream magic; the engine
/// stores one window per substrate string and only the first carries it.
pub fn write_window_string(window: &Window, with_header: bool) -> Vec<u8> {
    let mut instructions = Vec::new();
    for op in &window.ops {
        write_instruction(&mut instructions, op);
    }
    let mut out = Vec::new();
    if with_header {
        out.extend_from_slice(SVNDIFF_MAGIC);
    }
    write_varint(&mut out, window.sview_offset);
    write_varint(&mut out, window.sview_len);
    write_varint(&mut out, window.tview_len);
    write_varint(&mut out, instructions.len() as u64);
    write_varint(&mut out, window.new_data.len() as u64);
    out.extend_from_slice(&instructions);
    out.extend_from_slice(&window.new_data);
    out
}

/// Parse a window stored as one substrate string, tolerating (and skipping)
/// a leading stream magic.
pub fn parse_window_string(bytes: &[u8]) -> FsResult<Window> {
    let mut pos = 0usize;
    if bytes.starts_with(SVNDIFF_MAGIC) {
        pos = SVNDIFF_MAGIC.len();
    }
    let sview_offset = read_varint(bytes, &mut pos)?;
    let sview_len = read_varint(bytes, &mut pos)?;
    let tview_len = read_varint(bytes, &mut pos)?;
    let ins_len = read_varint(bytes, &mut pos)? as usize;
    let new_len = read_varint(bytes, &mut pos)? as usize;
    if pos + ins_len + new_len != bytes.len() {
        return Err(Error::corrupt("svndiff window length mismatch"));
    }
    let ins_end = pos + ins_len;
    let mut ops = Vec::new();
    while pos < ins_end {
        ops.push(read_instruction(&bytes[..ins_end], &mut pos)?);
    }
    let new_data = bytes[ins_end..ins_end + new_len].to_vec();
    Ok(Window { sview_offset, sview_len, tview_len, ops, new_data })
}

#[cfg(test)]
#[path = "delta_tests.rs"]
mod delta_tests;
