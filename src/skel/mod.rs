//! The skel codec.
//!
//! Every persisted record (node-revisions, representations, transactions,
//! revisions, copies, changes, locks) is a *skel*: an atom (arbitrary byte
//! string) or a list of skels. Atoms are written either with an explicit
//! length prefix (`<decimal> <bytes>`) or, for name-like atoms, in a bare
//! implicit form. `parse(unparse(s)) == s` holds for every skel.

use std::fmt;

use crate::error::{Error, FsResult};

mod proplist;
pub use proplist::{proplist_from_skel, proplist_to_skel, Proplist};

#[derive(Clone, PartialEq, Eq)]
pub enum Skel {
    Atom(Vec<u8>),
    List(Vec<Skel>),
}

impl fmt::Debug for Skel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Skel::Atom(b) => match std::str::from_utf8(b) {
                Ok(s) => write!(f, "Atom({:?})", s),
                Err(_) => write!(f, "Atom({:02x?})", b),
            },
            Skel::List(items) => f.debug_list().entries(items).finish(),
        }
    }
}

/// True for bytes that may appear in an implicit-form atom: printable ASCII
/// minus parentheses. The first byte must additionally not be a digit.
fn implicit_byte(b: u8) -> bool {
    (0x21..=0x7e).contains(&b) && b != b'(' && b != b')'
}

fn is_ws(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n')
}

impl Skel {
    pub fn atom(bytes: impl Into<Vec<u8>>) -> Skel {
        Skel::Atom(bytes.into())
    }

    pub fn atom_str(s: &str) -> Skel {
        Skel::Atom(s.as_bytes().to_vec())
    }

    pub fn empty_atom() -> Skel {
        Skel::Atom(Vec::new())
    }

    pub fn list(items: Vec<Skel>) -> Skel {
        Skel::List(items)
    }

    pub fn is_atom(&self) -> bool {
        matches!(self, Skel::Atom(_))
    }

    pub fn as_atom(&self) -> Option<&[u8]> {
        match self {
            Skel::Atom(b) => Some(b),
            Skel::List(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_atom().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Skel]> {
        match self {
            Skel::Atom(_) => None,
            Skel::List(items) => Some(items),
        }
    }

    /// True when this skel is the atom with exactly the bytes of `s`.
    pub fn is_atom_str(&self, s: &str) -> bool {
        self.as_atom().map(|b| b == s.as_bytes()).unwrap_or(false)
    }

    /// Serialize to the canonical byte form.
    pub fn unparse(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Skel::Atom(bytes) => {
                let implicit = !bytes.is_empty()
                    && !bytes[0].is_ascii_digit()
                    && bytes.iter().all(|&b| implicit_byte(b));
                if implicit {
                    out.extend_from_slice(bytes);
                } else {
                    out.extend_from_slice(bytes.len().to_string().as_bytes());
                    out.push(b' ');
                    out.extend_from_slice(bytes);
                }
            }
            Skel::List(items) => {
                out.push(b'(');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(b' ');
                    }
                    item.write_to(out);
                }
                out.push(b')');
            }
        }
    }

    /// Parse one skel from `input`, requiring the entire input (modulo
    /// surrounding whitespace) to be consumed.
    pub fn parse(input: &[u8]) -> FsResult<Skel> {
        let mut p = Parser { input, pos: 0 };
        p.skip_ws();
        let skel = p.parse_skel()?;
        p.skip_ws();
        if p.pos != p.input.len() {
            return Err(malformed("trailing bytes after skel"));
        }
        Ok(skel)
    }
}

fn malformed(detail: &str) -> Error {
    Error::corrupt(format!("malformed skel: {}", detail))
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while let Some(b) = self.peek() {
            if is_ws(b) {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn parse_skel(&mut self) -> FsResult<Skel> {
        match self.peek() {
            None => Err(malformed("empty input")),
            Some(b'(') => self.parse_list(),
            Some(b')') => Err(malformed("unbalanced ')'")),
            Some(b) if b.is_ascii_digit() => self.parse_explicit_atom(),
            Some(b) if implicit_byte(b) => Ok(self.parse_implicit_atom()),
            Some(b) => Err(malformed(&format!("unexpected byte 0x{:02x}", b))),
        }
    }

    fn parse_list(&mut self) -> FsResult<Skel> {
        debug_assert_eq!(self.peek(), Some(b'('));
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None => return Err(malformed("unclosed list")),
                Some(b')') => {
                    self.pos += 1;
                    return Ok(Skel::List(items));
                }
                Some(_) => items.push(self.parse_skel()?),
            }
        }
    }

    fn parse_explicit_atom(&mut self) -> FsResult<Skel> {
        let start = self.pos;
        while self.peek().map(|b| b.is_ascii_digit()).unwrap_or(false) {
            self.pos += 1;
        }
        let len_str = std::str::from_utf8(&self.input[start..self.pos]).expect("digits");
        let len: usize = len_str
            .parse()
            .map_err(|_| malformed("atom length overflow"))?;
        match self.peek() {
            Some(b) if is_ws(b) => self.pos += 1,
            _ => return Err(malformed("missing separator after atom length")),
        }
        if self.pos + len > self.input.len() {
            return Err(malformed("truncated atom"));
        }
        let bytes = self.input[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(Skel::Atom(bytes))
    }

    fn parse_implicit_atom(&mut self) -> Skel {
        let start = self.pos;
        while self.peek().map(implicit_byte).unwrap_or(false) {
            self.pos += 1;
        }
        Skel::Atom(self.input[start..self.pos].to_vec())
    }
}
