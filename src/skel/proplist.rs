//! Property lists as skels.
//!
//! A proplist is a flat `(name value name value ...)` list. Names are UTF-8
//! strings; values are arbitrary bytes.

use std::collections::BTreeMap;

use super::Skel;
use crate::error::{Error, FsResult};

/// Ordered name -> value map used for node, txn and revision properties.
pub type Proplist = BTreeMap<String, Vec<u8>>;

pub fn proplist_to_skel(props: &Proplist) -> Skel {
    let mut items = Vec::with_capacity(props.len() * 2);
    for (name, value) in props {
        items.push(Skel::atom_str(name));
        items.push(Skel::atom(value.clone()));
    }
    Skel::List(items)
}

pub fn proplist_from_skel(skel: &Skel) -> FsResult<Proplist> {
    let items = skel
        .as_list()
        .ok_or_else(|| Error::corrupt("proplist is not a list"))?;
    if items.len() % 2 != 0 {
        return Err(Error::corrupt("proplist has an odd number of elements"));
    }
    let mut props = Proplist::new();
    for pair in items.chunks(2) {
        let name = pair[0]
            .as_str()
            .ok_or_else(|| Error::corrupt("proplist name is not a UTF-8 atom"))?;
        let value = pair[1]
            .as_atom()
            .ok_or_else(|| Error::corrupt("proplist value is not an atom"))?;
        props.insert(name.to_string(), value.to_vec());
    }
    Ok(props)
}
