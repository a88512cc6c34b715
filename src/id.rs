//! Typed identifiers.
//!
//! All persistent keys are allocator strings (see [`crate::key`]), but each
//! kind gets its own newtype so node IDs, copy IDs, txn IDs, rep keys and
//! string keys cannot be mixed up. The composite [`NodeRevId`] renders as
//! `<node>.<copy>.<txn>` with the three segments individually extractable.

use std::fmt;

use crate::error::{Error, FsResult};
use crate::key;

macro_rules! key_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                let s = s.into();
                debug_assert!(key::is_valid_key(&s), "bad key '{}'", s);
                $name(s)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

key_newtype!(
    /// Identity of a line of history; shared by all of a node's revisions.
    NodeId
);
key_newtype!(
    /// Tag shared by node-revisions created together by one copy operation.
    CopyId
);
key_newtype!(
    /// Identity of a transaction (also the txn segment of committed ids).
    TxnId
);
key_newtype!(
    /// Key into the representations table.
    RepId
);
key_newtype!(
    /// Key into the strings table.
    StringId
);

impl CopyId {
    /// The sentinel copy ID meaning "no copy in this node's history".
    pub fn zero() -> Self {
        CopyId("0".to_string())
    }

    pub fn is_zero(&self) -> bool {
        self.0 == "0"
    }
}

/// Committed revision numbers.
pub type Revision = u64;

/// A node-revision identifier: one immutable (or currently-mutable) snapshot
/// of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRevId {
    node: NodeId,
    copy: CopyId,
    txn: TxnId,
}

impl NodeRevId {
    pub fn new(node: NodeId, copy: CopyId, txn: TxnId) -> Self {
        NodeRevId { node, copy, txn }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node
    }

    pub fn copy_id(&self) -> &CopyId {
        &self.copy
    }

    pub fn txn_id(&self) -> &TxnId {
        &self.txn
    }

    /// Parse the `<node>.<copy>.<txn>` textual form.
    pub fn parse(s: &str) -> FsResult<Self> {
        let mut parts = s.split('.');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(n), Some(c), Some(t), None)
                if key::is_valid_key(n) && key::is_valid_key(c) && key::is_valid_key(t) =>
            {
                Ok(NodeRevId {
                    node: NodeId::new(n),
                    copy: CopyId::new(c),
                    txn: TxnId::new(t),
                })
            }
            _ => Err(Error::corrupt(format!("malformed node-revision id '{}'", s))),
        }
    }

    /// True when both ids belong to the same node (same line of history).
    pub fn same_node(&self, other: &NodeRevId) -> bool {
        self.node == other.node
    }
}

impl fmt::Display for NodeRevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.node, self.copy, self.txn)
    }
}
