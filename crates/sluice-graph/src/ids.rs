//! Stable identifiers for nodes, sockets, and links.
//!
//! The object model is arena-based: everything refers to everything else
//! through these ids, never through references. Ids are allocated by a
//! per-tree monotone counter and stay stable across mutations, which is what
//! lets executor caches key on socket identity across compilations.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier of a node within a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

/// Unique identifier of a socket within a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SocketId(u64);

/// Unique identifier of a link within a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkId(u64);

macro_rules! id_impls {
    ($name:ident) => {
        impl $name {
            /// Wrap a raw id value.
            pub fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// The raw id value.
            pub fn raw(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_impls!(NodeId);
id_impls!(SocketId);
id_impls!(LinkId);
