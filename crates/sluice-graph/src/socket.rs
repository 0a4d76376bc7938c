//! Sockets, data fields, and socket groups.

use sluice_core::{PinDirection, SocketType, TypedValue};

use crate::ids::{LinkId, NodeId, SocketId};

/// Default-value payload of an input socket.
///
/// `value` holds the value used when the socket is left unwired; its absence
/// means the socket must be wired. `min`/`max` are editor hints only.
#[derive(Debug, Clone, Default)]
pub struct DataField {
    /// The default value, if the declaration provided one.
    pub value: Option<TypedValue>,
    /// Editor lower bound.
    pub min: Option<TypedValue>,
    /// Editor upper bound.
    pub max: Option<TypedValue>,
}

/// A typed pin attached to exactly one node.
#[derive(Debug, Clone)]
pub struct NodeSocket {
    /// Stable identity within the tree.
    pub id: SocketId,
    /// The owning node.
    pub node: NodeId,
    /// Input or output.
    pub direction: PinDirection,
    /// Value type; `None` for polymorphic sockets.
    pub ty: Option<SocketType>,
    /// Stable key within the node.
    pub identifier: String,
    /// Display name; empty on group placeholder slots.
    pub ui_name: String,
    /// Optional inputs may stay unwired without blocking execution.
    pub optional: bool,
    /// Identifier of the socket group this socket belongs to, if any.
    pub socket_group: Option<String>,
    /// Default-value payload; only meaningful on inputs.
    pub data_field: DataField,
    /// Links touching this socket. Rebuilt by the topology cache.
    pub directly_linked_links: Vec<LinkId>,
    /// Peer sockets across those links. Rebuilt by the topology cache.
    pub directly_linked_sockets: Vec<SocketId>,
}

impl NodeSocket {
    /// Whether this is the trailing placeholder slot of a dynamic group.
    ///
    /// Placeholders exist so editors have a slot to drop new wires on; they
    /// never carry values and executors skip them.
    pub fn is_placeholder(&self) -> bool {
        self.socket_group.is_some() && self.ui_name.is_empty()
    }
}

/// Reference to a socket group on some node, used for synchronization sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRef {
    /// The node owning the referenced group.
    pub node: NodeId,
    /// Direction of the referenced group.
    pub direction: PinDirection,
    /// Identifier of the referenced group.
    pub identifier: String,
}

/// A named, ordered, possibly runtime-dynamic collection of sockets on one
/// node.
///
/// Groups may be joined into synchronization sets: adding or removing a
/// socket in one member mirrors the edit at the same ordinal in every peer.
#[derive(Debug, Clone)]
pub struct SocketGroup {
    /// Identifier shared by all member sockets.
    pub identifier: String,
    /// Direction of the member sockets.
    pub direction: PinDirection,
    /// The owning node.
    pub node: NodeId,
    /// Type constraint for member sockets; `None` lets each pick its own.
    pub ty: Option<SocketType>,
    /// Whether sockets can be added and removed at runtime.
    pub runtime_dynamic: bool,
    /// Member sockets in ordinal order; a dynamic group keeps its
    /// placeholder as the last entry.
    pub sockets: Vec<SocketId>,
    /// Peer groups this group is synchronized with.
    pub synchronized_groups: Vec<GroupRef>,
}

impl SocketGroup {
    /// Number of named (non-placeholder) member sockets.
    pub fn named_len(&self) -> usize {
        if self.runtime_dynamic {
            self.sockets.len().saturating_sub(1)
        } else {
            self.sockets.len()
        }
    }
}
