//! Nodes and links.

use std::sync::Arc;

use sluice_core::{NodeTypeInfo, PinDirection, TypedValue};

use crate::ids::{LinkId, NodeId, SocketId};
use crate::socket::SocketGroup;
use crate::tree::NodeTree;

/// A computation unit instantiated from a [`NodeTypeInfo`].
pub struct Node {
    /// Stable identity within the tree.
    pub id: NodeId,
    /// The kind this node was instantiated from.
    pub typeinfo: Arc<NodeTypeInfo>,
    /// Ordered input sockets.
    pub inputs: Vec<SocketId>,
    /// Ordered output sockets.
    pub outputs: Vec<SocketId>,
    /// Socket groups declared by the kind.
    pub groups: Vec<SocketGroup>,
    /// Set by the executor's compile pass.
    pub required: bool,
    /// Set when a required input could not be filled this run.
    pub missing_input: bool,
    /// Last execution failure, if any.
    pub execution_failed: Option<String>,
    /// Companion node, for kinds instantiated in pairs.
    pub paired_node: Option<NodeId>,
    /// Per-node storage slot, used by the simulation pair.
    pub storage: TypedValue,
    /// Interior tree, when this node is a group.
    pub sub_tree: Option<NodeTree>,
    /// Opaque editor blob (position and the like).
    pub ui: String,
}

impl Node {
    pub(crate) fn new(id: NodeId, typeinfo: Arc<NodeTypeInfo>) -> Self {
        Self {
            id,
            typeinfo,
            inputs: Vec::new(),
            outputs: Vec::new(),
            groups: Vec::new(),
            required: false,
            missing_input: false,
            execution_failed: None,
            paired_node: None,
            storage: TypedValue::empty(),
            sub_tree: None,
            ui: String::new(),
        }
    }

    /// Whether this node carries an interior tree.
    pub fn is_group(&self) -> bool {
        self.sub_tree.is_some()
    }

    /// Socket ids on the given side.
    pub fn sockets_of(&self, direction: PinDirection) -> &[SocketId] {
        match direction {
            PinDirection::Input => &self.inputs,
            PinDirection::Output => &self.outputs,
        }
    }

    /// Find a socket group by identifier and direction.
    pub fn find_group(&self, identifier: &str, direction: PinDirection) -> Option<&SocketGroup> {
        self.groups
            .iter()
            .find(|g| g.identifier == identifier && g.direction == direction)
    }

    /// Mutable variant of [`Node::find_group`].
    pub fn find_group_mut(
        &mut self,
        identifier: &str,
        direction: PinDirection,
    ) -> Option<&mut SocketGroup> {
        self.groups
            .iter_mut()
            .find(|g| g.identifier == identifier && g.direction == direction)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.typeinfo.id_name)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("group", &self.is_group())
            .finish()
    }
}

/// A directed edge from an output socket to an input socket.
///
/// When link creation inserts an invisible conversion node, the logical link
/// becomes a chain of physical links joined by `next_link`/`from_link`; the
/// head of the chain is what editors and serialization see.
#[derive(Debug, Clone)]
pub struct NodeLink {
    /// Stable identity within the tree.
    pub id: LinkId,
    /// Node owning `from_sock`.
    pub from_node: NodeId,
    /// The output socket.
    pub from_sock: SocketId,
    /// Node owning `to_sock`.
    pub to_node: NodeId,
    /// The input socket.
    pub to_sock: SocketId,
    /// Continuation of the chain through a conversion node.
    pub next_link: Option<LinkId>,
    /// Predecessor in the chain; `None` on the chain head.
    pub from_link: Option<LinkId>,
}
