//! The mutable node tree: arenas, structural edits, groups.
//!
//! A [`NodeTree`] owns its nodes, sockets, and links in insertion-ordered
//! arenas and hands out stable ids. Every structural edit invalidates the
//! topology cache (see [`crate::topology`]) and sets the tree's dirty flag.
//!
//! Link creation auto-inserts invisible conversion nodes when the endpoint
//! types differ and the descriptor has a conversion registered; the
//! user-visible link is the head of the resulting chain.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use sluice_core::{builtin, NodeTreeDescriptor, PinDirection, SocketType, TypeRegistry};
use tracing::debug;

use crate::error::GraphError;
use crate::ids::{LinkId, NodeId, SocketId};
use crate::node::{Node, NodeLink};
use crate::socket::{DataField, GroupRef, NodeSocket, SocketGroup};
use crate::topology::TopologyCache;

/// Options for [`NodeTree::add_link_with`].
#[derive(Debug, Clone, Copy)]
pub struct AddLinkOptions {
    /// Replace an existing link into the target input instead of failing.
    pub allow_relink_to_output: bool,
    /// Refresh the topology cache immediately instead of lazily.
    pub refresh_topology: bool,
}

impl Default for AddLinkOptions {
    fn default() -> Self {
        Self {
            allow_relink_to_output: false,
            refresh_topology: true,
        }
    }
}

/// Options for [`NodeTree::delete_link_with`].
#[derive(Debug, Clone, Copy)]
pub struct DeleteLinkOptions {
    /// Refresh the topology cache immediately instead of lazily.
    pub refresh_topology: bool,
    /// Also remove the target socket from its dynamic socket group.
    pub remove_from_group: bool,
}

impl Default for DeleteLinkOptions {
    fn default() -> Self {
        Self {
            refresh_topology: true,
            remove_from_group: false,
        }
    }
}

/// A directed acyclic graph of typed computation nodes.
pub struct NodeTree {
    pub(crate) descriptor: Arc<NodeTreeDescriptor>,
    pub(crate) nodes: IndexMap<NodeId, Node>,
    pub(crate) sockets: IndexMap<SocketId, NodeSocket>,
    pub(crate) links: IndexMap<LinkId, NodeLink>,
    pub(crate) next_id: u64,
    pub(crate) topology: TopologyCache,
    /// Set when the partial-order relation admits a cycle; executors refuse
    /// to run while this holds.
    pub has_available_link_cycle: bool,
    /// Opaque editor settings blob.
    pub ui_settings: String,
    dirty: bool,
}

impl NodeTree {
    /// Create an empty tree over the given descriptor.
    pub fn new(descriptor: Arc<NodeTreeDescriptor>) -> Self {
        Self {
            descriptor,
            nodes: IndexMap::new(),
            sockets: IndexMap::new(),
            links: IndexMap::new(),
            next_id: 1,
            topology: TopologyCache::default(),
            has_available_link_cycle: false,
            ui_settings: String::new(),
            dirty: false,
        }
    }

    /// The descriptor this tree draws node kinds from.
    pub fn descriptor(&self) -> &Arc<NodeTreeDescriptor> {
        &self.descriptor
    }

    /// The shared type registry.
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        self.descriptor.registry()
    }

    pub(crate) fn alloc(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(crate) fn mark_changed(&mut self) {
        self.dirty = true;
        self.topology.valid = false;
    }

    /// Whether the tree has been mutated since the flag was last cleared.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clear the mutation flag.
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    // === Lookup =========================================================

    /// Find a node by id.
    pub fn find_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Find a socket by id.
    pub fn find_pin(&self, id: SocketId) -> Option<&NodeSocket> {
        self.sockets.get(&id)
    }

    /// Find a link by id.
    pub fn find_link(&self, id: LinkId) -> Option<&NodeLink> {
        self.links.get(&id)
    }

    /// Borrow a node.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Mutably borrow a node.
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    /// Borrow a socket.
    pub fn socket(&self, id: SocketId) -> Option<&NodeSocket> {
        self.sockets.get(&id)
    }

    /// Mutably borrow a socket.
    pub fn socket_mut(&mut self, id: SocketId) -> Option<&mut NodeSocket> {
        self.sockets.get_mut(&id)
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Node ids in insertion order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Links in insertion order.
    pub fn links(&self) -> impl Iterator<Item = &NodeLink> {
        self.links.values()
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of sockets across all nodes.
    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    /// Number of links, physical (conversion hops counted).
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// The input socket of `node` with the given identifier.
    pub fn input_socket(&self, node: NodeId, identifier: &str) -> Option<SocketId> {
        self.named_socket(node, PinDirection::Input, identifier)
    }

    /// The output socket of `node` with the given identifier.
    pub fn output_socket(&self, node: NodeId, identifier: &str) -> Option<SocketId> {
        self.named_socket(node, PinDirection::Output, identifier)
    }

    fn named_socket(&self, node: NodeId, direction: PinDirection, identifier: &str) -> Option<SocketId> {
        let node = self.nodes.get(&node)?;
        node.sockets_of(direction)
            .iter()
            .copied()
            .find(|id| {
                self.sockets
                    .get(id)
                    .is_some_and(|s| s.identifier == identifier && !s.is_placeholder())
            })
    }

    /// Whether any link touches the socket.
    pub fn socket_is_linked(&self, socket: SocketId) -> bool {
        self.links
            .values()
            .any(|l| l.from_sock == socket || l.to_sock == socket)
    }

    // === Node creation ==================================================

    /// Instantiate a node of the given kind.
    ///
    /// Kinds participating in a companion requirement spawn their partners,
    /// get paired, and have the named groups joined into a synchronization
    /// set.
    pub fn add_node(&mut self, id_name: &str) -> Result<NodeId, GraphError> {
        self.add_node_inner(id_name, true)
    }

    pub(crate) fn add_node_inner(
        &mut self,
        id_name: &str,
        spawn_companions: bool,
    ) -> Result<NodeId, GraphError> {
        let typeinfo = self
            .descriptor
            .node_type(id_name)
            .ok_or_else(|| GraphError::UnknownKind(id_name.to_string()))?;
        let decl = typeinfo.declare(self.descriptor.registry());

        let node_id = NodeId::from_raw(self.alloc());
        self.nodes.insert(node_id, Node::new(node_id, typeinfo));

        for g in &decl.groups {
            let group = SocketGroup {
                identifier: g.identifier.clone(),
                direction: g.direction,
                node: node_id,
                ty: g.ty.clone(),
                runtime_dynamic: g.runtime_dynamic,
                sockets: Vec::new(),
                synchronized_groups: Vec::new(),
            };
            self.nodes
                .get_mut(&node_id)
                .expect("node just inserted")
                .groups
                .push(group);
        }

        for d in decl.inputs.iter().chain(decl.outputs.iter()) {
            let socket_id = self.create_socket(
                node_id,
                d.direction,
                &d.identifier,
                &d.ui_name,
                d.ty.clone(),
                d.optional,
                d.group.clone(),
                DataField {
                    value: d.default_value.clone(),
                    min: d.min.clone(),
                    max: d.max.clone(),
                },
                None,
            );
            if let Some(group_id) = &d.group {
                let direction = d.direction;
                let group_id = group_id.clone();
                if let Some(group) = self
                    .nodes
                    .get_mut(&node_id)
                    .expect("node just inserted")
                    .find_group_mut(&group_id, direction)
                {
                    group.sockets.push(socket_id);
                }
            }
        }

        // Dynamic groups get a trailing placeholder slot.
        for g in &decl.groups {
            if g.runtime_dynamic {
                let placeholder = self.create_socket(
                    node_id,
                    g.direction,
                    "",
                    "",
                    g.ty.clone(),
                    true,
                    Some(g.identifier.clone()),
                    DataField::default(),
                    None,
                );
                if let Some(group) = self
                    .nodes
                    .get_mut(&node_id)
                    .expect("node just inserted")
                    .find_group_mut(&g.identifier, g.direction)
                {
                    group.sockets.push(placeholder);
                }
            }
        }

        if spawn_companions {
            if let Some(requirement) = self.descriptor.requirement_for(id_name).cloned() {
                let mut created: Vec<(String, NodeId)> = vec![(id_name.to_string(), node_id)];
                for member in &requirement.members {
                    if member.node_kind != id_name {
                        let companion = self.add_node_inner(&member.node_kind, false)?;
                        created.push((member.node_kind.clone(), companion));
                    }
                }
                if created.len() == 2 {
                    let (a, b) = (created[0].1, created[1].1);
                    if let Some(node) = self.nodes.get_mut(&a) {
                        node.paired_node = Some(b);
                    }
                    if let Some(node) = self.nodes.get_mut(&b) {
                        node.paired_node = Some(a);
                    }
                }
                for i in 0..requirement.members.len() {
                    for j in (i + 1)..requirement.members.len() {
                        let (mi, mj) = (&requirement.members[i], &requirement.members[j]);
                        if mi.group.is_empty() || mj.group.is_empty() {
                            continue;
                        }
                        let ni = created.iter().find(|(k, _)| *k == mi.node_kind);
                        let nj = created.iter().find(|(k, _)| *k == mj.node_kind);
                        if let (Some((_, ni)), Some((_, nj))) = (ni, nj) {
                            self.add_sync_group(
                                (*ni, mi.direction, mi.group.as_str()),
                                (*nj, mj.direction, mj.group.as_str()),
                            )?;
                        }
                    }
                }
            }
        }

        self.mark_changed();
        Ok(node_id)
    }

    /// Create a socket and attach it to its node.
    ///
    /// `insert_before` positions the socket within the node's ordered list;
    /// `None` appends.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_socket(
        &mut self,
        node: NodeId,
        direction: PinDirection,
        identifier: &str,
        ui_name: &str,
        ty: Option<SocketType>,
        optional: bool,
        socket_group: Option<String>,
        data_field: DataField,
        insert_before: Option<SocketId>,
    ) -> SocketId {
        let id = SocketId::from_raw(self.alloc());
        self.sockets.insert(
            id,
            NodeSocket {
                id,
                node,
                direction,
                ty,
                identifier: identifier.to_string(),
                ui_name: ui_name.to_string(),
                optional,
                socket_group,
                data_field,
                directly_linked_links: Vec::new(),
                directly_linked_sockets: Vec::new(),
            },
        );
        if let Some(n) = self.nodes.get_mut(&node) {
            let list = match direction {
                PinDirection::Input => &mut n.inputs,
                PinDirection::Output => &mut n.outputs,
            };
            match insert_before.and_then(|before| list.iter().position(|s| *s == before)) {
                Some(pos) => list.insert(pos, id),
                None => list.push(id),
            }
        }
        id
    }

    // === Links ==========================================================

    /// Validate that a link can be created from `from` to `to`.
    pub fn can_create_link(&self, from: SocketId, to: SocketId) -> Result<(), GraphError> {
        let from_sock = self
            .sockets
            .get(&from)
            .ok_or(GraphError::SocketNotFound(from))?;
        let to_sock = self.sockets.get(&to).ok_or(GraphError::SocketNotFound(to))?;

        if from_sock.direction != PinDirection::Output || to_sock.direction != PinDirection::Input {
            return Err(GraphError::DirectionMismatch);
        }
        if self.reaches(to_sock.node, from_sock.node) {
            return Err(GraphError::WouldCycle);
        }
        if let (Some(f), Some(t)) = (&from_sock.ty, &to_sock.ty) {
            if f != t && self.descriptor.conversion_kind(f, t).is_none() {
                return Err(GraphError::LinkTypeMismatch {
                    from: f.name().to_string(),
                    to: t.name().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Whether `target` is reachable by walking links downstream of `start`.
    fn reaches(&self, start: NodeId, target: NodeId) -> bool {
        if start == target {
            return true;
        }
        let mut stack = vec![start];
        let mut visited = HashSet::new();
        while let Some(n) = stack.pop() {
            if !visited.insert(n) {
                continue;
            }
            for link in self.links.values().filter(|l| l.from_node == n) {
                if link.to_node == target {
                    return true;
                }
                stack.push(link.to_node);
            }
        }
        false
    }

    /// Link an output to an input with default options.
    pub fn add_link(&mut self, from: SocketId, to: SocketId) -> Result<LinkId, GraphError> {
        self.add_link_with(from, to, AddLinkOptions::default())
    }

    /// Link an output to an input.
    ///
    /// Inserts an invisible conversion node when the endpoint types differ
    /// and the descriptor has a conversion registered; the returned id is
    /// the head of the resulting chain.
    pub fn add_link_with(
        &mut self,
        from: SocketId,
        to: SocketId,
        options: AddLinkOptions,
    ) -> Result<LinkId, GraphError> {
        self.can_create_link(from, to)?;

        let existing: Vec<LinkId> = self
            .links
            .values()
            .filter(|l| l.to_sock == to)
            .map(|l| l.id)
            .collect();
        if !existing.is_empty() {
            if !options.allow_relink_to_output {
                return Err(GraphError::InputAlreadyLinked(to));
            }
            for id in existing {
                let head = self.chain_head(id);
                self.delete_link_with(head, DeleteLinkOptions {
                    refresh_topology: false,
                    remove_from_group: false,
                })?;
            }
        }

        let from_ty = self.sockets[&from].ty.clone();
        let to_ty = self.sockets[&to].ty.clone();

        let head = match (from_ty, to_ty) {
            (Some(f), Some(t)) if f != t => {
                let conv_kind = self
                    .descriptor
                    .conversion_kind(&f, &t)
                    .expect("validated by can_create_link");
                let conv_node = self.add_node_inner(&conv_kind.id_name, false)?;
                let conv_in = self.nodes[&conv_node].inputs[0];
                let conv_out = self.nodes[&conv_node].outputs[0];
                let first = self.raw_link(from, conv_in);
                let second = self.raw_link(conv_out, to);
                self.links.get_mut(&first).expect("just created").next_link = Some(second);
                self.links.get_mut(&second).expect("just created").from_link = Some(first);
                debug!(kind = %conv_kind.id_name, "inserted conversion node for link");
                first
            }
            _ => self.raw_link(from, to),
        };

        self.mark_changed();
        if options.refresh_topology {
            self.ensure_topology_cache();
        }
        Ok(head)
    }

    fn raw_link(&mut self, from: SocketId, to: SocketId) -> LinkId {
        let id = LinkId::from_raw(self.alloc());
        let from_node = self.sockets[&from].node;
        let to_node = self.sockets[&to].node;
        self.links.insert(
            id,
            NodeLink {
                id,
                from_node,
                from_sock: from,
                to_node,
                to_sock: to,
                next_link: None,
                from_link: None,
            },
        );
        id
    }

    /// Head of the chain a link belongs to.
    pub fn chain_head(&self, id: LinkId) -> LinkId {
        let mut current = id;
        while let Some(link) = self.links.get(&current) {
            match link.from_link {
                Some(prev) => current = prev,
                None => break,
            }
        }
        current
    }

    /// All links of a chain, head first.
    pub fn chain_links(&self, head: LinkId) -> Vec<LinkId> {
        let mut out = Vec::new();
        let mut current = Some(head);
        while let Some(id) = current {
            let Some(link) = self.links.get(&id) else { break };
            out.push(id);
            current = link.next_link;
        }
        out
    }

    /// The input socket a chain ultimately feeds.
    pub fn chain_target(&self, head: LinkId) -> Option<SocketId> {
        self.chain_links(head)
            .last()
            .and_then(|id| self.links.get(id))
            .map(|l| l.to_sock)
    }

    /// Delete a link (chain) with default options.
    pub fn delete_link(&mut self, id: LinkId) -> Result<(), GraphError> {
        self.delete_link_with(id, DeleteLinkOptions::default())
    }

    /// Delete a link, its whole conversion chain, and the conversion nodes
    /// the chain ran through.
    pub fn delete_link_with(
        &mut self,
        id: LinkId,
        options: DeleteLinkOptions,
    ) -> Result<(), GraphError> {
        if !self.links.contains_key(&id) {
            return Err(GraphError::LinkNotFound(id));
        }
        let head = self.chain_head(id);
        let chain = self.chain_links(head);
        let target = self.chain_target(head);

        let mut conversion_nodes = Vec::new();
        for pair in chain.windows(2) {
            conversion_nodes.push(self.links[&pair[0]].to_node);
        }
        for link_id in &chain {
            self.links.shift_remove(link_id);
        }
        for node_id in conversion_nodes {
            self.remove_node_and_sockets(node_id);
        }

        if options.remove_from_group {
            if let Some(target) = target {
                let (node, group) = {
                    let sock = self
                        .sockets
                        .get(&target)
                        .ok_or(GraphError::SocketNotFound(target))?;
                    (sock.node, sock.socket_group.clone())
                };
                if let Some(group) = group {
                    self.group_remove_socket_by_id(node, &group, target)?;
                }
            }
        }

        self.mark_changed();
        if options.refresh_topology {
            self.ensure_topology_cache();
        }
        Ok(())
    }

    fn remove_node_and_sockets(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.shift_remove(&id) {
            for socket in node.inputs.iter().chain(node.outputs.iter()) {
                self.sockets.shift_remove(socket);
            }
            if let Some(peer) = node.paired_node {
                if let Some(peer) = self.nodes.get_mut(&peer) {
                    peer.paired_node = None;
                }
            }
        }
    }

    /// Delete a node, all links touching it, and any conversion nodes those
    /// links ran through.
    pub fn delete_node(&mut self, id: NodeId) -> Result<(), GraphError> {
        if !self.nodes.contains_key(&id) {
            return Err(GraphError::NodeNotFound(id));
        }
        let sockets: HashSet<SocketId> = {
            let node = &self.nodes[&id];
            node.inputs.iter().chain(node.outputs.iter()).copied().collect()
        };
        let mut heads: Vec<LinkId> = self
            .links
            .values()
            .filter(|l| sockets.contains(&l.from_sock) || sockets.contains(&l.to_sock))
            .map(|l| self.chain_head(l.id))
            .collect();
        heads.sort();
        heads.dedup();
        for head in heads {
            // A previous chain deletion may already have consumed this one.
            if self.links.contains_key(&head) {
                self.delete_link_with(head, DeleteLinkOptions {
                    refresh_topology: false,
                    remove_from_group: false,
                })?;
            }
        }
        self.remove_node_and_sockets(id);
        self.mark_changed();
        Ok(())
    }

    /// Remove every node, socket, and link. The id allocator keeps counting
    /// so stale identities are never reused.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.sockets.clear();
        self.links.clear();
        self.has_available_link_cycle = false;
        self.mark_changed();
    }

    // === Socket groups ==================================================

    /// Add a socket to a dynamic group, mirroring into synchronized peers.
    pub fn group_add_socket(
        &mut self,
        node: NodeId,
        group_identifier: &str,
        type_name: &str,
        identifier: &str,
        ui_name: &str,
    ) -> Result<SocketId, GraphError> {
        let ty = self
            .registry()
            .resolve_by_name(type_name)
            .ok_or_else(|| GraphError::UnknownType(type_name.to_string()))?;
        self.group_add_socket_inner(node, group_identifier, ty, identifier, ui_name, true)
    }

    fn group_add_socket_inner(
        &mut self,
        node: NodeId,
        group_identifier: &str,
        ty: SocketType,
        identifier: &str,
        ui_name: &str,
        propagate: bool,
    ) -> Result<SocketId, GraphError> {
        let (direction, placeholder, peers) = {
            let n = self.nodes.get(&node).ok_or(GraphError::NodeNotFound(node))?;
            let group = n
                .groups
                .iter()
                .find(|g| g.identifier == group_identifier)
                .ok_or_else(|| GraphError::GroupNotFound(group_identifier.to_string()))?;
            let placeholder = group
                .sockets
                .last()
                .copied()
                .filter(|id| self.sockets.get(id).is_some_and(|s| s.is_placeholder()));
            (group.direction, placeholder, group.synchronized_groups.clone())
        };

        if propagate {
            for peer in &peers {
                if self.nodes.contains_key(&peer.node) {
                    self.group_add_socket_inner(
                        peer.node,
                        &peer.identifier,
                        ty.clone(),
                        identifier,
                        ui_name,
                        false,
                    )?;
                }
            }
        }

        // Group slots are optional: an unwired slot must not block the
        // node the way a missing fixed input does.
        let socket_id = self.create_socket(
            node,
            direction,
            identifier,
            ui_name,
            Some(ty),
            true,
            Some(group_identifier.to_string()),
            DataField::default(),
            placeholder,
        );
        let group = self
            .nodes
            .get_mut(&node)
            .expect("checked above")
            .groups
            .iter_mut()
            .find(|g| g.identifier == group_identifier)
            .expect("checked above");
        // Named sockets go before the trailing placeholder.
        if placeholder.is_some() {
            let pos = group.sockets.len() - 1;
            group.sockets.insert(pos, socket_id);
        } else {
            group.sockets.push(socket_id);
        }

        self.mark_changed();
        Ok(socket_id)
    }

    /// Remove a group socket by identifier.
    ///
    /// Returns `Ok(false)` without touching anything when the socket, or any
    /// mirror at the same ordinal in a synchronized peer group, is still
    /// linked.
    pub fn group_remove_socket(
        &mut self,
        node: NodeId,
        group_identifier: &str,
        socket_identifier: &str,
    ) -> Result<bool, GraphError> {
        let socket = {
            let n = self.nodes.get(&node).ok_or(GraphError::NodeNotFound(node))?;
            let group = n
                .groups
                .iter()
                .find(|g| g.identifier == group_identifier)
                .ok_or_else(|| GraphError::GroupNotFound(group_identifier.to_string()))?;
            group
                .sockets
                .iter()
                .copied()
                .find(|id| {
                    self.sockets
                        .get(id)
                        .is_some_and(|s| s.identifier == socket_identifier && !s.is_placeholder())
                })
                .ok_or_else(|| GraphError::GroupSocketNotFound(socket_identifier.to_string()))?
        };
        self.group_remove_socket_by_id(node, group_identifier, socket)
    }

    /// Remove a group socket by id, with the same mirror rules.
    pub fn group_remove_socket_by_id(
        &mut self,
        node: NodeId,
        group_identifier: &str,
        socket: SocketId,
    ) -> Result<bool, GraphError> {
        let (position, peers) = {
            let n = self.nodes.get(&node).ok_or(GraphError::NodeNotFound(node))?;
            let group = n
                .groups
                .iter()
                .find(|g| g.identifier == group_identifier)
                .ok_or_else(|| GraphError::GroupNotFound(group_identifier.to_string()))?;
            let position = group
                .sockets
                .iter()
                .position(|id| *id == socket)
                .ok_or(GraphError::SocketNotFound(socket))?;
            (position, group.synchronized_groups.clone())
        };

        // The removal aborts wholesale if this socket or any mirror is
        // still wired.
        if self.socket_is_linked(socket) {
            return Ok(false);
        }
        let mut mirrors = Vec::new();
        for peer in &peers {
            let Some(peer_node) = self.nodes.get(&peer.node) else { continue };
            let Some(peer_group) = peer_node.find_group(&peer.identifier, peer.direction) else {
                continue;
            };
            let Some(mirror) = peer_group.sockets.get(position).copied() else {
                return Err(GraphError::SyncGroupSizeMismatch);
            };
            if self.socket_is_linked(mirror) {
                return Ok(false);
            }
            mirrors.push((peer.node, peer.identifier.clone(), mirror));
        }

        for (peer_node, peer_group, mirror) in mirrors {
            self.detach_group_socket(peer_node, &peer_group, mirror);
        }
        self.detach_group_socket(node, group_identifier, socket);
        self.mark_changed();
        Ok(true)
    }

    fn detach_group_socket(&mut self, node: NodeId, group_identifier: &str, socket: SocketId) {
        if let Some(n) = self.nodes.get_mut(&node) {
            if let Some(group) = n.groups.iter_mut().find(|g| g.identifier == group_identifier) {
                group.sockets.retain(|id| *id != socket);
            }
            n.inputs.retain(|id| *id != socket);
            n.outputs.retain(|id| *id != socket);
        }
        self.sockets.shift_remove(&socket);
    }

    /// Join two socket groups into a synchronization set.
    pub fn add_sync_group(
        &mut self,
        a: (NodeId, PinDirection, &str),
        b: (NodeId, PinDirection, &str),
    ) -> Result<(), GraphError> {
        let len_a = {
            let node = self.nodes.get(&a.0).ok_or(GraphError::NodeNotFound(a.0))?;
            node.find_group(a.2, a.1)
                .ok_or_else(|| GraphError::GroupNotFound(a.2.to_string()))?
                .sockets
                .len()
        };
        let len_b = {
            let node = self.nodes.get(&b.0).ok_or(GraphError::NodeNotFound(b.0))?;
            node.find_group(b.2, b.1)
                .ok_or_else(|| GraphError::GroupNotFound(b.2.to_string()))?
                .sockets
                .len()
        };
        if len_a != len_b {
            return Err(GraphError::SyncGroupSizeMismatch);
        }

        let ref_a = GroupRef {
            node: a.0,
            direction: a.1,
            identifier: a.2.to_string(),
        };
        let ref_b = GroupRef {
            node: b.0,
            direction: b.1,
            identifier: b.2.to_string(),
        };
        let group_a = self
            .nodes
            .get_mut(&a.0)
            .expect("checked above")
            .find_group_mut(a.2, a.1)
            .expect("checked above");
        if !group_a.synchronized_groups.contains(&ref_b) {
            group_a.synchronized_groups.push(ref_b);
        }
        let group_b = self
            .nodes
            .get_mut(&b.0)
            .expect("checked above")
            .find_group_mut(b.2, b.1)
            .expect("checked above");
        if !group_b.synchronized_groups.contains(&ref_a) {
            group_b.synchronized_groups.push(ref_a);
        }
        Ok(())
    }

    // === Node groups (sub-trees) ========================================

    /// Move the given nodes into a fresh interior tree behind a new group
    /// node.
    ///
    /// Links crossing the selection boundary are rerouted through matching
    /// sockets on the group node and on the interior `group_in`/`group_out`
    /// placeholder nodes; the group node's socket order mirrors the
    /// placeholders' ordinal for ordinal.
    pub fn group_up(&mut self, selection: &[NodeId]) -> Result<NodeId, GraphError> {
        for id in selection {
            if !self.nodes.contains_key(id) {
                return Err(GraphError::NodeNotFound(*id));
            }
        }
        let selected: HashSet<NodeId> = selection.iter().copied().collect();

        let group_id = self.add_node_inner(builtin::NODE_GROUP, false)?;
        let mut sub = NodeTree::new(self.descriptor.clone());
        // Moved objects keep their ids; keep the interior allocator ahead.
        sub.next_id = self.next_id;
        let group_in = sub.add_node_inner(builtin::GROUP_IN, false)?;
        let group_out = sub.add_node_inner(builtin::GROUP_OUT, false)?;

        // Reroute boundary links; interior links move wholesale below.
        let link_ids: Vec<LinkId> = self.links.keys().copied().collect();
        let mut pending_links: Vec<(SocketId, SocketId)> = Vec::new();
        let mut boundary_in = 0usize;
        let mut boundary_out = 0usize;
        for link_id in link_ids {
            let (from_node, from_sock, to_node, to_sock) = {
                let l = &self.links[&link_id];
                (l.from_node, l.from_sock, l.to_node, l.to_sock)
            };
            match (selected.contains(&from_node), selected.contains(&to_node)) {
                (false, true) => {
                    let identifier = format!("in_{boundary_in}");
                    boundary_in += 1;
                    let (ty, data_field) = {
                        let s = &self.sockets[&to_sock];
                        (s.ty.clone(), s.data_field.clone())
                    };
                    let outer = self.create_socket(
                        group_id,
                        PinDirection::Input,
                        &identifier,
                        &identifier,
                        ty.clone(),
                        false,
                        None,
                        data_field,
                        None,
                    );
                    let inner = sub.create_socket(
                        group_in,
                        PinDirection::Output,
                        &identifier,
                        &identifier,
                        ty,
                        false,
                        None,
                        DataField::default(),
                        None,
                    );
                    let link = self.links.get_mut(&link_id).expect("collected above");
                    link.to_node = group_id;
                    link.to_sock = outer;
                    pending_links.push((inner, to_sock));
                }
                (true, false) => {
                    let identifier = format!("out_{boundary_out}");
                    boundary_out += 1;
                    let ty = self.sockets[&from_sock].ty.clone();
                    let outer = self.create_socket(
                        group_id,
                        PinDirection::Output,
                        &identifier,
                        &identifier,
                        ty.clone(),
                        false,
                        None,
                        DataField::default(),
                        None,
                    );
                    let inner = sub.create_socket(
                        group_out,
                        PinDirection::Input,
                        &identifier,
                        &identifier,
                        ty,
                        false,
                        None,
                        DataField::default(),
                        None,
                    );
                    let link = self.links.get_mut(&link_id).expect("collected above");
                    link.from_node = group_id;
                    link.from_sock = outer;
                    pending_links.push((from_sock, inner));
                }
                _ => {}
            }
        }

        // Move selected nodes, their sockets, and fully-interior links.
        for id in selection {
            if let Some(node) = self.nodes.shift_remove(id) {
                for socket in node.inputs.iter().chain(node.outputs.iter()) {
                    if let Some(s) = self.sockets.shift_remove(socket) {
                        sub.sockets.insert(*socket, s);
                    }
                }
                sub.nodes.insert(*id, node);
            }
        }
        let interior: Vec<LinkId> = self
            .links
            .values()
            .filter(|l| selected.contains(&l.from_node) && selected.contains(&l.to_node))
            .map(|l| l.id)
            .collect();
        for id in interior {
            if let Some(link) = self.links.shift_remove(&id) {
                sub.links.insert(id, link);
            }
        }

        // Now that endpoints live in the interior arenas, materialize the
        // boundary stubs.
        for (from, to) in pending_links {
            sub.raw_link(from, to);
        }
        sub.mark_changed();
        self.next_id = self.next_id.max(sub.next_id);

        self.nodes
            .get_mut(&group_id)
            .expect("group node just created")
            .sub_tree = Some(sub);
        self.mark_changed();
        Ok(group_id)
    }

    /// Dissolve a group node, moving its interior back into this tree.
    pub fn ungroup(&mut self, group: NodeId) -> Result<(), GraphError> {
        let Some(node) = self.nodes.get_mut(&group) else {
            return Err(GraphError::NodeNotFound(group));
        };
        let Some(mut sub) = node.sub_tree.take() else {
            return Err(GraphError::NotAGroup(group));
        };
        self.next_id = self.next_id.max(sub.next_id);

        let group_in = sub
            .nodes()
            .find(|n| n.typeinfo.id_name == builtin::GROUP_IN)
            .map(|n| n.id);
        let group_out = sub
            .nodes()
            .find(|n| n.typeinfo.id_name == builtin::GROUP_OUT)
            .map(|n| n.id);

        // Outer links into the group reconnect to whatever the matching
        // group_in stub fed; symmetric for outputs.
        let group_node_inputs = self.nodes[&group].inputs.clone();
        let group_node_outputs = self.nodes[&group].outputs.clone();

        let outer_links: Vec<LinkId> = self.links.keys().copied().collect();
        for link_id in outer_links {
            let (from_sock, to_sock) = {
                let l = &self.links[&link_id];
                (l.from_sock, l.to_sock)
            };
            if let Some(ordinal) = group_node_inputs.iter().position(|s| *s == to_sock) {
                let interior_target = group_in.and_then(|gi| {
                    let stub = sub.nodes[&gi].outputs.get(ordinal).copied()?;
                    sub.links.values().find(|l| l.from_sock == stub).map(|l| (l.to_node, l.to_sock))
                });
                if let Some((to_node, to_sock)) = interior_target {
                    let link = self.links.get_mut(&link_id).expect("collected above");
                    link.to_node = to_node;
                    link.to_sock = to_sock;
                }
            } else if let Some(ordinal) = group_node_outputs.iter().position(|s| *s == from_sock) {
                let interior_source = group_out.and_then(|go| {
                    let stub = sub.nodes[&go].inputs.get(ordinal).copied()?;
                    sub.links.values().find(|l| l.to_sock == stub).map(|l| (l.from_node, l.from_sock))
                });
                if let Some((from_node, from_sock)) = interior_source {
                    let link = self.links.get_mut(&link_id).expect("collected above");
                    link.from_node = from_node;
                    link.from_sock = from_sock;
                }
            }
        }

        // Move interior nodes and links back, dropping the stubs.
        let stub_nodes: HashSet<NodeId> = group_in.into_iter().chain(group_out).collect();
        let interior_nodes: Vec<NodeId> = sub.nodes.keys().copied().collect();
        for id in interior_nodes {
            if stub_nodes.contains(&id) {
                continue;
            }
            if let Some(node) = sub.nodes.shift_remove(&id) {
                for socket in node.inputs.iter().chain(node.outputs.iter()) {
                    if let Some(s) = sub.sockets.shift_remove(socket) {
                        self.sockets.insert(*socket, s);
                    }
                }
                self.nodes.insert(id, node);
            }
        }
        let interior_links: Vec<LinkId> = sub.links.keys().copied().collect();
        for id in interior_links {
            let touches_stub = {
                let l = &sub.links[&id];
                stub_nodes.contains(&l.from_node) || stub_nodes.contains(&l.to_node)
            };
            if touches_stub {
                continue;
            }
            if let Some(link) = sub.links.shift_remove(&id) {
                self.links.insert(id, link);
            }
        }

        self.remove_node_and_sockets(group);
        self.mark_changed();
        Ok(())
    }
}

impl std::fmt::Debug for NodeTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeTree")
            .field("nodes", &self.nodes.len())
            .field("sockets", &self.sockets.len())
            .field("links", &self.links.len())
            .field("cycle", &self.has_available_link_cycle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use sluice_core::{GroupSyncMember, GroupSyncRequirement, NodeTypeInfo, TypeRegistry};

    use super::*;

    fn descriptor() -> Arc<NodeTreeDescriptor> {
        let registry = Arc::new(TypeRegistry::with_standard_types());
        let mut descriptor = NodeTreeDescriptor::new(registry);

        let mut add = NodeTypeInfo::new("add");
        add.set_declare_function(|b| {
            b.add_input::<i32>("a");
            b.add_input::<i32>("b").default_value(1).min(0).max(10);
            b.add_output::<i32>("result");
        });
        add.set_execution_function(|_| true);
        descriptor.register_node(add);

        let mut scale = NodeTypeInfo::new("scale");
        scale.set_declare_function(|b| {
            b.add_input::<f32>("value");
            b.add_output::<f32>("scaled");
        });
        scale.set_execution_function(|_| true);
        descriptor.register_node(scale);

        let mut merge = NodeTypeInfo::new("merge");
        merge.set_declare_function(|b| {
            b.add_group("inputs", PinDirection::Input).typed::<i32>();
            b.add_output::<i32>("sum");
        });
        merge.set_execution_function(|_| true);
        descriptor.register_node(merge);

        descriptor.register_conversion::<i32, f32>(|v| *v as f32);
        Arc::new(descriptor)
    }

    #[test]
    fn test_add_node_builds_sockets_and_defaults() {
        let mut tree = NodeTree::new(descriptor());
        let n = tree.add_node("add").unwrap();

        let node = tree.node(n).unwrap();
        assert_eq!(node.inputs.len(), 2);
        assert_eq!(node.outputs.len(), 1);

        let b = tree.input_socket(n, "b").unwrap();
        let field = &tree.socket(b).unwrap().data_field;
        assert_eq!(field.value.as_ref().unwrap().downcast_ref::<i32>(), Some(&1));
        assert_eq!(field.min.as_ref().unwrap().downcast_ref::<i32>(), Some(&0));
        assert_eq!(field.max.as_ref().unwrap().downcast_ref::<i32>(), Some(&10));

        let a = tree.input_socket(n, "a").unwrap();
        assert!(tree.socket(a).unwrap().data_field.value.is_none());
    }

    #[test]
    fn test_unknown_kind() {
        let mut tree = NodeTree::new(descriptor());
        assert!(matches!(
            tree.add_node("warp"),
            Err(GraphError::UnknownKind(_))
        ));
    }

    #[test]
    fn test_link_validation() {
        let mut tree = NodeTree::new(descriptor());
        let a = tree.add_node("add").unwrap();
        let b = tree.add_node("add").unwrap();
        let a_out = tree.output_socket(a, "result").unwrap();
        let b_in = tree.input_socket(b, "a").unwrap();
        let b_out = tree.output_socket(b, "result").unwrap();

        // Output to output fails.
        assert!(matches!(
            tree.add_link(a_out, b_out),
            Err(GraphError::DirectionMismatch)
        ));

        tree.add_link(a_out, b_in).unwrap();

        // Wiring the same input again fails unless relinking is allowed.
        let c = tree.add_node("add").unwrap();
        let c_out = tree.output_socket(c, "result").unwrap();
        assert!(matches!(
            tree.add_link(c_out, b_in),
            Err(GraphError::InputAlreadyLinked(_))
        ));
        tree.add_link_with(
            c_out,
            b_in,
            AddLinkOptions {
                allow_relink_to_output: true,
                refresh_topology: true,
            },
        )
        .unwrap();
        tree.ensure_topology_cache();
        assert_eq!(tree.upstream_nodes(b), vec![c]);
    }

    #[test]
    fn test_type_mismatch_without_conversion() {
        let registry = Arc::new(TypeRegistry::with_standard_types());
        let mut d = NodeTreeDescriptor::new(registry);
        let mut add = NodeTypeInfo::new("add");
        add.set_declare_function(|b| {
            b.add_input::<i32>("a");
            b.add_output::<i32>("result");
        });
        d.register_node(add);
        let mut scale = NodeTypeInfo::new("scale");
        scale.set_declare_function(|b| {
            b.add_input::<f32>("value");
            b.add_output::<f32>("scaled");
        });
        d.register_node(scale);

        let mut tree = NodeTree::new(Arc::new(d));
        let a = tree.add_node("add").unwrap();
        let s = tree.add_node("scale").unwrap();
        let result = tree.add_link(
            tree.output_socket(a, "result").unwrap(),
            tree.input_socket(s, "value").unwrap(),
        );
        assert!(matches!(result, Err(GraphError::LinkTypeMismatch { .. })));
    }

    #[test]
    fn test_conversion_chain_insert_and_delete() {
        let mut tree = NodeTree::new(descriptor());
        let a = tree.add_node("add").unwrap();
        let s = tree.add_node("scale").unwrap();
        let head = tree
            .add_link(
                tree.output_socket(a, "result").unwrap(),
                tree.input_socket(s, "value").unwrap(),
            )
            .unwrap();

        // Invisible conversion node plus two physical links.
        assert_eq!(tree.node_count(), 3);
        assert_eq!(tree.link_count(), 2);
        let chain = tree.chain_links(head);
        assert_eq!(chain.len(), 2);
        assert_eq!(
            tree.chain_target(head),
            tree.input_socket(s, "value")
        );

        // Deleting any chain link removes the whole chain and the
        // conversion node.
        tree.delete_link(chain[1]).unwrap();
        assert_eq!(tree.node_count(), 2);
        assert_eq!(tree.link_count(), 0);
    }

    #[test]
    fn test_delete_node_cascades_links() {
        let mut tree = NodeTree::new(descriptor());
        let a = tree.add_node("add").unwrap();
        let b = tree.add_node("add").unwrap();
        let c = tree.add_node("add").unwrap();
        tree.add_link(
            tree.output_socket(a, "result").unwrap(),
            tree.input_socket(b, "a").unwrap(),
        )
        .unwrap();
        tree.add_link(
            tree.output_socket(b, "result").unwrap(),
            tree.input_socket(c, "a").unwrap(),
        )
        .unwrap();

        tree.delete_node(b).unwrap();
        assert_eq!(tree.node_count(), 2);
        assert_eq!(tree.link_count(), 0);
        assert!(tree.find_node(b).is_none());
    }

    #[test]
    fn test_group_add_socket_positions() {
        let mut tree = NodeTree::new(descriptor());
        let m = tree.add_node("merge").unwrap();

        let s1 = tree.group_add_socket(m, "inputs", "i32", "in_0", "In 0").unwrap();
        let s2 = tree.group_add_socket(m, "inputs", "i32", "in_1", "In 1").unwrap();

        let node = tree.node(m).unwrap();
        let group = node.find_group("inputs", PinDirection::Input).unwrap();
        // Placeholder stays last.
        assert_eq!(group.sockets.len(), 3);
        assert_eq!(group.sockets[0], s1);
        assert_eq!(group.sockets[1], s2);
        assert!(tree.socket(group.sockets[2]).unwrap().is_placeholder());
        assert_eq!(group.named_len(), 2);
    }

    #[test]
    fn test_sync_groups_mirror_add_and_remove() {
        let mut tree = NodeTree::new(descriptor());
        let m1 = tree.add_node("merge").unwrap();
        let m2 = tree.add_node("merge").unwrap();
        tree.add_sync_group(
            (m1, PinDirection::Input, "inputs"),
            (m2, PinDirection::Input, "inputs"),
        )
        .unwrap();

        tree.group_add_socket(m1, "inputs", "i32", "in_0", "In 0").unwrap();
        let sizes = |tree: &NodeTree| {
            (
                tree.node(m1).unwrap().find_group("inputs", PinDirection::Input).unwrap().named_len(),
                tree.node(m2).unwrap().find_group("inputs", PinDirection::Input).unwrap().named_len(),
            )
        };
        assert_eq!(sizes(&tree), (1, 1));

        let removed = tree.group_remove_socket(m1, "inputs", "in_0").unwrap();
        assert!(removed);
        assert_eq!(sizes(&tree), (0, 0));
    }

    #[test]
    fn test_sync_group_remove_aborts_when_mirror_linked() {
        let mut tree = NodeTree::new(descriptor());
        let m1 = tree.add_node("merge").unwrap();
        let m2 = tree.add_node("merge").unwrap();
        tree.add_sync_group(
            (m1, PinDirection::Input, "inputs"),
            (m2, PinDirection::Input, "inputs"),
        )
        .unwrap();
        tree.group_add_socket(m1, "inputs", "i32", "in_0", "In 0").unwrap();

        // Wire the mirror socket on m2.
        let producer = tree.add_node("add").unwrap();
        let mirror = {
            let group = tree.node(m2).unwrap().find_group("inputs", PinDirection::Input).unwrap();
            group.sockets[0]
        };
        tree.add_link(tree.output_socket(producer, "result").unwrap(), mirror)
            .unwrap();

        let removed = tree.group_remove_socket(m1, "inputs", "in_0").unwrap();
        assert!(!removed);
        // Parity holds on both sides.
        let g1 = tree.node(m1).unwrap().find_group("inputs", PinDirection::Input).unwrap().sockets.len();
        let g2 = tree.node(m2).unwrap().find_group("inputs", PinDirection::Input).unwrap().sockets.len();
        assert_eq!(g1, g2);
    }

    #[test]
    fn test_companion_requirement_spawns_and_pairs() {
        let mut tree = NodeTree::new(descriptor());
        let sim_in = tree.add_node(builtin::SIMULATION_IN).unwrap();

        // The companion appeared and the pairing is symmetric.
        assert_eq!(tree.node_count(), 2);
        let sim_out = tree.node(sim_in).unwrap().paired_node.unwrap();
        assert_eq!(
            tree.node(sim_out).unwrap().typeinfo.id_name,
            builtin::SIMULATION_OUT
        );
        assert_eq!(tree.node(sim_out).unwrap().paired_node, Some(sim_in));
    }

    #[test]
    fn test_companion_requirement_syncs_groups() {
        let registry = Arc::new(TypeRegistry::with_standard_types());
        let mut d = NodeTreeDescriptor::new(registry);
        for kind in ["loop_in", "loop_out"] {
            let direction = if kind == "loop_in" {
                PinDirection::Output
            } else {
                PinDirection::Input
            };
            let mut info = NodeTypeInfo::new(kind);
            info.set_declare_function(move |b| {
                b.add_group("state", direction);
            });
            d.register_node(info);
        }
        d.add_requirement(GroupSyncRequirement {
            members: vec![
                GroupSyncMember {
                    node_kind: "loop_in".to_string(),
                    group: "state".to_string(),
                    direction: PinDirection::Output,
                },
                GroupSyncMember {
                    node_kind: "loop_out".to_string(),
                    group: "state".to_string(),
                    direction: PinDirection::Input,
                },
            ],
        });

        let mut tree = NodeTree::new(Arc::new(d));
        let loop_in = tree.add_node("loop_in").unwrap();
        let loop_out = tree.node(loop_in).unwrap().paired_node.unwrap();

        tree.group_add_socket(loop_in, "state", "i32", "s0", "S 0").unwrap();
        let out_group = tree
            .node(loop_out)
            .unwrap()
            .find_group("state", PinDirection::Input)
            .unwrap();
        assert_eq!(out_group.named_len(), 1);
    }

    #[test]
    fn test_group_up_and_ungroup() {
        let mut tree = NodeTree::new(descriptor());
        let a = tree.add_node("add").unwrap();
        let b = tree.add_node("add").unwrap();
        let c = tree.add_node("add").unwrap();
        tree.add_link(
            tree.output_socket(a, "result").unwrap(),
            tree.input_socket(b, "a").unwrap(),
        )
        .unwrap();
        tree.add_link(
            tree.output_socket(b, "result").unwrap(),
            tree.input_socket(c, "a").unwrap(),
        )
        .unwrap();

        let group = tree.group_up(&[b]).unwrap();
        // Outer tree: a, group, c.
        assert_eq!(tree.node_count(), 3);
        let group_node = tree.node(group).unwrap();
        assert!(group_node.is_group());
        assert_eq!(group_node.inputs.len(), 1);
        assert_eq!(group_node.outputs.len(), 1);

        let sub = group_node.sub_tree.as_ref().unwrap();
        // Interior: b plus the two stubs.
        assert_eq!(sub.node_count(), 3);
        assert_eq!(sub.link_count(), 2);

        // Boundary links reattach to the group node.
        tree.ensure_topology_cache();
        assert_eq!(tree.downstream_nodes(a), vec![group]);
        assert_eq!(tree.upstream_nodes(c), vec![group]);

        tree.ungroup(group).unwrap();
        assert_eq!(tree.node_count(), 3);
        assert!(tree.find_node(b).is_some());
        tree.ensure_topology_cache();
        assert_eq!(tree.downstream_nodes(a), vec![b]);
        assert_eq!(tree.downstream_nodes(b), vec![c]);
    }

    #[test]
    fn test_clear_keeps_allocator_monotone() {
        let mut tree = NodeTree::new(descriptor());
        let a = tree.add_node("add").unwrap();
        tree.clear();
        assert_eq!(tree.node_count(), 0);
        let b = tree.add_node("add").unwrap();
        assert!(b.raw() > a.raw());
    }
}
