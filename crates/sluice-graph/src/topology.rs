//! Topology cache: toposort, cycle detection, resolved adjacency.
//!
//! The cache is invalidated by every structural mutation and rebuilt on
//! demand by [`NodeTree::ensure_topology_cache`], which is idempotent. The
//! toposort is a stable Kahn's algorithm: ready nodes are processed in
//! insertion order, so ties between independent nodes resolve the same way
//! on every rebuild.

use std::collections::VecDeque;

use indexmap::IndexMap;

use crate::ids::NodeId;
use crate::tree::NodeTree;

/// Cached orderings, rebuilt together with the per-socket adjacency.
#[derive(Debug, Default)]
pub(crate) struct TopologyCache {
    pub(crate) valid: bool,
    pub(crate) left_to_right: Vec<NodeId>,
    pub(crate) right_to_left: Vec<NodeId>,
}

impl NodeTree {
    /// Rebuild the topology cache if a mutation invalidated it.
    pub fn ensure_topology_cache(&mut self) {
        if self.topology.valid {
            return;
        }
        self.rebuild_adjacency();
        self.rebuild_toposort();
        self.topology.valid = true;
    }

    /// Per-socket adjacency: which links touch a socket and which peer
    /// sockets they resolve to.
    fn rebuild_adjacency(&mut self) {
        let socket_ids: Vec<_> = self.sockets.keys().copied().collect();
        for id in socket_ids {
            let socket = self.sockets.get_mut(&id).expect("collected above");
            socket.directly_linked_links.clear();
            socket.directly_linked_sockets.clear();
        }
        let link_info: Vec<_> = self
            .links
            .values()
            .map(|l| (l.id, l.from_sock, l.to_sock))
            .collect();
        for (link, from, to) in link_info {
            if let Some(socket) = self.sockets.get_mut(&from) {
                socket.directly_linked_links.push(link);
                socket.directly_linked_sockets.push(to);
            }
            if let Some(socket) = self.sockets.get_mut(&to) {
                socket.directly_linked_links.push(link);
                socket.directly_linked_sockets.push(from);
            }
        }
    }

    fn rebuild_toposort(&mut self) {
        let mut in_degree: IndexMap<NodeId, usize> =
            self.nodes.keys().map(|id| (*id, 0)).collect();
        let mut successors: IndexMap<NodeId, Vec<NodeId>> =
            self.nodes.keys().map(|id| (*id, Vec::new())).collect();

        for link in self.links.values() {
            if let Some(d) = in_degree.get_mut(&link.to_node) {
                *d += 1;
            }
            if let Some(s) = successors.get_mut(&link.from_node) {
                s.push(link.to_node);
            }
        }

        // FIFO seeded in insertion order keeps ties stable.
        let mut queue: VecDeque<NodeId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(node) = queue.pop_front() {
            order.push(node);
            for next in &successors[&node] {
                let degree = in_degree.get_mut(next).expect("seeded above");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*next);
                }
            }
        }

        self.has_available_link_cycle = order.len() != self.nodes.len();
        if self.has_available_link_cycle {
            // Keep the order total so callers can still display something.
            for id in self.nodes.keys() {
                if !order.contains(id) {
                    order.push(*id);
                }
            }
        }

        self.topology.right_to_left = order.iter().rev().copied().collect();
        self.topology.left_to_right = order;
    }

    /// Toposorted node ids, sources first. Requires a fresh cache.
    pub fn get_toposort_left_to_right(&self) -> &[NodeId] {
        &self.topology.left_to_right
    }

    /// Toposorted node ids, sinks first. Requires a fresh cache.
    pub fn get_toposort_right_to_left(&self) -> &[NodeId] {
        &self.topology.right_to_left
    }

    /// Nodes directly downstream of `node` through current adjacency.
    pub fn downstream_nodes(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let Some(n) = self.node(node) else { return out };
        for output in &n.outputs {
            let Some(socket) = self.socket(*output) else { continue };
            for peer in &socket.directly_linked_sockets {
                if let Some(peer) = self.socket(*peer) {
                    if !out.contains(&peer.node) {
                        out.push(peer.node);
                    }
                }
            }
        }
        out
    }

    /// Nodes directly upstream of `node` through current adjacency.
    pub fn upstream_nodes(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let Some(n) = self.node(node) else { return out };
        for input in &n.inputs {
            let Some(socket) = self.socket(*input) else { continue };
            for peer in &socket.directly_linked_sockets {
                if let Some(peer) = self.socket(*peer) {
                    if !out.contains(&peer.node) {
                        out.push(peer.node);
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sluice_core::{NodeTreeDescriptor, NodeTypeInfo, TypeRegistry};

    use super::*;

    fn descriptor() -> Arc<NodeTreeDescriptor> {
        let registry = Arc::new(TypeRegistry::with_standard_types());
        let mut descriptor = NodeTreeDescriptor::new(registry);
        let mut add = NodeTypeInfo::new("add");
        add.set_declare_function(|b| {
            b.add_input::<i32>("a");
            b.add_input::<i32>("b").default_value(1);
            b.add_output::<i32>("result");
        });
        add.set_execution_function(|_| true);
        descriptor.register_node(add);
        Arc::new(descriptor)
    }

    #[test]
    fn test_toposort_chain() {
        let mut tree = NodeTree::new(descriptor());
        let a = tree.add_node("add").unwrap();
        let b = tree.add_node("add").unwrap();
        let c = tree.add_node("add").unwrap();
        tree.add_link(
            tree.output_socket(b, "result").unwrap(),
            tree.input_socket(c, "a").unwrap(),
        )
        .unwrap();
        tree.add_link(
            tree.output_socket(a, "result").unwrap(),
            tree.input_socket(b, "a").unwrap(),
        )
        .unwrap();

        tree.ensure_topology_cache();
        assert_eq!(tree.get_toposort_left_to_right(), &[a, b, c]);
        assert_eq!(tree.get_toposort_right_to_left(), &[c, b, a]);
        assert!(!tree.has_available_link_cycle);
    }

    #[test]
    fn test_toposort_tie_stability() {
        let mut tree = NodeTree::new(descriptor());
        // Three independent sources feeding one sink; ties resolve in
        // insertion order, run after run.
        let sources: Vec<_> = (0..3).map(|_| tree.add_node("add").unwrap()).collect();
        let sink = tree.add_node("add").unwrap();
        tree.add_link(
            tree.output_socket(sources[2], "result").unwrap(),
            tree.input_socket(sink, "a").unwrap(),
        )
        .unwrap();

        tree.ensure_topology_cache();
        let first = tree.get_toposort_left_to_right().to_vec();
        assert_eq!(&first[..3], &sources[..]);

        tree.ensure_topology_cache();
        assert_eq!(tree.get_toposort_left_to_right(), &first[..]);
    }

    #[test]
    fn test_adjacency_resolution() {
        let mut tree = NodeTree::new(descriptor());
        let a = tree.add_node("add").unwrap();
        let b = tree.add_node("add").unwrap();
        let out = tree.output_socket(a, "result").unwrap();
        let input = tree.input_socket(b, "a").unwrap();
        let link = tree.add_link(out, input).unwrap();

        tree.ensure_topology_cache();
        let out_sock = tree.socket(out).unwrap();
        assert_eq!(out_sock.directly_linked_sockets, vec![input]);
        assert_eq!(out_sock.directly_linked_links, vec![link]);
        let in_sock = tree.socket(input).unwrap();
        assert_eq!(in_sock.directly_linked_sockets, vec![out]);

        assert_eq!(tree.downstream_nodes(a), vec![b]);
        assert_eq!(tree.upstream_nodes(b), vec![a]);
    }

    #[test]
    fn test_cycle_rejected_by_link_creation() {
        let mut tree = NodeTree::new(descriptor());
        let a = tree.add_node("add").unwrap();
        let b = tree.add_node("add").unwrap();
        tree.add_link(
            tree.output_socket(a, "result").unwrap(),
            tree.input_socket(b, "a").unwrap(),
        )
        .unwrap();

        let back = tree.add_link(
            tree.output_socket(b, "result").unwrap(),
            tree.input_socket(a, "a").unwrap(),
        );
        assert!(matches!(back, Err(crate::GraphError::WouldCycle)));
        tree.ensure_topology_cache();
        assert!(!tree.has_available_link_cycle);
    }
}
