//! The eager tree executor.
//!
//! One executor drives one tree at a time, single-threaded. A run is
//! `prepare_tree` followed by `execute_tree`:
//!
//! 1. refresh the topology cache,
//! 2. compile the required set (always-required kinds, or the explicitly
//!    requested node, plus transitive upstream, plus any dirty node that
//!    feeds into the required set),
//! 3. build dense value slots for the required sockets, seeding each slot
//!    from the persistent cache when the socket identity was seen before,
//! 4. refresh named storage,
//! 5. walk the required nodes in toposort order, skipping nodes whose
//!    slots are all cache-valid, forwarding outputs to downstream inputs,
//! 6. capture storage sinks, then write every slot back to the persistent
//!    cache.
//!
//! Per-node failures are reported on the node (`missing_input`,
//! `execution_failed`); the run itself never aborts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use sluice_core::{builtin, ExecParams, PinDirection, TypedValue};
use sluice_graph::{Node, NodeId, NodeTree, SocketId};
use tracing::debug;

/// Executor strategy behind the host.
pub trait TreeExecutor {
    /// Compile the required set and prepare value slots.
    fn prepare_tree(&mut self, tree: &mut NodeTree, required: Option<NodeId>);

    /// Run the required nodes of a prepared tree.
    fn execute_tree(&mut self, tree: &mut NodeTree);

    /// `prepare_tree` + `execute_tree`.
    fn execute(&mut self, tree: &mut NodeTree, required: Option<NodeId>) {
        self.prepare_tree(tree, required);
        self.execute_tree(tree);
    }

    /// Write an input slot from outside; marks the node and its downstream
    /// dirty when the value actually changed.
    fn sync_node_from_external_storage(
        &mut self,
        tree: &mut NodeTree,
        socket: SocketId,
        value: TypedValue,
    );

    /// Read a slot value out.
    fn sync_node_to_external_storage(&self, socket: SocketId) -> Option<TypedValue>;

    /// Peek at a slot value.
    fn get_socket_value(&self, socket: SocketId) -> Option<&TypedValue>;

    /// Mark a node dirty (editor hook for structural edits).
    fn notify_node_dirty(&mut self, node: NodeId);

    /// Mark a socket's node and its downstream dirty (editor hook for value
    /// edits).
    fn notify_socket_dirty(&mut self, tree: &NodeTree, socket: SocketId);

    /// Coarse reset after add/remove of links or nodes. Persistent values
    /// survive for still-live socket identities; validity flags do not.
    fn mark_tree_structure_changed(&mut self);

    /// Install the run-wide global payload.
    fn set_global_payload(&mut self, payload: TypedValue);

    /// Drop run state: named storage, payload, caches.
    fn finalize(&mut self, tree: &mut NodeTree);

    /// A fresh executor of the same strategy.
    fn clone_empty(&self) -> Box<dyn TreeExecutor>;
}

/// Runtime slot of one input socket.
#[derive(Debug, Clone, Default)]
struct InputState {
    value: TypedValue,
    is_forwarded: bool,
    is_last_used: bool,
    keep_alive: bool,
    is_cached: bool,
}

/// Runtime slot of one output socket.
#[derive(Debug, Clone, Default)]
struct OutputState {
    value: TypedValue,
    is_last_used: bool,
    is_cached: bool,
}

/// Single-threaded executor with a persistent per-socket value cache.
///
/// The aim is simplicity and robustness: one pass over the toposorted
/// required nodes, copy-forwarding, and dirty tracking that lets unchanged
/// subgraphs skip their callbacks entirely.
#[derive(Default)]
pub struct EagerExecutor {
    input_states: Vec<InputState>,
    output_states: Vec<OutputState>,
    index_cache: HashMap<SocketId, (PinDirection, usize)>,

    nodes_to_execute: Vec<NodeId>,
    nodes_to_execute_count: usize,
    input_sockets: Vec<SocketId>,
    output_sockets: Vec<SocketId>,

    persistent_input_cache: HashMap<SocketId, InputState>,
    persistent_output_cache: HashMap<SocketId, OutputState>,

    dirty_nodes: HashSet<NodeId>,
    node_dirty_cache: HashMap<NodeId, bool>,

    storage: HashMap<String, TypedValue>,
    global_payload: Arc<TypedValue>,

    sub_executors: HashMap<NodeId, EagerExecutor>,
}

impl EagerExecutor {
    /// Create an executor with empty caches.
    pub fn new() -> Self {
        Self::default()
    }

    // === Dirty tracking =================================================

    fn mark_node_dirty(&mut self, node: NodeId) {
        self.dirty_nodes.insert(node);
        self.node_dirty_cache.insert(node, true);
    }

    fn mark_node_clean(&mut self, node: NodeId) {
        self.node_dirty_cache.insert(node, false);
    }

    /// Whether the node is currently tracked dirty.
    pub fn is_node_dirty(&self, node: NodeId) -> bool {
        self.node_dirty_cache.get(&node) == Some(&true)
    }

    /// The currently tracked dirty nodes.
    pub fn dirty_nodes(&self) -> Vec<NodeId> {
        self.dirty_nodes.iter().copied().collect()
    }

    /// Re-seed the dirty set, e.g. when restoring simulation state.
    pub fn set_nodes_dirty(&mut self, nodes: &[NodeId]) {
        for node in nodes {
            self.mark_node_dirty(*node);
        }
    }

    fn invalidate_cache_for_node(&mut self, tree: &NodeTree, node: NodeId) {
        let Some(n) = tree.node(node) else { return };
        for socket in n.inputs.iter().chain(n.outputs.iter()) {
            if let Some(&(direction, idx)) = self.index_cache.get(socket) {
                match direction {
                    PinDirection::Input => self.input_states[idx].is_cached = false,
                    PinDirection::Output => self.output_states[idx].is_cached = false,
                }
            }
            if let Some(state) = self.persistent_input_cache.get_mut(socket) {
                state.is_cached = false;
            }
            if let Some(state) = self.persistent_output_cache.get_mut(socket) {
                state.is_cached = false;
            }
        }
    }

    /// Worklist walk marking `start`'s downstream dirty. Explicit stack, so
    /// wide fan-out graphs cannot overflow.
    fn propagate_dirty_downstream(&mut self, tree: &NodeTree, start: NodeId) {
        let mut to_visit = tree.downstream_nodes(start);
        while let Some(current) = to_visit.pop() {
            if self.is_node_dirty(current) {
                continue;
            }
            self.mark_node_dirty(current);
            self.invalidate_cache_for_node(tree, current);
            to_visit.extend(tree.downstream_nodes(current));
        }
    }

    // === Compile ========================================================

    fn collect_required_upstream(tree: &mut NodeTree, start: NodeId) {
        let mut stack = vec![start];
        while let Some(node_id) = stack.pop() {
            let upstream = tree.upstream_nodes(node_id);
            for up in upstream {
                let Some(node) = tree.node_mut(up) else { continue };
                if !node.required {
                    node.required = true;
                    stack.push(up);
                }
            }
        }
    }

    fn compile(&mut self, tree: &mut NodeTree, required: Option<NodeId>) {
        if tree.has_available_link_cycle {
            return;
        }

        self.nodes_to_execute = tree.get_toposort_left_to_right().to_vec();
        for id in &self.nodes_to_execute {
            if let Some(node) = tree.node_mut(*id) {
                node.required = false;
            }
        }

        // Walk sinks first so upstream collection sees final flags.
        for i in (0..self.nodes_to_execute.len()).rev() {
            let id = self.nodes_to_execute[i];
            let is_required = match required {
                None => tree.node(id).is_some_and(|n| n.typeinfo.always_required),
                Some(r) => id == r,
            };
            if is_required {
                if let Some(node) = tree.node_mut(id) {
                    node.required = true;
                }
            }
            if tree.node(id).is_some_and(|n| n.required) {
                Self::collect_required_upstream(tree, id);
            }
        }

        // A dirty node that feeds into the required set must run too, along
        // with its own upstream.
        let dirty: Vec<NodeId> = self.dirty_nodes.iter().copied().collect();
        for dirty_node in dirty {
            if tree.node(dirty_node).is_none() {
                continue;
            }
            let mut feeds_required = false;
            let mut to_check = vec![dirty_node];
            let mut visited = HashSet::new();
            while let Some(current) = to_check.pop() {
                if !visited.insert(current) {
                    continue;
                }
                if tree.node(current).is_some_and(|n| n.required) {
                    feeds_required = true;
                    break;
                }
                to_check.extend(tree.downstream_nodes(current));
            }
            if feeds_required {
                if let Some(node) = tree.node_mut(dirty_node) {
                    node.required = true;
                }
                Self::collect_required_upstream(tree, dirty_node);
            }
        }

        // Stable partition keeps relative toposort order among the
        // required nodes.
        let (required_nodes, rest): (Vec<NodeId>, Vec<NodeId>) = self
            .nodes_to_execute
            .iter()
            .copied()
            .partition(|id| tree.node(*id).is_some_and(|n| n.required));
        self.nodes_to_execute_count = required_nodes.len();
        self.nodes_to_execute = required_nodes;
        self.nodes_to_execute.extend(rest);

        for i in 0..self.nodes_to_execute_count {
            let id = self.nodes_to_execute[i];
            let Some(node) = tree.node(id) else { continue };
            self.input_sockets.extend(node.inputs.iter().copied());
            self.output_sockets.extend(node.outputs.iter().copied());
        }
        debug!(
            required = self.nodes_to_execute_count,
            total = self.nodes_to_execute.len(),
            "compiled tree"
        );
    }

    fn prepare_memory(&mut self, tree: &NodeTree) {
        let mut index_cache = HashMap::new();
        let mut input_states = Vec::with_capacity(self.input_sockets.len());
        let mut output_states = Vec::with_capacity(self.output_sockets.len());

        for (i, socket) in self.input_sockets.iter().enumerate() {
            index_cache.insert(*socket, (PinDirection::Input, i));
            let state = match self.persistent_input_cache.remove(socket) {
                Some(mut state) => {
                    state.is_forwarded = false;
                    state.is_last_used = false;
                    state.keep_alive = false;
                    state
                }
                None => {
                    let mut state = InputState::default();
                    if let Some(ty) = tree.socket(*socket).and_then(|s| s.ty.clone()) {
                        state.value = ty.default_value();
                    }
                    state
                }
            };
            input_states.push(state);
        }

        for (i, socket) in self.output_sockets.iter().enumerate() {
            index_cache.insert(*socket, (PinDirection::Output, i));
            let state = match self.persistent_output_cache.remove(socket) {
                Some(mut state) => {
                    state.is_last_used = false;
                    state
                }
                None => {
                    let mut state = OutputState::default();
                    if let Some(ty) = tree.socket(*socket).and_then(|s| s.ty.clone()) {
                        state.value = ty.default_value();
                    }
                    state
                }
            };
            output_states.push(state);
        }

        self.index_cache = index_cache;
        self.input_states = input_states;
        self.output_states = output_states;
    }

    /// Reset per-run flags; cached values stay.
    fn clear_transient(&mut self) {
        self.nodes_to_execute.clear();
        self.nodes_to_execute_count = 0;
        self.input_sockets.clear();
        self.output_sockets.clear();
        for state in &mut self.input_states {
            state.is_forwarded = false;
            state.is_last_used = false;
            state.keep_alive = false;
        }
        for state in &mut self.output_states {
            state.is_last_used = false;
        }
    }

    // === Named storage ==================================================

    /// The storage name comes from the first input's default field only; a
    /// wired name socket does not take effect.
    fn storage_name(tree: &NodeTree, node: &Node) -> Option<String> {
        let first = *node.inputs.first()?;
        let socket = tree.socket(first)?;
        socket
            .data_field
            .value
            .as_ref()
            .and_then(|v| v.downcast_ref::<String>())
            .cloned()
    }

    /// Make sure every live storage name has an entry, then drop the names
    /// no `func_storage_in` refers to anymore.
    fn refresh_storage(&mut self, tree: &NodeTree) {
        let mut refreshed: HashSet<String> = HashSet::new();
        for socket_id in self.input_sockets.clone() {
            let Some(socket) = tree.socket(socket_id) else { continue };
            if socket.ty.is_some() {
                continue;
            }
            let Some(node) = tree.node(socket.node) else { continue };
            if node.typeinfo.id_name != builtin::STORAGE_IN {
                continue;
            }
            if socket.directly_linked_sockets.is_empty() {
                continue;
            }
            let Some(name) = Self::storage_name(tree, node) else { continue };
            if !self.storage.contains_key(&name) {
                let seed = socket
                    .directly_linked_sockets
                    .first()
                    .and_then(|peer| tree.socket(*peer))
                    .and_then(|peer| peer.ty.as_ref())
                    .map(|ty| ty.default_value())
                    .unwrap_or_default();
                self.storage.insert(name.clone(), seed);
            }
            refreshed.insert(name);
        }

        let dead: Vec<String> = self
            .storage
            .keys()
            .filter(|k| !refreshed.contains(*k))
            .cloned()
            .collect();
        for key in dead {
            debug!(name = %key, "dropping unreferenced storage entry");
            self.storage.remove(&key);
        }
    }

    /// Capture wired inputs of required `func_storage_in` nodes.
    fn try_storage(&mut self, tree: &NodeTree) {
        for socket_id in self.input_sockets.clone() {
            let Some(socket) = tree.socket(socket_id) else { continue };
            if socket.ty.is_some() {
                continue;
            }
            let Some(node) = tree.node(socket.node) else { continue };
            if node.typeinfo.id_name != builtin::STORAGE_IN {
                continue;
            }
            let Some(name) = Self::storage_name(tree, node) else { continue };
            let data = self
                .find_value(socket_id)
                .cloned()
                .unwrap_or_default();
            self.storage.insert(name, data);
        }
    }

    /// Special execution of `func_storage_out`: publish the stored value
    /// into the output slot, bypassing the kind callback.
    ///
    /// `Some(success)` means the node was handled here.
    fn try_fill_storage_to_node(&mut self, tree: &mut NodeTree, node_id: NodeId) -> Option<bool> {
        {
            let node = tree.node(node_id)?;
            if !node.required || node.typeinfo.id_name != builtin::STORAGE_OUT {
                return None;
            }
        }
        let name = {
            let node = tree.node(node_id)?;
            Self::storage_name(tree, node).unwrap_or_default()
        };
        let output = *tree.node(node_id)?.outputs.first()?;

        let Some(stored) = self.storage.get(&name).cloned() else {
            if let Some(node) = tree.node_mut(node_id) {
                node.execution_failed =
                    Some(format!("No cache can be found with name {name} (yet)."));
            }
            return Some(false);
        };

        if let Some(stored_ty) = stored.ty() {
            let peers = tree
                .socket(output)
                .map(|s| s.directly_linked_sockets.clone())
                .unwrap_or_default();
            for peer in peers {
                let Some(&(_, idx)) = self.index_cache.get(&peer) else { continue };
                let slot_ty = self.input_states[idx].value.ty();
                if slot_ty.is_some() && slot_ty != Some(stored_ty) {
                    if let Some(node) = tree.node_mut(node_id) {
                        node.execution_failed =
                            Some("Type Mismatch, filling default value.".to_string());
                    }
                    return Some(false);
                }
            }
        }

        if let Some(&(_, idx)) = self.index_cache.get(&output) {
            self.output_states[idx].value = stored;
        }
        if let Some(node) = tree.node_mut(node_id) {
            node.execution_failed = None;
        }
        Some(true)
    }

    // === Execute ========================================================

    /// Resolve one input slot for param assembly.
    ///
    /// Order matters: a forwarded value wins, then an unwired default, then
    /// optional inputs resolve to nothing, and anything else is a missing
    /// input.
    fn resolve_input(&mut self, tree: &NodeTree, socket_id: SocketId, missing: &mut bool) -> Option<TypedValue> {
        let socket = tree.socket(socket_id)?;
        let Some(&(_, idx)) = self.index_cache.get(&socket_id) else {
            if !socket.optional {
                *missing = true;
            }
            return None;
        };
        if self.input_states[idx].is_forwarded {
            return Some(self.input_states[idx].value.clone());
        }
        if socket.directly_linked_sockets.is_empty() {
            if let Some(default) = socket.data_field.value.clone() {
                self.input_states[idx].value = default.clone();
                return Some(default);
            }
        }
        if socket.optional {
            return None;
        }
        *missing = true;
        Some(self.input_states[idx].value.clone())
    }

    fn prepare_params(&mut self, tree: &mut NodeTree, node_id: NodeId) -> ExecParams {
        if let Some(node) = tree.node_mut(node_id) {
            node.missing_input = false;
        }
        let (input_ids, output_ids) = {
            let node = tree.node(node_id).expect("caller checked");
            (node.inputs.clone(), node.outputs.clone())
        };

        let mut missing = false;
        let mut inputs = Vec::with_capacity(input_ids.len());
        for socket_id in input_ids {
            let Some(socket) = tree.socket(socket_id) else { continue };
            if socket.is_placeholder() {
                continue;
            }
            let identifier = socket.identifier.clone();
            let value = self.resolve_input(tree, socket_id, &mut missing);
            inputs.push((identifier, value));
        }

        let mut outputs = Vec::with_capacity(output_ids.len());
        for socket_id in output_ids {
            let Some(socket) = tree.socket(socket_id) else { continue };
            if socket.is_placeholder() {
                continue;
            }
            let value = self
                .index_cache
                .get(&socket_id)
                .map(|&(_, idx)| self.output_states[idx].value.clone())
                .unwrap_or_default();
            outputs.push((socket.identifier.clone(), value));
        }

        let storage = tree
            .node_mut(node_id)
            .map(|n| n.storage.take())
            .unwrap_or_default();
        if missing {
            if let Some(node) = tree.node_mut(node_id) {
                node.missing_input = true;
            }
        }
        ExecParams::new(inputs, outputs, storage, self.global_payload.clone())
    }

    fn execute_node(&mut self, tree: &mut NodeTree, node_id: NodeId) -> bool {
        if let Some(success) = self.try_fill_storage_to_node(tree, node_id) {
            return success;
        }
        if tree.node(node_id).is_some_and(|n| n.is_group()) {
            return self.execute_group(tree, node_id);
        }

        let mut params = self.prepare_params(tree, node_id);
        if tree.node(node_id).is_some_and(|n| n.missing_input) {
            // Callbacks never see half-filled inputs; hand storage back.
            let (_, storage, _) = params.into_parts();
            if let Some(node) = tree.node_mut(node_id) {
                node.storage = storage;
            }
            return false;
        }

        let typeinfo = tree.node(node_id).expect("caller checked").typeinfo.clone();
        let ok = typeinfo.execute(&mut params);
        let (outputs, storage, error) = params.into_parts();

        for (identifier, value) in outputs {
            if let Some(socket_id) = tree.output_socket(node_id, &identifier) {
                if let Some(&(_, idx)) = self.index_cache.get(&socket_id) {
                    self.output_states[idx].value = value;
                }
            }
        }
        if let Some(node) = tree.node_mut(node_id) {
            node.storage = storage;
            if ok {
                node.execution_failed = None;
            } else {
                node.execution_failed =
                    Some(error.unwrap_or_else(|| "Execution failed".to_string()));
            }
        }
        ok
    }

    /// Run a group node by driving its interior tree with a cached child
    /// executor. Outer input slots feed the interior `group_in` outputs,
    /// interior `group_out` inputs feed the outer outputs; correspondence
    /// is ordinal.
    fn execute_group(&mut self, tree: &mut NodeTree, node_id: NodeId) -> bool {
        let Some(mut sub) = tree.node_mut(node_id).and_then(|n| n.sub_tree.take()) else {
            return false;
        };
        let (input_ids, output_ids) = {
            let node = tree.node(node_id).expect("caller checked");
            (node.inputs.clone(), node.outputs.clone())
        };

        let mut missing = false;
        let mut input_values = Vec::with_capacity(input_ids.len());
        for socket_id in &input_ids {
            let value = self
                .resolve_input(tree, *socket_id, &mut missing)
                .unwrap_or_default();
            input_values.push(value);
        }
        if missing {
            if let Some(node) = tree.node_mut(node_id) {
                node.missing_input = true;
                node.sub_tree = Some(sub);
            }
            return false;
        }

        let group_in = sub
            .nodes()
            .find(|n| n.typeinfo.id_name == builtin::GROUP_IN)
            .map(|n| n.id);
        let group_out = sub
            .nodes()
            .find(|n| n.typeinfo.id_name == builtin::GROUP_OUT)
            .map(|n| n.id);

        let child = self.sub_executors.entry(node_id).or_default();
        child.global_payload = self.global_payload.clone();
        child.prepare_tree(&mut sub, None);

        if let Some(group_in) = group_in {
            let stubs = sub.node(group_in).map(|n| n.outputs.clone()).unwrap_or_default();
            for (ordinal, stub) in stubs.iter().enumerate() {
                if let Some(value) = input_values.get(ordinal) {
                    child.inject_output(&sub, *stub, value.clone());
                }
            }
        }

        child.execute_tree(&mut sub);

        if let Some(group_out) = group_out {
            let stubs = sub.node(group_out).map(|n| n.inputs.clone()).unwrap_or_default();
            for (ordinal, outer) in output_ids.iter().enumerate() {
                let Some(&(_, out_idx)) = self.index_cache.get(outer) else { continue };
                if let Some(value) = stubs.get(ordinal).and_then(|s| child.find_value(*s)) {
                    self.output_states[out_idx].value = value.clone();
                }
            }
        }

        if let Some(node) = tree.node_mut(node_id) {
            node.sub_tree = Some(sub);
            node.execution_failed = None;
        }
        true
    }

    /// Overwrite an output slot from outside the normal execute path,
    /// dirtying downstream when the value changed. Used to feed `group_in`
    /// stubs.
    fn inject_output(&mut self, tree: &NodeTree, socket: SocketId, value: TypedValue) {
        let Some(&(_, idx)) = self.index_cache.get(&socket) else { return };
        let changed = !self.output_states[idx].value.equals(&value);
        self.output_states[idx].value = value;
        if changed {
            if let Some(node) = tree.socket(socket).map(|s| s.node) {
                self.mark_node_dirty(node);
                self.invalidate_cache_for_node(tree, node);
                self.propagate_dirty_downstream(tree, node);
            }
        }
    }

    /// Copy a node's output values into every downstream input slot.
    ///
    /// Copies, never moves, so the upstream slot stays valid for caching.
    /// Cache validity travels with the value; a type clash reports on the
    /// downstream node and forwards nothing.
    fn forward_output_to_input(&mut self, tree: &mut NodeTree, node_id: NodeId) {
        let output_ids = match tree.node(node_id) {
            Some(node) => node.outputs.clone(),
            None => return,
        };
        for output in output_ids {
            let Some(&(_, out_idx)) = self.index_cache.get(&output) else { continue };
            let peers = tree
                .socket(output)
                .map(|s| s.directly_linked_sockets.clone())
                .unwrap_or_default();
            if peers.is_empty() {
                self.output_states[out_idx].is_last_used = true;
                continue;
            }

            let mut last_used: Option<usize> = None;
            let mut keep_alive = false;
            for peer in &peers {
                let Some(peer_sock) = tree.socket(*peer) else { continue };
                let peer_node = peer_sock.node;
                if tree
                    .node(peer_node)
                    .is_some_and(|n| n.typeinfo.id_name == builtin::STORAGE_IN)
                {
                    keep_alive = true;
                }
                let Some(&(_, in_idx)) = self.index_cache.get(peer) else { continue };
                if tree.node(peer_node).is_some_and(|n| n.required) {
                    last_used = Some(last_used.map_or(in_idx, |v| v.max(in_idx)));
                }

                match self.output_states[out_idx].value.ty().cloned() {
                    // A typeless value forwards as presence only.
                    None => {
                        self.input_states[in_idx].is_forwarded = true;
                    }
                    Some(from_ty) => {
                        let slot_ty = self.input_states[in_idx].value.ty().cloned();
                        if slot_ty.is_some() && slot_ty != Some(from_ty) {
                            if let Some(node) = tree.node_mut(peer_node) {
                                node.execution_failed =
                                    Some("Type mismatch input".to_string());
                            }
                            self.input_states[in_idx].is_forwarded = false;
                        } else {
                            if let Some(node) = tree.node_mut(peer_node) {
                                node.execution_failed = None;
                            }
                            let value = self.output_states[out_idx].value.clone();
                            self.input_states[in_idx].value = value;
                            self.input_states[in_idx].is_forwarded = true;
                            if self.output_states[out_idx].is_cached {
                                self.input_states[in_idx].is_cached = true;
                            }
                        }
                    }
                }
            }

            // Values feeding a storage sink must outlive their last reader.
            if keep_alive {
                for peer in &peers {
                    if let Some(&(_, in_idx)) = self.index_cache.get(peer) {
                        self.input_states[in_idx].keep_alive = true;
                    }
                }
            }
            match last_used {
                None => self.output_states[out_idx].is_last_used = true,
                Some(idx) => self.input_states[idx].is_last_used = true,
            }
        }

        // A feedback sink hands its captured state to its paired source.
        let (kind, paired) = match tree.node(node_id) {
            Some(node) => (node.typeinfo.id_name.clone(), node.paired_node),
            None => return,
        };
        if kind == builtin::SIMULATION_OUT {
            if let Some(peer) = paired {
                let state = tree
                    .node_mut(node_id)
                    .map(|n| n.storage.take())
                    .unwrap_or_default();
                if let Some(peer_node) = tree.node_mut(peer) {
                    peer_node.storage = state;
                }
            }
        }
    }

    fn all_slots_cached(&self, tree: &NodeTree, node_id: NodeId) -> bool {
        let Some(node) = tree.node(node_id) else { return false };
        let mut total_inputs = 0;
        let mut cached_inputs = 0;
        for socket in &node.inputs {
            if let Some(&(_, idx)) = self.index_cache.get(socket) {
                total_inputs += 1;
                if self.input_states[idx].is_cached {
                    cached_inputs += 1;
                }
            }
        }
        let mut total_outputs = 0;
        let mut cached_outputs = 0;
        for socket in &node.outputs {
            if let Some(&(_, idx)) = self.index_cache.get(socket) {
                total_outputs += 1;
                if self.output_states[idx].is_cached {
                    cached_outputs += 1;
                }
            }
        }
        cached_inputs == total_inputs
            && cached_outputs == total_outputs
            && total_inputs > 0
            && total_outputs > 0
    }

    // === Public lifecycle ===============================================

    /// Compile the required set and prepare value slots.
    pub fn prepare_tree(&mut self, tree: &mut NodeTree, required: Option<NodeId>) {
        tree.ensure_topology_cache();
        self.clear_transient();
        self.compile(tree, required);
        self.prepare_memory(tree);
        self.refresh_storage(tree);
    }

    /// Run the required nodes of a prepared tree.
    ///
    /// A cyclic tree is a no-op (the compile pass produced an empty
    /// required set).
    pub fn execute_tree(&mut self, tree: &mut NodeTree) {
        for i in 0..self.nodes_to_execute_count {
            let node_id = self.nodes_to_execute[i];
            if tree.node(node_id).is_none() {
                continue;
            }
            let always_dirty = tree
                .node(node_id)
                .is_some_and(|n| n.typeinfo.always_dirty);

            if !always_dirty
                && !self.is_node_dirty(node_id)
                && self.all_slots_cached(tree, node_id)
            {
                // Clean and fully cached: only re-forward the cached
                // outputs.
                self.forward_output_to_input(tree, node_id);
                continue;
            }

            if self.execute_node(tree, node_id) {
                self.forward_output_to_input(tree, node_id);

                if always_dirty {
                    // Downstream must re-run next pass through the sort.
                    for downstream in tree.downstream_nodes(node_id) {
                        self.mark_node_dirty(downstream);
                        self.invalidate_cache_for_node(tree, downstream);
                    }
                } else {
                    self.mark_node_clean(node_id);
                }

                let (input_ids, output_ids) = {
                    let node = tree.node(node_id).expect("checked above");
                    (node.inputs.clone(), node.outputs.clone())
                };
                for socket in input_ids {
                    if let Some(&(_, idx)) = self.index_cache.get(&socket) {
                        self.input_states[idx].is_cached = true;
                    }
                }
                for socket in output_ids {
                    if let Some(&(_, idx)) = self.index_cache.get(&socket) {
                        self.output_states[idx].is_cached = true;
                    }
                }
            }
        }

        self.try_storage(tree);

        // Every slot goes back to the persistent cache by socket identity;
        // copies, so slot values stay readable afterwards.
        for (socket, (direction, idx)) in &self.index_cache {
            match direction {
                PinDirection::Input => {
                    if *idx < self.input_states.len() {
                        self.persistent_input_cache
                            .insert(*socket, self.input_states[*idx].clone());
                    }
                }
                PinDirection::Output => {
                    if *idx < self.output_states.len() {
                        self.persistent_output_cache
                            .insert(*socket, self.output_states[*idx].clone());
                    }
                }
            }
        }

        self.dirty_nodes.clear();
    }

    /// `prepare_tree` + `execute_tree`.
    pub fn execute(&mut self, tree: &mut NodeTree, required: Option<NodeId>) {
        self.prepare_tree(tree, required);
        self.execute_tree(tree);
    }

    fn find_value(&self, socket: SocketId) -> Option<&TypedValue> {
        if let Some(&(direction, idx)) = self.index_cache.get(&socket) {
            return Some(match direction {
                PinDirection::Input => &self.input_states[idx].value,
                PinDirection::Output => &self.output_states[idx].value,
            });
        }
        if let Some(state) = self.persistent_input_cache.get(&socket) {
            return Some(&state.value);
        }
        if let Some(state) = self.persistent_output_cache.get(&socket) {
            return Some(&state.value);
        }
        None
    }

    /// Peek at the current slot value of a socket.
    pub fn get_socket_value(&self, socket: SocketId) -> Option<&TypedValue> {
        self.find_value(socket)
    }

    /// Read a slot value out.
    pub fn sync_node_to_external_storage(&self, socket: SocketId) -> Option<TypedValue> {
        self.find_value(socket).cloned()
    }

    /// Write an input slot from outside.
    ///
    /// When the value differs from the current slot, the node and its
    /// transitive downstream are marked dirty. Input defaults are kept in
    /// step so re-entry behaves consistently.
    pub fn sync_node_from_external_storage(
        &mut self,
        tree: &mut NodeTree,
        socket: SocketId,
        value: TypedValue,
    ) {
        let Some(&(direction, idx)) = self.index_cache.get(&socket) else {
            return;
        };
        let changed = {
            let slot = match direction {
                PinDirection::Input => &self.input_states[idx].value,
                PinDirection::Output => &self.output_states[idx].value,
            };
            slot.is_empty() || slot.ty() != value.ty() || !slot.equals(&value)
        };
        match direction {
            PinDirection::Input => self.input_states[idx].value = value.clone(),
            PinDirection::Output => self.output_states[idx].value = value.clone(),
        }

        if direction == PinDirection::Input {
            let node_id = match tree.socket_mut(socket) {
                Some(s) => {
                    // Keep the default in step with the written value, so
                    // the slot resolves the same way after a recompile.
                    if s.ty.is_some() {
                        s.data_field.value = Some(value);
                    }
                    s.node
                }
                None => return,
            };
            self.input_states[idx].is_forwarded = true;
            self.input_states[idx].is_cached = false;

            if changed {
                self.mark_node_dirty(node_id);
                self.invalidate_cache_for_node(tree, node_id);
                self.propagate_dirty_downstream(tree, node_id);
            }
        }
    }

    /// Mark a node dirty.
    pub fn notify_node_dirty(&mut self, node: NodeId) {
        self.mark_node_dirty(node);
    }

    /// Mark a socket's node dirty, invalidate its slots, and propagate
    /// dirtiness downstream. The editor hook for value edits.
    pub fn notify_socket_dirty(&mut self, tree: &NodeTree, socket: SocketId) {
        let Some(node) = tree.socket(socket).map(|s| s.node) else {
            return;
        };
        self.mark_node_dirty(node);
        self.invalidate_cache_for_node(tree, node);
        self.propagate_dirty_downstream(tree, node);
    }

    /// Coarse reset after structural edits: slot indices and validity flags
    /// go, persistent values for surviving socket identities stay.
    pub fn mark_tree_structure_changed(&mut self) {
        self.index_cache.clear();
        for state in &mut self.input_states {
            state.is_cached = false;
        }
        for state in &mut self.output_states {
            state.is_cached = false;
        }
        for state in self.persistent_input_cache.values_mut() {
            state.is_cached = false;
        }
        for state in self.persistent_output_cache.values_mut() {
            state.is_cached = false;
        }
        self.node_dirty_cache.clear();
        self.dirty_nodes.clear();
    }

    /// Install the run-wide global payload.
    pub fn set_global_payload(&mut self, payload: TypedValue) {
        self.global_payload = Arc::new(payload);
    }

    /// Named storage contents, for inspection.
    pub fn storage_names(&self) -> Vec<String> {
        self.storage.keys().cloned().collect()
    }

    /// Look up a named storage value.
    pub fn storage_value(&self, name: &str) -> Option<&TypedValue> {
        self.storage.get(name)
    }

    /// Drop run state: named storage, payload, caches, dirty tracking.
    pub fn finalize(&mut self, _tree: &mut NodeTree) {
        self.storage.clear();
        self.global_payload = Arc::default();
        self.persistent_input_cache.clear();
        self.persistent_output_cache.clear();
        self.index_cache.clear();
        self.input_states.clear();
        self.output_states.clear();
        self.dirty_nodes.clear();
        self.node_dirty_cache.clear();
        self.sub_executors.clear();
    }
}

impl TreeExecutor for EagerExecutor {
    fn prepare_tree(&mut self, tree: &mut NodeTree, required: Option<NodeId>) {
        EagerExecutor::prepare_tree(self, tree, required);
    }

    fn execute_tree(&mut self, tree: &mut NodeTree) {
        EagerExecutor::execute_tree(self, tree);
    }

    fn sync_node_from_external_storage(
        &mut self,
        tree: &mut NodeTree,
        socket: SocketId,
        value: TypedValue,
    ) {
        EagerExecutor::sync_node_from_external_storage(self, tree, socket, value);
    }

    fn sync_node_to_external_storage(&self, socket: SocketId) -> Option<TypedValue> {
        EagerExecutor::sync_node_to_external_storage(self, socket)
    }

    fn get_socket_value(&self, socket: SocketId) -> Option<&TypedValue> {
        EagerExecutor::get_socket_value(self, socket)
    }

    fn notify_node_dirty(&mut self, node: NodeId) {
        EagerExecutor::notify_node_dirty(self, node);
    }

    fn notify_socket_dirty(&mut self, tree: &NodeTree, socket: SocketId) {
        EagerExecutor::notify_socket_dirty(self, tree, socket);
    }

    fn mark_tree_structure_changed(&mut self) {
        EagerExecutor::mark_tree_structure_changed(self);
    }

    fn set_global_payload(&mut self, payload: TypedValue) {
        EagerExecutor::set_global_payload(self, payload);
    }

    fn finalize(&mut self, tree: &mut NodeTree) {
        EagerExecutor::finalize(self, tree);
    }

    fn clone_empty(&self) -> Box<dyn TreeExecutor> {
        Box::new(EagerExecutor::new())
    }
}
