//! JSON round-trip of node trees.
//!
//! The serial form records nodes (keyed by string node id, with their
//! sockets keyed by identifier), logical links, socket-group
//! synchronization sets, and the opaque ui blobs. Invisible conversion
//! nodes are not serialized; a conversion chain collapses to its logical
//! endpoints and is re-inserted by link creation on load. Group placeholder
//! slots are likewise regenerated from the kind's declaration.
//!
//! Deserializing a blob with an unknown node kind or socket type fails with
//! a descriptive error and leaves the tree empty. Re-serializing a
//! just-deserialized tree is value-equal modulo id reassignment.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use sluice_core::glam::{Vec2, Vec3, Vec4};
use sluice_core::{PinDirection, SocketType, TypedValue};
use tracing::warn;

use crate::error::GraphError;
use crate::ids::{NodeId, SocketId};
use crate::node::Node;
use crate::socket::{DataField, GroupRef, NodeSocket, SocketGroup};
use crate::tree::{AddLinkOptions, NodeTree};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SerialSocket {
    #[serde(rename = "ID")]
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub type_name: Option<String>,
    pub ui_name: String,
    pub direction: PinDirection,
    #[serde(default)]
    pub optional: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub socket_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SerialGroupRef {
    pub node_id: u64,
    pub direction: PinDirection,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SerialSocketGroup {
    pub synchronized_groups: Vec<SerialGroupRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SerialNode {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub inputs: IndexMap<String, SerialSocket>,
    #[serde(default)]
    pub outputs: IndexMap<String, SerialSocket>,
    #[serde(skip_serializing_if = "IndexMap::is_empty", default)]
    pub socket_groups: IndexMap<String, SerialSocketGroup>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub ui: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sub_tree: Option<Box<SerialTree>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SerialLink {
    #[serde(rename = "ID")]
    pub id: u64,
    pub from_socket_id: u64,
    pub to_socket_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SerialTree {
    pub nodes: IndexMap<String, SerialNode>,
    pub links: Vec<SerialLink>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub ui_settings: String,
}

/// Encode a default value per its socket type.
///
/// Scalars and strings encode as themselves, vectors as float arrays.
/// Unregistered encodings are dropped with a warning rather than failing
/// the whole document.
fn encode_value(value: &TypedValue) -> Option<JsonValue> {
    if let Some(v) = value.downcast_ref::<i32>() {
        return Some(json!(v));
    }
    if let Some(v) = value.downcast_ref::<i64>() {
        return Some(json!(v));
    }
    if let Some(v) = value.downcast_ref::<f32>() {
        return Some(json!(v));
    }
    if let Some(v) = value.downcast_ref::<f64>() {
        return Some(json!(v));
    }
    if let Some(v) = value.downcast_ref::<bool>() {
        return Some(json!(v));
    }
    if let Some(v) = value.downcast_ref::<String>() {
        return Some(json!(v));
    }
    if let Some(v) = value.downcast_ref::<Vec2>() {
        return Some(json!([v.x, v.y]));
    }
    if let Some(v) = value.downcast_ref::<Vec3>() {
        return Some(json!([v.x, v.y, v.z]));
    }
    if let Some(v) = value.downcast_ref::<Vec4>() {
        return Some(json!([v.x, v.y, v.z, v.w]));
    }
    if let Some(ty) = value.ty() {
        warn!(ty = %ty.name(), "no value encoding for socket type, dropping default");
    }
    None
}

fn array_f32(json: &JsonValue, n: usize) -> Result<Vec<f32>, GraphError> {
    let arr = json
        .as_array()
        .filter(|a| a.len() == n)
        .ok_or_else(|| GraphError::Serialization(format!("expected array of {n} floats")))?;
    arr.iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| GraphError::Serialization("expected float".to_string()))
        })
        .collect()
}

/// Decode a default value against its socket type.
fn decode_value(ty: &SocketType, json: &JsonValue) -> Result<TypedValue, GraphError> {
    let bad = || GraphError::Serialization(format!("bad value for type {}", ty.name()));
    let value = if ty.is::<i32>() {
        TypedValue::with(ty, json.as_i64().ok_or_else(bad)? as i32)
    } else if ty.is::<i64>() {
        TypedValue::with(ty, json.as_i64().ok_or_else(bad)?)
    } else if ty.is::<f32>() {
        TypedValue::with(ty, json.as_f64().ok_or_else(bad)? as f32)
    } else if ty.is::<f64>() {
        TypedValue::with(ty, json.as_f64().ok_or_else(bad)?)
    } else if ty.is::<bool>() {
        TypedValue::with(ty, json.as_bool().ok_or_else(bad)?)
    } else if ty.is::<String>() {
        TypedValue::with(ty, json.as_str().ok_or_else(bad)?.to_string())
    } else if ty.is::<Vec2>() {
        let v = array_f32(json, 2)?;
        TypedValue::with(ty, Vec2::new(v[0], v[1]))
    } else if ty.is::<Vec3>() {
        let v = array_f32(json, 3)?;
        TypedValue::with(ty, Vec3::new(v[0], v[1], v[2]))
    } else if ty.is::<Vec4>() {
        let v = array_f32(json, 4)?;
        TypedValue::with(ty, Vec4::new(v[0], v[1], v[2], v[3]))
    } else {
        return Err(GraphError::Serialization(format!(
            "no value decoding for socket type {}",
            ty.name()
        )));
    };
    value.map_err(|e| GraphError::Serialization(e.to_string()))
}

impl NodeTree {
    /// Serialize to a JSON document.
    pub fn serialize(&self) -> Result<String, GraphError> {
        Ok(serde_json::to_string_pretty(&self.to_serial())?)
    }

    pub(crate) fn to_serial(&self) -> SerialTree {
        let mut nodes = IndexMap::new();
        for node in self.nodes.values() {
            if node.typeinfo.invisible {
                continue;
            }
            nodes.insert(node.id.to_string(), self.serial_node(node));
        }

        let mut links = Vec::new();
        for link in self.links.values() {
            if link.from_link.is_some() {
                continue;
            }
            // Emit the logical span of the chain; conversion hops are an
            // implementation detail of the loaded tree.
            let target = self.chain_target(link.id).unwrap_or(link.to_sock);
            links.push(SerialLink {
                id: link.id.raw(),
                from_socket_id: link.from_sock.raw(),
                to_socket_id: target.raw(),
            });
        }

        SerialTree {
            nodes,
            links,
            ui_settings: self.ui_settings.clone(),
        }
    }

    fn serial_node(&self, node: &Node) -> SerialNode {
        let mut inputs = IndexMap::new();
        let mut outputs = IndexMap::new();
        for (ids, map) in [(&node.inputs, &mut inputs), (&node.outputs, &mut outputs)] {
            for id in ids.iter() {
                let Some(socket) = self.sockets.get(id) else { continue };
                if socket.is_placeholder() {
                    continue;
                }
                let value = socket
                    .data_field
                    .value
                    .as_ref()
                    .and_then(encode_value);
                map.insert(
                    socket.identifier.clone(),
                    SerialSocket {
                        id: socket.id.raw(),
                        type_name: socket.ty.as_ref().map(|t| t.name().to_string()),
                        ui_name: socket.ui_name.clone(),
                        direction: socket.direction,
                        optional: socket.optional,
                        socket_group: socket.socket_group.clone(),
                        value,
                    },
                );
            }
        }

        let mut socket_groups = IndexMap::new();
        for group in &node.groups {
            if group.synchronized_groups.is_empty() {
                continue;
            }
            socket_groups.insert(
                group.identifier.clone(),
                SerialSocketGroup {
                    synchronized_groups: group
                        .synchronized_groups
                        .iter()
                        .map(|r| SerialGroupRef {
                            node_id: r.node.raw(),
                            direction: r.direction,
                            name: r.identifier.clone(),
                        })
                        .collect(),
                },
            );
        }

        SerialNode {
            type_name: node.typeinfo.id_name.clone(),
            inputs,
            outputs,
            socket_groups,
            ui: node.ui.clone(),
            sub_tree: node.sub_tree.as_ref().map(|t| Box::new(t.to_serial())),
        }
    }

    /// Replace this tree's contents with a deserialized document.
    ///
    /// On any failure the tree is left empty and the error describes the
    /// first offending entity.
    pub fn deserialize(&mut self, blob: &str) -> Result<(), GraphError> {
        let serial: SerialTree = serde_json::from_str(blob)?;
        self.clear();
        if let Err(e) = self.apply_serial(&serial) {
            self.clear();
            return Err(e);
        }
        self.ensure_topology_cache();
        Ok(())
    }

    pub(crate) fn apply_serial(&mut self, serial: &SerialTree) -> Result<(), GraphError> {
        let descriptor = self.descriptor.clone();
        let registry = descriptor.registry().clone();

        for (key, snode) in &serial.nodes {
            let raw: u64 = key
                .parse()
                .map_err(|_| GraphError::Serialization(format!("bad node id: {key}")))?;
            let node_id = NodeId::from_raw(raw);
            let typeinfo = descriptor
                .node_type(&snode.type_name)
                .ok_or_else(|| GraphError::UnknownKind(snode.type_name.clone()))?;
            let decl = typeinfo.declare(&registry);

            let mut node = Node::new(node_id, typeinfo);
            node.ui = snode.ui.clone();
            for g in &decl.groups {
                node.groups.push(SocketGroup {
                    identifier: g.identifier.clone(),
                    direction: g.direction,
                    node: node_id,
                    ty: g.ty.clone(),
                    runtime_dynamic: g.runtime_dynamic,
                    sockets: Vec::new(),
                    synchronized_groups: Vec::new(),
                });
            }
            if let Some(sub) = &snode.sub_tree {
                let mut sub_tree = NodeTree::new(descriptor.clone());
                sub_tree.apply_serial(sub)?;
                node.sub_tree = Some(sub_tree);
            }
            self.nodes.insert(node_id, node);
            self.next_id = self.next_id.max(raw + 1);

            for (identifier, ssocket) in snode.inputs.iter().chain(snode.outputs.iter()) {
                self.apply_serial_socket(node_id, identifier, ssocket, &registry)?;
            }

            // Dynamic groups get their placeholder slot back.
            for g in &decl.groups {
                if !g.runtime_dynamic {
                    continue;
                }
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

        // Synchronization sets join across nodes, so they wire up second.
        for (key, snode) in &serial.nodes {
            let node_id = NodeId::from_raw(key.parse::<u64>().expect("validated above"));
            for (group_id, sgroup) in &snode.socket_groups {
                let direction = self
                    .nodes
                    .get(&node_id)
                    .and_then(|n| n.groups.iter().find(|g| g.identifier == *group_id))
                    .map(|g| g.direction)
                    .ok_or_else(|| GraphError::GroupNotFound(group_id.clone()))?;
                for r in &sgroup.synchronized_groups {
                    self.add_sync_group(
                        (node_id, direction, group_id.as_str()),
                        (NodeId::from_raw(r.node_id), r.direction, r.name.as_str()),
                    )?;
                }
            }
        }

        for link in &serial.links {
            self.add_link_with(
                SocketId::from_raw(link.from_socket_id),
                SocketId::from_raw(link.to_socket_id),
                AddLinkOptions {
                    allow_relink_to_output: false,
                    refresh_topology: false,
                },
            )?;
        }

        self.ui_settings = serial.ui_settings.clone();
        self.mark_changed();
        Ok(())
    }

    fn apply_serial_socket(
        &mut self,
        node_id: NodeId,
        identifier: &str,
        ssocket: &SerialSocket,
        registry: &sluice_core::TypeRegistry,
    ) -> Result<(), GraphError> {
        let ty = match &ssocket.type_name {
            Some(name) => Some(
                registry
                    .resolve_by_name(name)
                    .ok_or_else(|| GraphError::UnknownType(name.clone()))?,
            ),
            None => None,
        };
        let value = match (&ssocket.value, &ty) {
            (Some(json), Some(ty)) => Some(decode_value(ty, json)?),
            _ => None,
        };
        let socket_id = SocketId::from_raw(ssocket.id);
        self.sockets.insert(
            socket_id,
            NodeSocket {
                id: socket_id,
                node: node_id,
                direction: ssocket.direction,
                ty,
                identifier: identifier.to_string(),
                ui_name: ssocket.ui_name.clone(),
                optional: ssocket.optional,
                socket_group: ssocket.socket_group.clone(),
                data_field: DataField {
                    value,
                    min: None,
                    max: None,
                },
                directly_linked_links: Vec::new(),
                directly_linked_sockets: Vec::new(),
            },
        );
        self.next_id = self.next_id.max(ssocket.id + 1);

        let node = self.nodes.get_mut(&node_id).expect("inserted by caller");
        match ssocket.direction {
            PinDirection::Input => node.inputs.push(socket_id),
            PinDirection::Output => node.outputs.push(socket_id),
        }
        if let Some(group_id) = &ssocket.socket_group {
            if let Some(group) = node
                .groups
                .iter_mut()
                .find(|g| g.identifier == *group_id && g.direction == ssocket.direction)
            {
                group.sockets.push(socket_id);
            }
        }
        Ok(())
    }

    /// Compare two trees for value equality, ignoring ids.
    ///
    /// Nodes are matched positionally (insertion order survives the round
    /// trip); sockets by identifier; links by the identifiers of their
    /// endpoints.
    pub fn value_equal(&self, other: &NodeTree) -> bool {
        fn group_key(tree: &NodeTree, r: &GroupRef) -> Option<(usize, String)> {
            tree.nodes
                .get_index_of(&r.node)
                .map(|pos| (pos, r.identifier.clone()))
        }

        fn visible(tree: &NodeTree) -> Vec<&Node> {
            tree.nodes.values().filter(|n| !n.typeinfo.invisible).collect()
        }
        let a_nodes = visible(self);
        let b_nodes = visible(other);
        if a_nodes.len() != b_nodes.len() {
            return false;
        }
        for (a, b) in a_nodes.iter().zip(b_nodes.iter()) {
            if a.typeinfo.id_name != b.typeinfo.id_name || a.ui != b.ui {
                return false;
            }
            for (sa, sb) in [(&a.inputs, &b.inputs), (&a.outputs, &b.outputs)] {
                let sa: Vec<_> = sa.iter().filter_map(|id| self.sockets.get(id)).collect();
                let sb: Vec<_> = sb.iter().filter_map(|id| other.sockets.get(id)).collect();
                if sa.len() != sb.len() {
                    return false;
                }
                for (x, y) in sa.iter().zip(sb.iter()) {
                    if x.identifier != y.identifier
                        || x.ty != y.ty
                        || x.optional != y.optional
                        || x.socket_group != y.socket_group
                        || x.data_field.value != y.data_field.value
                    {
                        return false;
                    }
                }
            }
            for (ga, gb) in a.groups.iter().zip(b.groups.iter()) {
                let ka: Vec<_> = ga
                    .synchronized_groups
                    .iter()
                    .filter_map(|r| group_key(self, r))
                    .collect();
                let kb: Vec<_> = gb
                    .synchronized_groups
                    .iter()
                    .filter_map(|r| group_key(other, r))
                    .collect();
                if ka != kb {
                    return false;
                }
            }
        }

        // Links compare as (node position, socket identifier) pairs.
        let link_keys = |tree: &NodeTree| -> Vec<((usize, String), (usize, String))> {
            let mut keys = Vec::new();
            for link in tree.links.values() {
                if link.from_link.is_some() {
                    continue;
                }
                let target = tree.chain_target(link.id).unwrap_or(link.to_sock);
                let from = &tree.sockets[&link.from_sock];
                let to = &tree.sockets[&target];
                let from_pos = tree.nodes.get_index_of(&from.node).unwrap_or(usize::MAX);
                let to_pos = tree.nodes.get_index_of(&to.node).unwrap_or(usize::MAX);
                keys.push((
                    (from_pos, from.identifier.clone()),
                    (to_pos, to.identifier.clone()),
                ));
            }
            keys.sort();
            keys
        };
        link_keys(self) == link_keys(other)
    }
}
