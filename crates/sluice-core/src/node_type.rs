//! Node-kind descriptors and socket declarations.
//!
//! Every node in a graph is an instance of a [`NodeTypeInfo`]: an immutable
//! record carrying the kind's identity, its socket declarations (produced by
//! a declare callback against a [`NodeDeclarationBuilder`]), its execute
//! callback, and scheduling flags. Kinds are collected in a
//! [`NodeTreeDescriptor`], which also holds the conversion registry used to
//! bridge mismatched socket types and the companion requirements that make
//! certain kinds spawn in synchronized pairs.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::params::ExecParams;
use crate::value::{SocketType, TypeRegistry, TypedValue};

/// Which side of a node a socket sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PinDirection {
    /// The socket consumes a value.
    Input,
    /// The socket produces a value.
    Output,
}

impl PinDirection {
    /// The opposite direction.
    pub fn flipped(self) -> Self {
        match self {
            PinDirection::Input => PinDirection::Output,
            PinDirection::Output => PinDirection::Input,
        }
    }
}

/// Declaration of a single socket on a node kind.
#[derive(Debug, Clone)]
pub struct SocketDeclaration {
    /// Stable key used to address the socket.
    pub identifier: String,
    /// Display name; defaults to the identifier.
    pub ui_name: String,
    /// Input or output.
    pub direction: PinDirection,
    /// Value type; `None` declares a polymorphic socket.
    pub ty: Option<SocketType>,
    /// Default used when the socket is left unwired.
    pub default_value: Option<TypedValue>,
    /// Editor hint, lower bound.
    pub min: Option<TypedValue>,
    /// Editor hint, upper bound.
    pub max: Option<TypedValue>,
    /// Optional inputs may stay unwired without blocking execution.
    pub optional: bool,
    /// Socket-group membership.
    pub group: Option<String>,
}

/// Declaration of a socket group on a node kind.
#[derive(Debug, Clone)]
pub struct SocketGroupDeclaration {
    /// Group identifier shared by all member sockets.
    pub identifier: String,
    /// Direction of the member sockets.
    pub direction: PinDirection,
    /// Type for member sockets; `None` lets each added socket pick its own.
    pub ty: Option<SocketType>,
    /// Whether sockets can be added and removed at runtime.
    pub runtime_dynamic: bool,
}

/// The full socket layout of a node kind.
#[derive(Debug, Clone, Default)]
pub struct NodeDeclaration {
    /// Ordered input declarations.
    pub inputs: Vec<SocketDeclaration>,
    /// Ordered output declarations.
    pub outputs: Vec<SocketDeclaration>,
    /// Socket-group declarations.
    pub groups: Vec<SocketGroupDeclaration>,
}

/// Builder handed to a kind's declare callback.
pub struct NodeDeclarationBuilder<'a> {
    registry: &'a TypeRegistry,
    decl: NodeDeclaration,
}

impl<'a> NodeDeclarationBuilder<'a> {
    /// Start a declaration against the given type registry.
    pub fn new(registry: &'a TypeRegistry) -> Self {
        Self {
            registry,
            decl: NodeDeclaration::default(),
        }
    }

    fn push(&mut self, direction: PinDirection, identifier: &str, ty: Option<SocketType>) -> SocketBuilder<'_> {
        let decl = SocketDeclaration {
            identifier: identifier.to_string(),
            ui_name: identifier.to_string(),
            direction,
            ty,
            default_value: None,
            min: None,
            max: None,
            optional: false,
            group: None,
        };
        let list = match direction {
            PinDirection::Input => &mut self.decl.inputs,
            PinDirection::Output => &mut self.decl.outputs,
        };
        list.push(decl);
        SocketBuilder {
            decl: list.last_mut().expect("just pushed"),
        }
    }

    /// Declare a typed input. `T` must be registered.
    pub fn add_input<T: 'static>(&mut self, identifier: &str) -> SocketBuilder<'_> {
        let ty = self
            .registry
            .resolve::<T>()
            .unwrap_or_else(|| panic!("socket type {} is not registered", std::any::type_name::<T>()));
        self.push(PinDirection::Input, identifier, Some(ty))
    }

    /// Declare a typed output. `T` must be registered.
    pub fn add_output<T: 'static>(&mut self, identifier: &str) -> SocketBuilder<'_> {
        let ty = self
            .registry
            .resolve::<T>()
            .unwrap_or_else(|| panic!("socket type {} is not registered", std::any::type_name::<T>()));
        self.push(PinDirection::Output, identifier, Some(ty))
    }

    /// Declare a polymorphic input that accepts any registered type.
    pub fn add_input_any(&mut self, identifier: &str) -> SocketBuilder<'_> {
        self.push(PinDirection::Input, identifier, None)
    }

    /// Declare a polymorphic output.
    pub fn add_output_any(&mut self, identifier: &str) -> SocketBuilder<'_> {
        self.push(PinDirection::Output, identifier, None)
    }

    /// Declare a socket group.
    pub fn add_group(&mut self, identifier: &str, direction: PinDirection) -> GroupBuilder<'_> {
        self.decl.groups.push(SocketGroupDeclaration {
            identifier: identifier.to_string(),
            direction,
            ty: None,
            runtime_dynamic: true,
        });
        GroupBuilder {
            registry: self.registry,
            decl: self.decl.groups.last_mut().expect("just pushed"),
        }
    }

    /// Finish and hand back the declaration.
    pub fn finish(self) -> NodeDeclaration {
        self.decl
    }
}

/// Chained configuration of a freshly declared socket.
pub struct SocketBuilder<'a> {
    decl: &'a mut SocketDeclaration,
}

impl SocketBuilder<'_> {
    fn wrap<T: Send + Sync + 'static>(&self, value: T) -> TypedValue {
        let ty = self
            .decl
            .ty
            .as_ref()
            .unwrap_or_else(|| panic!("socket {} is polymorphic, it cannot carry a value", self.decl.identifier));
        TypedValue::with(ty, value)
            .unwrap_or_else(|e| panic!("socket {}: {}", self.decl.identifier, e))
    }

    /// Default value used when the input is left unwired.
    pub fn default_value<T: Send + Sync + 'static>(self, value: T) -> Self {
        self.decl.default_value = Some(self.wrap(value));
        self
    }

    /// Editor lower bound.
    pub fn min<T: Send + Sync + 'static>(self, value: T) -> Self {
        self.decl.min = Some(self.wrap(value));
        self
    }

    /// Editor upper bound.
    pub fn max<T: Send + Sync + 'static>(self, value: T) -> Self {
        self.decl.max = Some(self.wrap(value));
        self
    }

    /// Mark the input optional.
    pub fn optional(self, optional: bool) -> Self {
        self.decl.optional = optional;
        self
    }

    /// Override the display name.
    pub fn ui_name(self, name: &str) -> Self {
        self.decl.ui_name = name.to_string();
        self
    }
}

/// Chained configuration of a freshly declared socket group.
pub struct GroupBuilder<'a> {
    registry: &'a TypeRegistry,
    decl: &'a mut SocketGroupDeclaration,
}

impl GroupBuilder<'_> {
    /// Constrain member sockets to a single registered type.
    pub fn typed<T: 'static>(self) -> Self {
        let ty = self
            .registry
            .resolve::<T>()
            .unwrap_or_else(|| panic!("group type {} is not registered", std::any::type_name::<T>()));
        self.decl.ty = Some(ty);
        self
    }

    /// Allow or forbid runtime socket addition and removal.
    pub fn runtime_dynamic(self, dynamic: bool) -> Self {
        self.decl.runtime_dynamic = dynamic;
        self
    }
}

type DeclareFn = Box<dyn Fn(&mut NodeDeclarationBuilder) + Send + Sync>;
type ExecuteFn = Box<dyn Fn(&mut ExecParams) -> bool + Send + Sync>;

/// Immutable metadata for one node kind.
pub struct NodeTypeInfo {
    /// Unique registration key.
    pub id_name: String,
    /// Display name.
    pub ui_name: String,
    /// Editor hint.
    pub color: [f32; 4],
    /// Keep this kind in the required set of every run.
    pub always_required: bool,
    /// Treat this kind as dirty every run, forcing downstream re-execution.
    pub always_dirty: bool,
    /// Hide from editors; used for auto-inserted conversion nodes.
    pub invisible: bool,
    declare_fn: Option<DeclareFn>,
    execute_fn: Option<ExecuteFn>,
}

impl NodeTypeInfo {
    /// Create a kind with the given id, which doubles as the display name
    /// until overridden.
    pub fn new(id_name: &str) -> Self {
        Self {
            id_name: id_name.to_string(),
            ui_name: id_name.to_string(),
            color: [0.3, 0.3, 0.3, 1.0],
            always_required: false,
            always_dirty: false,
            invisible: false,
            declare_fn: None,
            execute_fn: None,
        }
    }

    /// Install the declare callback.
    pub fn set_declare_function(
        &mut self,
        f: impl Fn(&mut NodeDeclarationBuilder) + Send + Sync + 'static,
    ) {
        self.declare_fn = Some(Box::new(f));
    }

    /// Install the execute callback.
    pub fn set_execution_function(
        &mut self,
        f: impl Fn(&mut ExecParams) -> bool + Send + Sync + 'static,
    ) {
        self.execute_fn = Some(Box::new(f));
    }

    /// Run the declare callback and collect the socket layout.
    pub fn declare(&self, registry: &TypeRegistry) -> NodeDeclaration {
        let mut builder = NodeDeclarationBuilder::new(registry);
        if let Some(f) = &self.declare_fn {
            f(&mut builder);
        }
        builder.finish()
    }

    /// Run the execute callback. Kinds without one succeed trivially.
    pub fn execute(&self, params: &mut ExecParams) -> bool {
        match &self.execute_fn {
            Some(f) => f(params),
            None => true,
        }
    }
}

impl fmt::Debug for NodeTypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeTypeInfo")
            .field("id_name", &self.id_name)
            .field("always_required", &self.always_required)
            .field("always_dirty", &self.always_dirty)
            .field("invisible", &self.invisible)
            .finish()
    }
}

/// One participant of a companion requirement.
#[derive(Debug, Clone)]
pub struct GroupSyncMember {
    /// The node kind.
    pub node_kind: String,
    /// Socket group on that kind to keep in sync; empty for pairing only.
    pub group: String,
    /// Direction of the synced group.
    pub direction: PinDirection,
}

/// A set of kinds that are instantiated together and paired.
///
/// Adding a node of any member kind spawns the remaining members, pairs the
/// nodes, and joins the named groups into a synchronization set.
#[derive(Debug, Clone)]
pub struct GroupSyncRequirement {
    /// The participating kinds.
    pub members: Vec<GroupSyncMember>,
}

/// Well-known kind ids the engine treats specially.
pub mod builtin {
    /// Sink that captures a wired value into named storage.
    pub const STORAGE_IN: &str = "func_storage_in";
    /// Source that publishes a named storage value.
    pub const STORAGE_OUT: &str = "func_storage_out";
    /// Feedback source, paired with [`SIMULATION_OUT`].
    pub const SIMULATION_IN: &str = "simulation_in";
    /// Feedback sink; its captured state moves to the paired source.
    pub const SIMULATION_OUT: &str = "simulation_out";
    /// A node whose interior is a nested tree.
    pub const NODE_GROUP: &str = "node_group";
    /// Interior placeholder mirroring the group's inputs.
    pub const GROUP_IN: &str = "group_in";
    /// Interior placeholder mirroring the group's outputs.
    pub const GROUP_OUT: &str = "group_out";
}

/// Registry of node kinds for one family of trees.
///
/// Also owns the shared type registry handle, the conversion table used by
/// link creation, and the companion requirements consulted by node creation.
pub struct NodeTreeDescriptor {
    registry: Arc<TypeRegistry>,
    node_types: HashMap<String, Arc<NodeTypeInfo>>,
    conversions: HashMap<(TypeId, TypeId), String>,
    requirements: Vec<GroupSyncRequirement>,
}

impl NodeTreeDescriptor {
    /// Create a descriptor over the given type registry, pre-loaded with the
    /// storage, simulation, and group built-ins.
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        let mut descriptor = Self {
            registry,
            node_types: HashMap::new(),
            conversions: HashMap::new(),
            requirements: Vec::new(),
        };
        descriptor.register_builtins();
        descriptor
    }

    fn register_builtins(&mut self) {
        let mut storage_in = NodeTypeInfo::new(builtin::STORAGE_IN);
        storage_in.ui_name = "Storage In".to_string();
        storage_in.always_required = true;
        storage_in.set_declare_function(|b| {
            b.add_input::<String>("name").default_value(String::new());
            b.add_input_any("data").optional(true);
        });
        storage_in.set_execution_function(|_| true);
        self.register_node(storage_in);

        let mut storage_out = NodeTypeInfo::new(builtin::STORAGE_OUT);
        storage_out.ui_name = "Storage Out".to_string();
        storage_out.set_declare_function(|b| {
            b.add_input::<String>("name").default_value(String::new());
            b.add_output_any("data");
        });
        storage_out.set_execution_function(|_| true);
        self.register_node(storage_out);

        let mut simulation_in = NodeTypeInfo::new(builtin::SIMULATION_IN);
        simulation_in.ui_name = "Simulation In".to_string();
        simulation_in.set_declare_function(|b| {
            b.add_output_any("state");
        });
        simulation_in.set_execution_function(|params| {
            let state = params.storage().clone();
            params.set_output_any("state", state);
            true
        });
        self.register_node(simulation_in);

        let mut simulation_out = NodeTypeInfo::new(builtin::SIMULATION_OUT);
        simulation_out.ui_name = "Simulation Out".to_string();
        simulation_out.always_required = true;
        simulation_out.set_declare_function(|b| {
            b.add_input_any("state");
            b.add_output_any("state");
        });
        simulation_out.set_execution_function(|params| {
            let Some(state) = params.input_any("state").cloned() else {
                return false;
            };
            params.set_storage(state.clone());
            params.set_output_any("state", state);
            true
        });
        self.register_node(simulation_out);

        self.add_requirement(GroupSyncRequirement {
            members: vec![
                GroupSyncMember {
                    node_kind: builtin::SIMULATION_IN.to_string(),
                    group: String::new(),
                    direction: PinDirection::Output,
                },
                GroupSyncMember {
                    node_kind: builtin::SIMULATION_OUT.to_string(),
                    group: String::new(),
                    direction: PinDirection::Input,
                },
            ],
        });

        // Group scaffolding kinds declare no sockets; their pins are built
        // structurally by group_up.
        let node_group = NodeTypeInfo::new(builtin::NODE_GROUP);
        self.register_node(node_group);

        let group_in = NodeTypeInfo::new(builtin::GROUP_IN);
        self.register_node(group_in);

        let mut group_out = NodeTypeInfo::new(builtin::GROUP_OUT);
        group_out.always_required = true;
        self.register_node(group_out);
    }

    /// The shared type registry.
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Register a node kind, replacing any previous kind with the same id.
    pub fn register_node(&mut self, info: NodeTypeInfo) -> Arc<NodeTypeInfo> {
        let info = Arc::new(info);
        self.node_types.insert(info.id_name.clone(), info.clone());
        info
    }

    /// Look up a kind by id.
    pub fn node_type(&self, id_name: &str) -> Option<Arc<NodeTypeInfo>> {
        self.node_types.get(id_name).cloned()
    }

    /// All registered kind ids.
    pub fn registered_kinds(&self) -> impl Iterator<Item = &str> {
        self.node_types.keys().map(String::as_str)
    }

    /// Register a conversion used to auto-bridge a link from `F` to `T`.
    ///
    /// The conversion becomes an invisible node kind inserted by
    /// link creation whenever a `F`-typed output is wired to a `T`-typed
    /// input.
    pub fn register_conversion<F, T>(&mut self, convert: impl Fn(&F) -> T + Send + Sync + 'static)
    where
        F: Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        let from = self
            .registry
            .resolve::<F>()
            .unwrap_or_else(|| panic!("conversion source {} is not registered", std::any::type_name::<F>()));
        let to = self
            .registry
            .resolve::<T>()
            .unwrap_or_else(|| panic!("conversion target {} is not registered", std::any::type_name::<T>()));

        let id_name = format!("conv_{}_to_{}", from.name(), to.name());
        let mut info = NodeTypeInfo::new(&id_name);
        info.invisible = true;
        let (from_c, to_c) = (from.clone(), to.clone());
        info.set_declare_function(move |b| {
            b.push_raw(PinDirection::Input, "value", Some(from_c.clone()));
            b.push_raw(PinDirection::Output, "value", Some(to_c.clone()));
        });
        info.set_execution_function(move |params| {
            let Some(v) = params.get_input::<F>("value") else {
                return false;
            };
            let out = convert(v);
            params.set_output("value", out)
        });
        self.register_node(info);
        self.conversions
            .insert((from.type_id(), to.type_id()), id_name);
    }

    /// The conversion kind bridging `from` to `to`, if one is registered.
    pub fn conversion_kind(&self, from: &SocketType, to: &SocketType) -> Option<Arc<NodeTypeInfo>> {
        self.conversions
            .get(&(from.type_id(), to.type_id()))
            .and_then(|id| self.node_type(id))
    }

    /// Declare a companion requirement.
    pub fn add_requirement(&mut self, requirement: GroupSyncRequirement) {
        self.requirements.push(requirement);
    }

    /// The requirement a kind participates in, if any.
    pub fn requirement_for(&self, kind: &str) -> Option<&GroupSyncRequirement> {
        self.requirements
            .iter()
            .find(|r| r.members.iter().any(|m| m.node_kind == kind))
    }
}

impl NodeDeclarationBuilder<'_> {
    /// Declare a socket from an already-resolved type handle.
    pub fn push_raw(
        &mut self,
        direction: PinDirection,
        identifier: &str,
        ty: Option<SocketType>,
    ) -> SocketBuilder<'_> {
        self.push(direction, identifier, ty)
    }
}
