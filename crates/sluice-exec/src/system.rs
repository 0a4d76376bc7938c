//! The graph host: binds a tree to an executor.

use std::sync::Arc;

use sluice_core::{NodeTreeDescriptor, TypedValue};
use sluice_graph::{NodeId, NodeTree};

use crate::executor::{EagerExecutor, TreeExecutor};

/// Thin lifecycle wrapper owning one tree and one executor.
///
/// Front ends (editors, APIs, scripts) edit the tree through
/// [`NodeSystem::tree_mut`] and drive runs through [`NodeSystem::execute`].
/// Setting `allow_ui_execution` to false turns ui-initiated executions into
/// no-ops, which inhibits thrash while a slider is being dragged.
pub struct NodeSystem {
    descriptor: Arc<NodeTreeDescriptor>,
    tree: NodeTree,
    executor: Box<dyn TreeExecutor>,
    /// Gate for `execute(is_ui_execution = true, ..)` calls.
    pub allow_ui_execution: bool,
}

impl NodeSystem {
    /// Create a host with a fresh tree and the default eager executor.
    pub fn new(descriptor: Arc<NodeTreeDescriptor>) -> Self {
        let tree = NodeTree::new(descriptor.clone());
        Self::with_tree(descriptor, tree)
    }

    /// Create a host around an existing tree.
    pub fn with_tree(descriptor: Arc<NodeTreeDescriptor>, tree: NodeTree) -> Self {
        Self {
            descriptor,
            tree,
            executor: Box::new(EagerExecutor::new()),
            allow_ui_execution: true,
        }
    }

    /// The descriptor node kinds are drawn from.
    pub fn descriptor(&self) -> &Arc<NodeTreeDescriptor> {
        &self.descriptor
    }

    /// Swap in a different executor strategy.
    pub fn set_executor(&mut self, executor: Box<dyn TreeExecutor>) {
        self.executor = executor;
    }

    /// Replace the hosted tree, finalizing the previous one.
    pub fn set_tree(&mut self, tree: NodeTree) {
        self.executor.finalize(&mut self.tree);
        self.tree = tree;
    }

    /// Install the global payload callbacks read during a run.
    pub fn set_global_params(&mut self, payload: TypedValue) {
        self.executor.set_global_payload(payload);
    }

    /// Run the tree.
    ///
    /// `is_ui_execution = true` is dropped while `allow_ui_execution` is
    /// off. `required` narrows the run to one node and its upstream.
    pub fn execute(&mut self, is_ui_execution: bool, required: Option<NodeId>) {
        if is_ui_execution && !self.allow_ui_execution {
            return;
        }
        self.executor.execute(&mut self.tree, required);
    }

    /// Tear down run state.
    pub fn finalize(&mut self) {
        self.executor.finalize(&mut self.tree);
    }

    /// The hosted tree.
    pub fn tree(&self) -> &NodeTree {
        &self.tree
    }

    /// The hosted tree, for edits.
    pub fn tree_mut(&mut self) -> &mut NodeTree {
        &mut self.tree
    }

    /// The executor.
    pub fn executor(&self) -> &dyn TreeExecutor {
        self.executor.as_ref()
    }

    /// The executor, for dirty notifications and slot access.
    pub fn executor_mut(&mut self) -> &mut dyn TreeExecutor {
        self.executor.as_mut()
    }

    /// Split borrow: tree and executor together, for calls that need both.
    pub fn tree_and_executor_mut(&mut self) -> (&mut NodeTree, &mut dyn TreeExecutor) {
        (&mut self.tree, self.executor.as_mut())
    }
}
