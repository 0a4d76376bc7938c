//! Graph object model for the sluice dataflow engine.
//!
//! This crate provides:
//!
//! - [`NodeTree`] - arena-based node graph with stable ids and the full
//!   structural edit surface (nodes, links, socket groups, sub-trees)
//! - the topology cache: stable toposort, cycle flag, resolved adjacency
//! - JSON serialization with a value-equal round trip

mod error;
mod ids;
mod node;
mod serial;
mod socket;
mod topology;
mod tree;

pub use error::GraphError;
pub use ids::{LinkId, NodeId, SocketId};
pub use node::{Node, NodeLink};
pub use socket::{DataField, GroupRef, NodeSocket, SocketGroup};
pub use tree::{AddLinkOptions, DeleteLinkOptions, NodeTree};
