//! Core types for the sluice dataflow engine.
//!
//! This crate provides the pieces every sluice graph is built from:
//!
//! - [`TypeRegistry`] / [`SocketType`] / [`TypedValue`] - runtime types and
//!   the type-erased values carried on graph wires
//! - [`NodeTypeInfo`] / [`NodeTreeDescriptor`] - node-kind metadata,
//!   declarations, conversions, and companion requirements
//! - [`ExecParams`] - the view an execute callback gets of its node

mod error;
mod node_type;
mod params;
mod value;

pub use error::TypeError;
pub use glam;
pub use node_type::{
    builtin, GroupBuilder, GroupSyncMember, GroupSyncRequirement, NodeDeclaration,
    NodeDeclarationBuilder, NodeTreeDescriptor, NodeTypeInfo, PinDirection, SocketBuilder,
    SocketDeclaration, SocketGroupDeclaration,
};
pub use params::ExecParams;
pub use value::{SocketType, TypeRegistry, TypedValue};
