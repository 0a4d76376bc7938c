//! Error types for graph mutation and serialization.

use thiserror::Error;

use crate::ids::{LinkId, NodeId, SocketId};

/// Errors that can occur while editing or (de)serializing a node tree.
#[derive(Debug, Clone, Error)]
pub enum GraphError {
    /// Node with the given id was not found.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// Socket with the given id was not found.
    #[error("socket not found: {0}")]
    SocketNotFound(SocketId),

    /// Link with the given id was not found.
    #[error("link not found: {0}")]
    LinkNotFound(LinkId),

    /// No node kind registered under this name.
    #[error("unknown node kind: {0}")]
    UnknownKind(String),

    /// No socket type registered under this name.
    #[error("unknown socket type: {0}")]
    UnknownType(String),

    /// A link must run from an output to an input.
    #[error("link direction mismatch: from must be an output, to an input")]
    DirectionMismatch,

    /// Linking these sockets would close a cycle.
    #[error("link would create a cycle")]
    WouldCycle,

    /// Socket types differ and no conversion is registered.
    #[error("link type mismatch: {from} cannot feed {to}")]
    LinkTypeMismatch {
        /// Type of the output socket.
        from: String,
        /// Type of the input socket.
        to: String,
    },

    /// The input is already wired and relinking was not allowed.
    #[error("input {0} is already linked")]
    InputAlreadyLinked(SocketId),

    /// No socket group with this identifier on the node.
    #[error("socket group not found: {0}")]
    GroupNotFound(String),

    /// No socket with this identifier in the group.
    #[error("no socket named {0} in group")]
    GroupSocketNotFound(String),

    /// Synchronized groups must have identical socket counts.
    #[error("synchronized socket groups differ in size")]
    SyncGroupSizeMismatch,

    /// The node is not a group node.
    #[error("node {0} is not a group")]
    NotAGroup(NodeId),

    /// A serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for GraphError {
    fn from(err: serde_json::Error) -> Self {
        GraphError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = GraphError::UnknownKind("warp".to_string());
        assert!(err.to_string().contains("warp"));

        let err = GraphError::LinkTypeMismatch {
            from: "i32".to_string(),
            to: "f32".to_string(),
        };
        assert!(err.to_string().contains("i32"));
        assert!(err.to_string().contains("f32"));
    }
}
