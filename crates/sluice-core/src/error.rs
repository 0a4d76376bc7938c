//! Error types for sluice-core.

use thiserror::Error;

/// Error when a typed value is used with the wrong type.
#[derive(Debug, Clone, Error)]
pub enum TypeError {
    /// A value of one type was used where another was expected.
    #[error("type error: expected {expected}, got {got}")]
    Mismatch {
        /// The type that was expected.
        expected: String,
        /// The type that was actually provided.
        got: String,
    },

    /// The requested type has not been registered.
    #[error("type not registered: {0}")]
    NotRegistered(String),

    /// An empty value was used where a typed one was required.
    #[error("value is empty, expected {expected}")]
    Empty {
        /// The type that was expected.
        expected: String,
    },
}

impl TypeError {
    /// Create a mismatch error from two type names.
    pub fn mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::Mismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mismatch_display() {
        let err = TypeError::mismatch("i32", "bool");
        let msg = err.to_string();
        assert!(msg.contains("i32"));
        assert!(msg.contains("bool"));
    }

    #[test]
    fn test_not_registered_display() {
        let err = TypeError::NotRegistered("Mesh".to_string());
        assert!(err.to_string().contains("Mesh"));
    }
}
