//! Error types for the streaming pipeline.

use crate::types::StreamKey;
use thiserror::Error;

/// All errors surfaced by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The graph wiring is structurally invalid (dangling input, kind
    /// mismatch, doubly-driven input, unknown node or port).
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// The graph contains a dependency cycle across connections and
    /// parameter bindings.
    #[error("pipeline graph contains a cycle")]
    CyclicGraph,

    /// A parameter slot could not be satisfied at initialization.
    #[error("unresolved dependency: node {node} slot '{slot}'")]
    UnresolvedDependency { node: u32, slot: String },

    /// The provider failed to list manifests or fetch a model.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// The operation was canceled cooperatively.
    #[error("operation canceled")]
    Cancelled,

    /// A model could not be converted into its artifact.
    #[error("conversion failed for {key}: {message}")]
    Conversion { key: StreamKey, message: String },

    /// An operation was attempted in the wrong lifecycle state.
    #[error("invalid state: expected {expected}, was {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// Graph file (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a conversion failure on a given key.
    pub fn conversion(key: &StreamKey, message: impl Into<String>) -> Self {
        Error::Conversion {
            key: key.clone(),
            message: message.into(),
        }
    }
}
