//! Error types for the graph orchestrator

use crate::graph::CompilationError;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Invocation Errors
    // =============================

    /// A node failed (including capability timeouts and invalid writes).
    #[error("Node '{node}' failed: {source}")]
    NodeExecution {
        node: String,
        #[source]
        source: Box<OrchestrationError>,
    },

    #[error("Routing error: node '{node}' routed to '{target}', expected one of {candidates:?}")]
    Routing {
        node: String,
        target: String,
        candidates: Vec<String>,
    },

    #[error("Recursion limit of {limit} steps exceeded")]
    GraphRecursion { limit: usize },

    #[error("Merge conflict on replace field '{field}': written by '{first}' and '{second}' in the same step")]
    MergeConflict {
        field: String,
        first: String,
        second: String,
    },

    #[error("Join node '{node}' stalled: {arrived} of {expected} predecessors completed")]
    JoinStalled {
        node: String,
        arrived: usize,
        expected: usize,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Invocation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Compilation error: {0}")]
    Compilation(#[from] CompilationError),

    // =============================
    // State Errors
    // =============================

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Unknown state field: {0}")]
    UnknownField(String),

    #[error("Invalid update for field '{field}': {reason}")]
    InvalidUpdate { field: String, reason: String },

    // =============================
    // Capability Errors
    // =============================

    #[error("Capability error: {0}")]
    Capability(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid tool input: {0}")]
    InvalidToolInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl OrchestrationError {
    /// Wrap a failure raised while running `node`.
    ///
    /// Errors that already carry node identity (or are terminal for the whole
    /// invocation) pass through untouched.
    pub fn in_node(self, node: &str) -> Self {
        match self {
            err @ (OrchestrationError::NodeExecution { .. }
            | OrchestrationError::Cancelled) => err,
            other => OrchestrationError::NodeExecution {
                node: node.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Name of the node this error is attributed to, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            OrchestrationError::NodeExecution { node, .. }
            | OrchestrationError::Routing { node, .. }
            | OrchestrationError::JoinStalled { node, .. } => Some(node),
            _ => None,
        }
    }
}
