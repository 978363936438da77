//! Agent Graph Orchestrator
//!
//! A graph-based engine for agent workflows:
//! - Typed state schema with replace / append reducers
//! - Nodes joined by static and conditional edges, compiled once
//! - Step executor with concurrent fan-out, deterministic joins,
//!   recursion limit, timeouts and cancellation
//! - Tool-invocation loop over pluggable model and tool capabilities
//!
//! BUILD → COMPILE → INVOKE / STREAM

pub mod agent;
pub mod capability;
pub mod config;
pub mod error;
pub mod execution;
pub mod graph;
pub mod model;
pub mod models;
pub mod state;
pub mod tools;

pub use error::{OrchestrationError, Result};

// Re-export common types
pub use execution::{RunConfig, StepOutput};
pub use graph::{node_fn, CompilationError, CompiledGraph, Node, NodeContext, StateGraph, END, START};
pub use state::{FieldSpec, FieldType, Reducer, State, StateSchema, StateUpdate};
