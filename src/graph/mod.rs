//! State graph: nodes, static and conditional edges, compile.
//!
//! Build a `StateGraph` against a `StateSchema`, register nodes and edges,
//! then `compile()` into an immutable `CompiledGraph` that can be invoked any
//! number of times (see `execution`).

pub(crate) mod compiler;
mod node;

pub use compiler::{CompilationError, CompiledGraph};
pub use node::{node_fn, FnNode, Node, NodeContext};

use crate::state::{State, StateSchema};
use std::sync::Arc;

/// Entry marker. Edges from `START` select the first step.
pub const START: &str = "__start__";
/// Terminal marker.
pub const END: &str = "__end__";

/// Routing function of a conditional edge, evaluated on post-merge state.
pub type RouterFn = Arc<dyn Fn(&State) -> String + Send + Sync>;

#[derive(Clone)]
pub(crate) struct ConditionalEdge {
    pub(crate) router: RouterFn,
    pub(crate) candidates: Vec<String>,
}

/// Mutable graph under construction.
///
/// Registration problems (duplicate or reserved node names) are recorded and
/// reported by `compile`, so the builder methods can chain.
pub struct StateGraph {
    name: String,
    schema: StateSchema,
    nodes: Vec<(String, Arc<dyn Node>)>,
    static_edges: Vec<(String, String)>,
    conditional_edges: Vec<(String, ConditionalEdge)>,
    build_errors: Vec<CompilationError>,
}

impl StateGraph {
    pub fn new(name: impl Into<String>, schema: StateSchema) -> Self {
        Self {
            name: name.into(),
            schema,
            nodes: Vec::new(),
            static_edges: Vec::new(),
            conditional_edges: Vec::new(),
            build_errors: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_node(&mut self, name: impl Into<String>, node: impl Node + 'static) -> &mut Self {
        self.add_shared_node(name, Arc::new(node))
    }

    pub fn add_shared_node(&mut self, name: impl Into<String>, node: Arc<dyn Node>) -> &mut Self {
        let name = name.into();
        if name == START || name == END || name.trim().is_empty() {
            self.build_errors.push(CompilationError::ReservedName(name));
        } else if self.nodes.iter().any(|(existing, _)| existing == &name) {
            self.build_errors.push(CompilationError::DuplicateNode(name));
        } else {
            self.nodes.push((name, node));
        }
        self
    }

    /// Unconditional edge. Several static edges from one source fan out, in
    /// the order they were added.
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.static_edges.push((from.into(), to.into()));
        self
    }

    /// Conditional edge: `router` picks one of `candidates` (or `END`).
    pub fn add_conditional_edges<F, R, I, C>(
        &mut self,
        from: impl Into<String>,
        router: F,
        candidates: I,
    ) -> &mut Self
    where
        F: Fn(&State) -> R + Send + Sync + 'static,
        R: Into<String>,
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        let router: RouterFn = Arc::new(move |state: &State| router(state).into());
        self.conditional_edges.push((
            from.into(),
            ConditionalEdge {
                router,
                candidates: candidates.into_iter().map(Into::into).collect(),
            },
        ));
        self
    }

    /// Shorthand for `add_edge(START, name)`.
    pub fn set_entry(&mut self, name: impl Into<String>) -> &mut Self {
        self.add_edge(START, name)
    }

    pub fn compile(self) -> Result<CompiledGraph, CompilationError> {
        compiler::compile(self)
    }
}
