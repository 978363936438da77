//! Graph compilation: validation and the immutable executable form.

use super::{ConditionalEdge, Node, RouterFn, StateGraph, END, START};
use crate::state::StateSchema;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Error when compiling a state graph.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompilationError {
    #[error("node name '{0}' is reserved or empty")]
    ReservedName(String),

    #[error("node '{0}' registered twice")]
    DuplicateNode(String),

    #[error("edge source '{0}' is not a declared node")]
    UnknownSource(String),

    #[error("edge '{from}' -> '{to}' targets an undeclared node")]
    UnknownTarget { from: String, to: String },

    #[error("edge '{from}' -> '{to}' declared twice")]
    DuplicateEdge { from: String, to: String },

    #[error("edges may not leave END")]
    EdgeFromEnd,

    #[error("edge from '{0}' targets START")]
    EdgeToStart(String),

    #[error("START may only have static edges")]
    ConditionalFromStart,

    #[error("node '{0}' has more than one conditional edge")]
    MultipleConditional(String),

    #[error("conditional edge from '{0}' has no candidates")]
    EmptyCandidates(String),

    #[error("node '{0}' mixes static and conditional outgoing edges")]
    MixedEdges(String),

    #[error("node '{0}' has no outgoing edge (route it to END explicitly)")]
    DeadEnd(String),

    #[error("START has no outgoing edge")]
    NoEntry,

    #[error("nodes unreachable from START: {0:?}")]
    Unreachable(Vec<String>),

    #[error("edge '{from}' -> '{join}' enters a join outside its static predecessors")]
    JoinBypass { from: String, join: String },
}

#[derive(Clone)]
pub(crate) enum Transition {
    Static(Vec<String>),
    Conditional {
        router: RouterFn,
        candidates: Vec<String>,
    },
}

/// Compiled graph: immutable, reusable across invocations.
///
/// Holds the validated nodes, the transition table and the join table
/// (nodes with two or more static predecessors other than START).
/// `invoke` / `stream` live in `execution`.
pub struct CompiledGraph {
    pub(crate) name: String,
    pub(crate) schema: StateSchema,
    pub(crate) nodes: HashMap<String, Arc<dyn Node>>,
    pub(crate) node_order: Vec<String>,
    pub(crate) entry: Vec<String>,
    pub(crate) transitions: HashMap<String, Transition>,
    pub(crate) joins: HashMap<String, Vec<String>>,
}

impl CompiledGraph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    /// Node names in registration order.
    pub fn node_names(&self) -> &[String] {
        &self.node_order
    }

    /// Nodes scheduled by the first step.
    pub fn entry_nodes(&self) -> &[String] {
        &self.entry
    }

    pub fn is_join(&self, node: &str) -> bool {
        self.joins.contains_key(node)
    }

    /// Static predecessors a join waits for, in declaration order.
    pub fn join_predecessors(&self, node: &str) -> Option<&[String]> {
        self.joins.get(node).map(Vec::as_slice)
    }
}

impl fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("name", &self.name)
            .field("nodes", &self.node_order)
            .field("entry", &self.entry)
            .field("joins", &self.joins)
            .finish()
    }
}

pub(super) fn compile(graph: StateGraph) -> Result<CompiledGraph, CompilationError> {
    if let Some(err) = graph.build_errors.into_iter().next() {
        return Err(err);
    }

    let declared: HashSet<&str> = graph.nodes.iter().map(|(name, _)| name.as_str()).collect();
    let is_target = |name: &str| name == END || declared.contains(name);

    // ---- static edges ----
    let mut static_out: HashMap<String, Vec<String>> = HashMap::new();
    let mut seen_edges: HashSet<(&str, &str)> = HashSet::new();

    for (from, to) in &graph.static_edges {
        if from == END {
            return Err(CompilationError::EdgeFromEnd);
        }
        if from != START && !declared.contains(from.as_str()) {
            return Err(CompilationError::UnknownSource(from.clone()));
        }
        if to == START {
            return Err(CompilationError::EdgeToStart(from.clone()));
        }
        if !is_target(to.as_str()) {
            return Err(CompilationError::UnknownTarget {
                from: from.clone(),
                to: to.clone(),
            });
        }
        if !seen_edges.insert((from.as_str(), to.as_str())) {
            return Err(CompilationError::DuplicateEdge {
                from: from.clone(),
                to: to.clone(),
            });
        }
        static_out.entry(from.clone()).or_default().push(to.clone());
    }

    // ---- conditional edges ----
    let mut conditional_out: HashMap<String, ConditionalEdge> = HashMap::new();

    for (from, edge) in &graph.conditional_edges {
        if from == START {
            return Err(CompilationError::ConditionalFromStart);
        }
        if from == END {
            return Err(CompilationError::EdgeFromEnd);
        }
        if !declared.contains(from.as_str()) {
            return Err(CompilationError::UnknownSource(from.clone()));
        }
        if edge.candidates.is_empty() {
            return Err(CompilationError::EmptyCandidates(from.clone()));
        }
        for candidate in &edge.candidates {
            if candidate == START {
                return Err(CompilationError::EdgeToStart(from.clone()));
            }
            if !is_target(candidate.as_str()) {
                return Err(CompilationError::UnknownTarget {
                    from: from.clone(),
                    to: candidate.clone(),
                });
            }
        }
        if static_out.contains_key(from) {
            return Err(CompilationError::MixedEdges(from.clone()));
        }
        if conditional_out.insert(from.clone(), edge.clone()).is_some() {
            return Err(CompilationError::MultipleConditional(from.clone()));
        }
    }

    let entry = static_out.remove(START).ok_or(CompilationError::NoEntry)?;

    for (name, _) in &graph.nodes {
        if !static_out.contains_key(name) && !conditional_out.contains_key(name) {
            return Err(CompilationError::DeadEnd(name.clone()));
        }
    }

    // ---- reachability ----
    let mut reachable: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = entry.iter().map(String::as_str).collect();

    while let Some(current) = queue.pop_front() {
        if current == END || !reachable.insert(current) {
            continue;
        }
        if let Some(targets) = static_out.get(current) {
            queue.extend(targets.iter().map(String::as_str));
        }
        if let Some(edge) = conditional_out.get(current) {
            queue.extend(edge.candidates.iter().map(String::as_str));
        }
    }

    let unreachable: Vec<String> = graph
        .nodes
        .iter()
        .map(|(name, _)| name)
        .filter(|name| !reachable.contains(name.as_str()))
        .cloned()
        .collect();

    if !unreachable.is_empty() {
        return Err(CompilationError::Unreachable(unreachable));
    }

    // ---- joins ----
    let mut predecessors: HashMap<String, Vec<String>> = HashMap::new();
    for (from, to) in &graph.static_edges {
        if from == START || to == END {
            continue;
        }
        predecessors.entry(to.clone()).or_default().push(from.clone());
    }
    let joins: HashMap<String, Vec<String>> = predecessors
        .into_iter()
        .filter(|(_, preds)| preds.len() > 1)
        .collect();

    // A join only fires once all static predecessors arrive; START and
    // conditional edges would schedule it without them.
    let bypass = graph
        .static_edges
        .iter()
        .filter(|(from, _)| from == START)
        .map(|(from, to)| (from, to))
        .chain(graph.conditional_edges.iter().flat_map(|(from, edge)| {
            edge.candidates.iter().map(move |candidate| (from, candidate))
        }))
        .find(|(_, to)| joins.contains_key(to.as_str()));

    if let Some((from, join)) = bypass {
        return Err(CompilationError::JoinBypass {
            from: from.clone(),
            join: join.clone(),
        });
    }

    let mut transitions: HashMap<String, Transition> = HashMap::new();
    for (from, targets) in static_out {
        transitions.insert(from, Transition::Static(targets));
    }
    for (from, edge) in conditional_out {
        transitions.insert(
            from,
            Transition::Conditional {
                router: edge.router,
                candidates: edge.candidates,
            },
        );
    }

    let node_order: Vec<String> = graph.nodes.iter().map(|(name, _)| name.clone()).collect();

    for (join, preds) in &joins {
        debug!(graph = %graph.name, join = %join, predecessors = ?preds, "Join node detected");
    }

    info!(
        graph = %graph.name,
        nodes = node_order.len(),
        joins = joins.len(),
        "Graph compiled"
    );

    Ok(CompiledGraph {
        name: graph.name,
        schema: graph.schema,
        nodes: graph.nodes.into_iter().collect(),
        node_order,
        entry,
        transitions,
        joins,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node_fn;
    use crate::state::{FieldSpec, FieldType, State, StateSchema, StateUpdate};

    fn schema() -> StateSchema {
        StateSchema::builder()
            .field(FieldSpec::replace("count", FieldType::Integer).with_default(0))
            .field(FieldSpec::append("log"))
            .build()
            .unwrap()
    }

    fn noop() -> impl Node {
        node_fn(|_, _| async { Ok(StateUpdate::new()) })
    }

    #[test]
    fn test_compile_linear_graph() {
        let mut graph = StateGraph::new("linear", schema());
        graph
            .add_node("a", noop())
            .add_node("b", noop())
            .set_entry("a")
            .add_edge("a", "b")
            .add_edge("b", END);

        let compiled = graph.compile().unwrap();
        assert_eq!(compiled.entry_nodes(), ["a".to_string()]);
        assert_eq!(compiled.node_names().len(), 2);
        assert!(!compiled.is_join("b"));
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let mut graph = StateGraph::new("dangling", schema());
        graph.add_node("a", noop()).set_entry("a").add_edge("a", "ghost");

        assert_eq!(
            graph.compile().unwrap_err(),
            CompilationError::UnknownTarget {
                from: "a".to_string(),
                to: "ghost".to_string()
            }
        );
    }

    #[test]
    fn test_unreachable_node_rejected() {
        let mut graph = StateGraph::new("island", schema());
        graph
            .add_node("a", noop())
            .add_node("island", noop())
            .set_entry("a")
            .add_edge("a", END)
            .add_edge("island", END);

        assert_eq!(
            graph.compile().unwrap_err(),
            CompilationError::Unreachable(vec!["island".to_string()])
        );
    }

    #[test]
    fn test_missing_entry_rejected() {
        let mut graph = StateGraph::new("no-entry", schema());
        graph.add_node("a", noop()).add_edge("a", END);

        assert_eq!(graph.compile().unwrap_err(), CompilationError::NoEntry);
    }

    #[test]
    fn test_conditional_candidates_validated() {
        let mut empty = StateGraph::new("empty", schema());
        empty
            .add_node("a", noop())
            .set_entry("a")
            .add_conditional_edges("a", |_: &State| END, Vec::<String>::new());
        assert_eq!(
            empty.compile().unwrap_err(),
            CompilationError::EmptyCandidates("a".to_string())
        );

        let mut unknown = StateGraph::new("unknown", schema());
        unknown
            .add_node("a", noop())
            .set_entry("a")
            .add_conditional_edges("a", |_: &State| END, ["nowhere", END]);
        assert!(matches!(
            unknown.compile().unwrap_err(),
            CompilationError::UnknownTarget { .. }
        ));
    }

    #[test]
    fn test_mixed_edges_and_dead_ends_rejected() {
        let mut mixed = StateGraph::new("mixed", schema());
        mixed
            .add_node("a", noop())
            .set_entry("a")
            .add_edge("a", END)
            .add_conditional_edges("a", |_: &State| END, [END]);
        assert_eq!(
            mixed.compile().unwrap_err(),
            CompilationError::MixedEdges("a".to_string())
        );

        let mut dead = StateGraph::new("dead", schema());
        dead.add_node("a", noop()).set_entry("a");
        assert_eq!(
            dead.compile().unwrap_err(),
            CompilationError::DeadEnd("a".to_string())
        );
    }

    #[test]
    fn test_reserved_and_duplicate_names() {
        let mut reserved = StateGraph::new("reserved", schema());
        reserved.add_node(END, noop());
        assert!(matches!(
            reserved.compile().unwrap_err(),
            CompilationError::ReservedName(_)
        ));

        let mut duplicate = StateGraph::new("duplicate", schema());
        duplicate
            .add_node("a", noop())
            .add_node("a", noop())
            .set_entry("a")
            .add_edge("a", END);
        assert_eq!(
            duplicate.compile().unwrap_err(),
            CompilationError::DuplicateNode("a".to_string())
        );
    }

    #[test]
    fn test_cycles_allowed_and_joins_detected() {
        let mut graph = StateGraph::new("diamond", schema());
        graph
            .add_node("split", noop())
            .add_node("left", noop())
            .add_node("right", noop())
            .add_node("combine", noop())
            .set_entry("split")
            .add_edge("split", "left")
            .add_edge("split", "right")
            .add_edge("left", "combine")
            .add_edge("right", "combine")
            .add_conditional_edges(
                "combine",
                |_: &State| END,
                ["split", END],
            );

        let compiled = graph.compile().unwrap();
        assert!(compiled.is_join("combine"));
        assert_eq!(
            compiled.join_predecessors("combine").unwrap(),
            ["left".to_string(), "right".to_string()]
        );
        // START edges never make a join
        assert!(!compiled.is_join("split"));
    }

    #[test]
    fn test_conditional_edge_into_join_rejected() {
        let mut graph = StateGraph::new("shortcut", schema());
        graph
            .add_node("a", noop())
            .add_node("p", noop())
            .add_node("q", noop())
            .add_node("r", noop())
            .add_node("j", noop())
            .set_entry("a")
            .set_entry("p")
            .add_conditional_edges("a", |_: &State| "j", ["j", END])
            .add_edge("p", "q")
            .add_edge("p", "r")
            .add_edge("q", "j")
            .add_edge("r", "j")
            .add_edge("j", END);

        assert_eq!(
            graph.compile().unwrap_err(),
            CompilationError::JoinBypass {
                from: "a".to_string(),
                join: "j".to_string()
            }
        );
    }

    #[test]
    fn test_entry_edge_into_join_rejected() {
        let mut graph = StateGraph::new("early-join", schema());
        graph
            .add_node("left", noop())
            .add_node("right", noop())
            .add_node("combine", noop())
            .set_entry("left")
            .set_entry("right")
            .set_entry("combine")
            .add_edge("left", "combine")
            .add_edge("right", "combine")
            .add_edge("combine", END);

        assert_eq!(
            graph.compile().unwrap_err(),
            CompilationError::JoinBypass {
                from: START.to_string(),
                join: "combine".to_string()
            }
        );
    }
}
