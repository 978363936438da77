//! Execution engine for compiled graphs
//!
//! One step = the set of nodes made runnable by the previous step. A single
//! runnable node runs inline; several run as concurrent tasks against the
//! same pre-step snapshot. Updates are merged in branch order after the
//! barrier, then edges are resolved to build the next step.

use crate::error::OrchestrationError;
use crate::graph::compiler::Transition;
use crate::graph::{CompiledGraph, Node, NodeContext, END};
use crate::state::{State, StateUpdate};
use crate::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Steps allowed per invocation unless the caller overrides it.
pub const DEFAULT_RECURSION_LIMIT: usize = 25;

/// Per-invocation settings.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Maximum number of executed steps; starting step `limit + 1` fails.
    pub recursion_limit: usize,
    /// Optional wall-clock bound for each node.
    pub node_timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            node_timeout: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl RunConfig {
    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// State after one completed step.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutput {
    pub step: usize,
    /// Nodes executed in this step, in branch order.
    pub nodes: Vec<String>,
    pub state: State,
    pub completed_at: DateTime<Utc>,
}

impl CompiledGraph {
    pub async fn invoke(&self, input: StateUpdate) -> Result<State> {
        self.invoke_with(input, RunConfig::default()).await
    }

    /// Run to END and return the final state, or the single error that
    /// aborted the invocation.
    pub async fn invoke_with(&self, input: StateUpdate, config: RunConfig) -> Result<State> {
        let mut execution = Execution::new(self, input, config)?;
        let span = info_span!("invoke", graph = %self.name, run_id = %execution.run_id);

        async move {
            let started = Instant::now();
            info!("Invocation started");

            loop {
                match execution.step().await {
                    Ok(Some(_)) => continue,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(steps = execution.steps, error = %err, "Invocation failed");
                        return Err(err);
                    }
                }
            }

            info!(
                steps = execution.steps,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Invocation completed"
            );
            Ok(execution.state)
        }
        .instrument(span)
        .await
    }

    pub fn stream(&self, input: StateUpdate) -> impl Stream<Item = Result<StepOutput>> + '_ {
        self.stream_with(input, RunConfig::default())
    }

    /// Lazy sequence of per-step states.
    ///
    /// Nothing runs until the stream is polled. It ends after the step that
    /// reaches END, or right after yielding the first error.
    pub fn stream_with(
        &self,
        input: StateUpdate,
        config: RunConfig,
    ) -> impl Stream<Item = Result<StepOutput>> + '_ {
        let cursor = match Execution::new(self, input, config) {
            Ok(execution) => Cursor::Running(Box::new(execution)),
            Err(err) => Cursor::Failed(err),
        };

        stream::unfold(cursor, |cursor| async move {
            match cursor {
                Cursor::Running(mut execution) => match execution.step().await {
                    Ok(Some(output)) => Some((Ok(output), Cursor::Running(execution))),
                    Ok(None) => None,
                    Err(err) => Some((Err(err), Cursor::Done)),
                },
                Cursor::Failed(err) => Some((Err(err), Cursor::Done)),
                Cursor::Done => None,
            }
        })
    }
}

enum Cursor<'g> {
    Running(Box<Execution<'g>>),
    Failed(OrchestrationError),
    Done,
}

/// Mutable bookkeeping of one invocation. Never shared between invocations.
struct Execution<'g> {
    graph: &'g CompiledGraph,
    config: RunConfig,
    run_id: Uuid,
    state: State,
    frontier: Vec<String>,
    /// join name -> predecessors that completed in the current wave
    arrivals: HashMap<String, Vec<String>>,
    steps: usize,
}

impl<'g> Execution<'g> {
    fn new(graph: &'g CompiledGraph, input: StateUpdate, config: RunConfig) -> Result<Self> {
        let state = graph.schema.initial_state(&input)?;

        Ok(Self {
            graph,
            config,
            run_id: Uuid::new_v4(),
            state,
            frontier: graph.entry.clone(),
            arrivals: HashMap::new(),
            steps: 0,
        })
    }

    async fn step(&mut self) -> Result<Option<StepOutput>> {
        if self.frontier.is_empty() {
            // Deterministic report when several joins are stuck.
            if let Some((node, arrived)) = self.arrivals.iter().min_by(|a, b| a.0.cmp(b.0)) {
                let expected = self.graph.joins.get(node).map(Vec::len).unwrap_or_default();
                return Err(OrchestrationError::JoinStalled {
                    node: node.clone(),
                    arrived: arrived.len(),
                    expected,
                });
            }
            return Ok(None);
        }

        if self.config.cancel.is_cancelled() {
            return Err(OrchestrationError::Cancelled);
        }

        if self.steps >= self.config.recursion_limit {
            warn!(limit = self.config.recursion_limit, "Recursion limit reached");
            return Err(OrchestrationError::GraphRecursion {
                limit: self.config.recursion_limit,
            });
        }

        self.steps += 1;
        let nodes = std::mem::take(&mut self.frontier);
        debug!(step = self.steps, nodes = ?nodes, "Step started");

        let cancel = self.config.cancel.clone();
        let writes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OrchestrationError::Cancelled),
            writes = self.run_nodes(&nodes) => writes?,
        };

        self.graph.schema.merge(&mut self.state, &writes)?;
        self.frontier = self.advance(&nodes)?;

        debug!(step = self.steps, next = ?self.frontier, "Step completed");

        Ok(Some(StepOutput {
            step: self.steps,
            nodes,
            state: self.state.clone(),
            completed_at: Utc::now(),
        }))
    }

    async fn run_nodes(&self, nodes: &[String]) -> Result<Vec<(String, StateUpdate)>> {
        if let [name] = nodes {
            let node = self.node(name)?;
            let ctx = self.context(name);
            let update = AssertUnwindSafe(execute_node(
                node.as_ref(),
                &self.state,
                &ctx,
                self.config.node_timeout,
            ))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(panicked(name)))?;
            return Ok(vec![(name.clone(), update)]);
        }

        // Fan-out: every branch sees the same snapshot.
        let snapshot = Arc::new(self.state.clone());
        let mut tasks = JoinSet::new();

        for (index, name) in nodes.iter().enumerate() {
            let node = Arc::clone(self.node(name)?);
            let ctx = self.context(name);
            let snapshot = Arc::clone(&snapshot);
            let timeout = self.config.node_timeout;

            tasks.spawn(async move {
                let outcome = AssertUnwindSafe(execute_node(node.as_ref(), &snapshot, &ctx, timeout))
                    .catch_unwind()
                    .await;
                let result = outcome.unwrap_or_else(|_| Err(panicked(&ctx.node)));
                (index, result)
            });
        }

        let mut ordered: Vec<Option<(String, StateUpdate)>> = vec![None; nodes.len()];

        while let Some(joined) = tasks.join_next().await {
            let (index, result) = joined
                .map_err(|e| OrchestrationError::Internal(format!("fan-out task failed: {}", e)))?;

            match result {
                Ok(update) => ordered[index] = Some((nodes[index].clone(), update)),
                Err(err) => {
                    warn!(node = %nodes[index], error = %err, "Branch failed, aborting siblings");
                    tasks.abort_all();
                    return Err(err);
                }
            }
        }

        ordered
            .into_iter()
            .map(|slot| {
                slot.ok_or_else(|| {
                    OrchestrationError::Internal("fan-out returned incomplete results".to_string())
                })
            })
            .collect()
    }

    /// Resolve outgoing edges of the nodes that just completed.
    fn advance(&mut self, completed: &[String]) -> Result<Vec<String>> {
        let graph = self.graph;
        let mut next = Vec::new();

        for name in completed {
            match graph.transitions.get(name) {
                Some(Transition::Static(targets)) => {
                    for target in targets {
                        self.schedule(name, target, &mut next);
                    }
                }
                Some(Transition::Conditional { router, candidates }) => {
                    let target = router(&self.state);

                    if !candidates.iter().any(|c| c == &target) {
                        warn!(node = %name, target = %target, "Router returned undeclared target");
                        return Err(OrchestrationError::Routing {
                            node: name.clone(),
                            target,
                            candidates: candidates.clone(),
                        });
                    }

                    debug!(node = %name, target = %target, "Conditional edge resolved");
                    if target != END {
                        push_unique(&mut next, target);
                    }
                }
                None => {}
            }
        }

        Ok(next)
    }

    fn schedule(&mut self, from: &str, to: &str, next: &mut Vec<String>) {
        if to == END {
            return;
        }

        let graph = self.graph;
        let Some(predecessors) = graph.joins.get(to) else {
            push_unique(next, to.to_string());
            return;
        };

        let arrived = self.arrivals.entry(to.to_string()).or_default();
        if !arrived.iter().any(|p| p == from) {
            arrived.push(from.to_string());
        }
        let count = arrived.len();

        if count == predecessors.len() {
            self.arrivals.remove(to);
            debug!(join = %to, "Join ready");
            push_unique(next, to.to_string());
        } else {
            debug!(join = %to, arrived = count, expected = predecessors.len(), "Join waiting");
        }
    }

    fn node(&self, name: &str) -> Result<&'g Arc<dyn Node>> {
        let graph: &'g CompiledGraph = self.graph;
        graph.nodes.get(name).ok_or_else(|| {
            OrchestrationError::Internal(format!("node '{}' missing from compiled graph", name))
        })
    }

    fn context(&self, node: &str) -> NodeContext {
        NodeContext {
            node: node.to_string(),
            run_id: self.run_id,
            step: self.steps,
            cancel: self.config.cancel.clone(),
        }
    }
}

fn panicked(node: &str) -> OrchestrationError {
    warn!(node = %node, "Node panicked");
    OrchestrationError::Internal("node panicked".to_string()).in_node(node)
}

fn push_unique(next: &mut Vec<String>, name: String) {
    if !next.contains(&name) {
        next.push(name);
    }
}

async fn execute_node(
    node: &dyn Node,
    state: &State,
    ctx: &NodeContext,
    timeout: Option<Duration>,
) -> Result<StateUpdate> {
    let started = Instant::now();
    debug!(node = %ctx.node, step = ctx.step, "Executing node");

    let result = match timeout {
        Some(limit) => tokio::time::timeout(limit, node.run(state, ctx))
            .await
            .unwrap_or_else(|_| {
                Err(OrchestrationError::Timeout {
                    operation: format!("node '{}'", ctx.node),
                    after: limit,
                })
            }),
        None => node.run(state, ctx).await,
    };

    match result {
        Ok(update) => {
            debug!(
                node = %ctx.node,
                fields = update.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Node completed"
            );
            Ok(update)
        }
        Err(err) => {
            warn!(node = %ctx.node, error = %err, "Node failed");
            Err(err.in_node(&ctx.node))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{node_fn, StateGraph};
    use crate::state::{FieldSpec, FieldType, StateSchema};
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn counter_schema() -> StateSchema {
        StateSchema::builder()
            .field(FieldSpec::replace("count", FieldType::Integer).with_default(0))
            .build()
            .unwrap()
    }

    fn log_schema() -> StateSchema {
        StateSchema::builder()
            .field(FieldSpec::append("log"))
            .field(FieldSpec::replace("combined", FieldType::Text))
            .build()
            .unwrap()
    }

    fn increment() -> impl Node {
        node_fn(|state: State, _| async move {
            let count = state.get_i64("count").unwrap_or_default();
            Ok(StateUpdate::new().set("count", count + 1))
        })
    }

    fn append_after(value: &'static str, delay_ms: u64) -> impl Node {
        node_fn(move |_, _| async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            Ok(StateUpdate::new().push("log", value))
        })
    }

    fn counting_combine(runs: Arc<AtomicUsize>) -> impl Node {
        node_fn(move |state: State, _| {
            let runs = Arc::clone(&runs);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                let log: Vec<String> = state.get_as("log")?;
                Ok::<_, OrchestrationError>(StateUpdate::new().set("combined", log.join(",")))
            }
        })
    }

    /// count loops on `inc` while count < 3.
    fn counter_loop() -> CompiledGraph {
        let mut graph = StateGraph::new("counter", counter_schema());
        graph
            .add_node("inc", increment())
            .set_entry("inc")
            .add_conditional_edges(
                "inc",
                |state: &State| {
                    if state.get_i64("count").unwrap_or_default() < 3 {
                        "inc"
                    } else {
                        END
                    }
                },
                ["inc", END],
            );
        graph.compile().unwrap()
    }

    fn fan_in(left_delay: u64, right_delay: u64, runs: Arc<AtomicUsize>) -> CompiledGraph {
        let mut graph = StateGraph::new("fan-in", log_schema());
        graph
            .add_node("left", append_after("left", left_delay))
            .add_node("right", append_after("right", right_delay))
            .add_node("combine", counting_combine(runs))
            .set_entry("left")
            .set_entry("right")
            .add_edge("left", "combine")
            .add_edge("right", "combine")
            .add_edge("combine", END);
        graph.compile().unwrap()
    }

    #[tokio::test]
    async fn test_counter_loop_reaches_three() {
        let graph = counter_loop();
        let state = graph
            .invoke(StateUpdate::new().set("count", 0))
            .await
            .unwrap();
        assert_eq!(state.get_i64("count"), Some(3));
    }

    #[tokio::test]
    async fn test_fan_in_appends_in_declared_order() {
        let runs = Arc::new(AtomicUsize::new(0));
        let graph = fan_in(5, 60, Arc::clone(&runs));

        let state = graph
            .invoke(StateUpdate::new().set("log", json!([])))
            .await
            .unwrap();

        assert_eq!(state.get("log").unwrap(), &json!(["left", "right"]));
        assert_eq!(state.get_str("combined"), Some("left,right"));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_append_order_ignores_completion_order() {
        // the first-declared branch finishes last
        let runs = Arc::new(AtomicUsize::new(0));
        let graph = fan_in(80, 1, Arc::clone(&runs));

        let state = graph.invoke(StateUpdate::new()).await.unwrap();
        assert_eq!(state.get("log").unwrap(), &json!(["left", "right"]));
    }

    #[tokio::test]
    async fn test_join_runs_once_with_uneven_branches() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut graph = StateGraph::new("uneven", log_schema());
        graph
            .add_node("split", node_fn(|_, _| async { Ok(StateUpdate::new()) }))
            .add_node("a1", append_after("a1", 0))
            .add_node("a2", append_after("a2", 0))
            .add_node("b", append_after("b", 0))
            .add_node("c", append_after("c", 0))
            .add_node("join", counting_combine(Arc::clone(&runs)))
            .set_entry("split")
            .add_edge("split", "a1")
            .add_edge("split", "b")
            .add_edge("split", "c")
            .add_edge("a1", "a2")
            .add_edge("a2", "join")
            .add_edge("b", "join")
            .add_edge("c", "join")
            .add_edge("join", END);
        let compiled = graph.compile().unwrap();

        let state = compiled.invoke(StateUpdate::new()).await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(state.get_str("combined"), Some("a1,b,c,a2"));
    }

    #[tokio::test]
    async fn test_router_outside_candidates_is_routing_error() {
        let mut graph = StateGraph::new("bad-router", counter_schema());
        graph
            .add_node("inc", increment())
            .set_entry("inc")
            .add_conditional_edges("inc", |_: &State| "elsewhere", ["inc", END]);
        let compiled = graph.compile().unwrap();

        let err = compiled.invoke(StateUpdate::new()).await.unwrap_err();
        match err {
            OrchestrationError::Routing { node, target, candidates } => {
                assert_eq!(node, "inc");
                assert_eq!(target, "elsewhere");
                assert_eq!(candidates, vec!["inc".to_string(), END.to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_recursion_limit_fails_on_next_step() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let mut graph = StateGraph::new("forever", counter_schema());
        graph
            .add_node(
                "spin",
                node_fn(move |_, _| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(StateUpdate::new())
                    }
                }),
            )
            .set_entry("spin")
            .add_conditional_edges("spin", |_: &State| "spin", ["spin", END]);
        let compiled = graph.compile().unwrap();

        let err = compiled
            .invoke_with(StateUpdate::new(), RunConfig::default().with_recursion_limit(5))
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestrationError::GraphRecursion { limit: 5 }));
        assert_eq!(runs.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_graph_finishing_at_limit_succeeds() {
        let graph = counter_loop();
        let result = graph
            .invoke_with(StateUpdate::new(), RunConfig::default().with_recursion_limit(3))
            .await;
        assert_ok!(result);
    }

    #[tokio::test]
    async fn test_fan_out_fails_fast() {
        let mut graph = StateGraph::new("fail-fast", log_schema());
        graph
            .add_node("slow", append_after("slow", 10_000))
            .add_node(
                "bad",
                node_fn(|_, _| async {
                    Err(OrchestrationError::Capability("quote service down".to_string()))
                }),
            )
            .set_entry("slow")
            .set_entry("bad")
            .add_edge("slow", END)
            .add_edge("bad", END);
        let compiled = graph.compile().unwrap();

        let err = tokio::time::timeout(Duration::from_secs(2), compiled.invoke(StateUpdate::new()))
            .await
            .expect("fan-out should not wait for the slow branch")
            .unwrap_err();

        assert_eq!(err.node(), Some("bad"));
        assert!(err.to_string().contains("quote service down"));
    }

    #[tokio::test]
    async fn test_replace_collision_in_fan_out() {
        let mut graph = StateGraph::new("collide", log_schema());
        graph
            .add_node("a", node_fn(|_, _| async { Ok(StateUpdate::new().set("combined", "a")) }))
            .add_node("b", node_fn(|_, _| async { Ok(StateUpdate::new().set("combined", "b")) }))
            .set_entry("a")
            .set_entry("b")
            .add_edge("a", END)
            .add_edge("b", END);
        let compiled = graph.compile().unwrap();

        let err = compiled.invoke(StateUpdate::new()).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::MergeConflict { ref field, .. } if field == "combined"));
    }

    #[tokio::test]
    async fn test_unknown_field_write_rejected() {
        let mut graph = StateGraph::new("unknown", counter_schema());
        graph
            .add_node("writer", node_fn(|_, _| async { Ok(StateUpdate::new().set("mystery", 1)) }))
            .set_entry("writer")
            .add_edge("writer", END);
        let compiled = graph.compile().unwrap();

        let err = compiled.invoke(StateUpdate::new()).await.unwrap_err();
        assert_eq!(err.node(), Some("writer"));
        assert!(err.to_string().contains("mystery"));
    }

    #[tokio::test]
    async fn test_node_timeout_is_node_error() {
        let mut graph = StateGraph::new("timeout", log_schema());
        graph
            .add_node("sleepy", append_after("late", 5_000))
            .set_entry("sleepy")
            .add_edge("sleepy", END);
        let compiled = graph.compile().unwrap();

        let config = RunConfig::default().with_node_timeout(Duration::from_millis(20));
        let err = compiled.invoke_with(StateUpdate::new(), config).await.unwrap_err();

        match err {
            OrchestrationError::NodeExecution { node, source } => {
                assert_eq!(node, "sleepy");
                assert!(matches!(*source, OrchestrationError::Timeout { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_inline_panic_is_node_error() {
        let mut graph = StateGraph::new("panic", counter_schema());
        graph
            .add_node(
                "boom",
                node_fn(|state: State, _| async move {
                    if state.get_i64("count").unwrap_or_default() == 0 {
                        panic!("kaboom");
                    }
                    Ok(StateUpdate::new())
                }),
            )
            .set_entry("boom")
            .add_edge("boom", END);
        let compiled = graph.compile().unwrap();

        let err = compiled.invoke(StateUpdate::new()).await.unwrap_err();
        match err {
            OrchestrationError::NodeExecution { node, source } => {
                assert_eq!(node, "boom");
                assert!(matches!(*source, OrchestrationError::Internal(_)));
            }
            other => panic!("unexpected error: {other}"),
        }

        let items: Vec<Result<StepOutput>> = compiled.stream(StateUpdate::new()).collect().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap_err().node(), Some("boom"));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_running_step() {
        let mut graph = StateGraph::new("cancel", log_schema());
        graph
            .add_node("sleepy", append_after("late", 10_000))
            .set_entry("sleepy")
            .add_edge("sleepy", END);
        let compiled = graph.compile().unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let config = RunConfig::default().with_cancellation(cancel);
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            compiled.invoke_with(StateUpdate::new(), config),
        )
        .await
        .expect("cancellation should stop the invocation");

        assert!(matches!(result, Err(OrchestrationError::Cancelled)));
    }

    #[tokio::test]
    async fn test_join_stall_is_reported() {
        let mut graph = StateGraph::new("stall", log_schema());
        graph
            .add_node("route", node_fn(|_, _| async { Ok(StateUpdate::new()) }))
            .add_node("a", append_after("a", 0))
            .add_node("b", append_after("b", 0))
            .add_node("join", counting_combine(Arc::new(AtomicUsize::new(0))))
            .set_entry("route")
            .add_conditional_edges("route", |_: &State| "a", ["a", "b"])
            .add_edge("a", "join")
            .add_edge("b", "join")
            .add_edge("join", END);
        let compiled = graph.compile().unwrap();

        let err = compiled.invoke(StateUpdate::new()).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::JoinStalled { ref node, arrived: 1, expected: 2 } if node == "join"
        ));
    }

    #[tokio::test]
    async fn test_stream_yields_each_step() {
        let graph = counter_loop();
        let steps: Vec<StepOutput> = graph
            .stream(StateUpdate::new())
            .map(|item| item.unwrap())
            .collect()
            .await;

        let counts: Vec<i64> = steps
            .iter()
            .map(|s| s.state.get_i64("count").unwrap())
            .collect();
        assert_eq!(counts, vec![1, 2, 3]);
        assert_eq!(steps[2].step, 3);
        assert_eq!(steps[0].nodes, vec!["inc".to_string()]);
    }

    #[tokio::test]
    async fn test_stream_runs_nothing_until_polled() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&runs);
        let mut graph = StateGraph::new("lazy", counter_schema());
        graph
            .add_node(
                "inc",
                node_fn(move |state: State, _| {
                    counted.fetch_add(1, Ordering::SeqCst);
                    async move {
                        let count = state.get_i64("count").unwrap_or_default();
                        Ok(StateUpdate::new().set("count", count + 1))
                    }
                }),
            )
            .set_entry("inc")
            .add_edge("inc", END);
        let compiled = graph.compile().unwrap();

        let mut steps = Box::pin(compiled.stream(StateUpdate::new()));
        tokio::task::yield_now().await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        let first = steps.next().await.unwrap().unwrap();
        assert_eq!(first.state.get_i64("count"), Some(1));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(steps.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_ends_after_error() {
        let mut graph = StateGraph::new("bad-router", counter_schema());
        graph
            .add_node("inc", increment())
            .set_entry("inc")
            .add_conditional_edges("inc", |_: &State| "nowhere", ["inc", END]);
        let compiled = graph.compile().unwrap();

        let items: Vec<Result<StepOutput>> = compiled.stream(StateUpdate::new()).collect().await;
        assert_eq!(items.len(), 1);
        assert_err!(&items[0]);

        let bad_input = compiled.stream(StateUpdate::new().set("nope", 1));
        let items: Vec<Result<StepOutput>> = bad_input.collect().await;
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_invocations_are_isolated() {
        let graph = counter_loop();

        let (a, b) = tokio::join!(
            graph.invoke(StateUpdate::new().set("count", 0)),
            graph.invoke(StateUpdate::new().set("count", 10)),
        );

        assert_eq!(a.unwrap().get_i64("count"), Some(3));
        // already past the threshold: one increment then END
        assert_eq!(b.unwrap().get_i64("count"), Some(11));
    }
}
