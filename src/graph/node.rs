//! Graph node trait: one named unit of computation over the shared state.

use crate::state::{State, StateUpdate};
use crate::Result;
use async_trait::async_trait;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-execution context handed to a node.
#[derive(Debug, Clone)]
pub struct NodeContext {
    /// Name the node was registered under.
    pub node: String,
    pub run_id: Uuid,
    /// 1-based step number within the invocation.
    pub step: usize,
    /// Cancelled when the caller aborts the invocation; capability calls
    /// should race against it (see `capability::call_with_timeout`).
    pub cancel: CancellationToken,
}

impl NodeContext {
    pub fn detached(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            run_id: Uuid::new_v4(),
            step: 0,
            cancel: CancellationToken::new(),
        }
    }
}

/// A node reads an immutable snapshot and returns a partial update.
///
/// Nodes never mutate shared state; the executor merges returned updates
/// after the step barrier. Failures abort the invocation.
#[async_trait]
pub trait Node: Send + Sync {
    async fn run(&self, state: &State, ctx: &NodeContext) -> Result<StateUpdate>;
}

/// Node backed by an async closure. Build with [`node_fn`].
pub struct FnNode<F> {
    func: F,
}

/// Adapt `|state, ctx| async move { ... }` into a [`Node`].
pub fn node_fn<F, Fut>(func: F) -> FnNode<F>
where
    F: Fn(State, NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StateUpdate>> + Send + 'static,
{
    FnNode { func }
}

#[async_trait]
impl<F, Fut> Node for FnNode<F>
where
    F: Fn(State, NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StateUpdate>> + Send + 'static,
{
    async fn run(&self, state: &State, ctx: &NodeContext) -> Result<StateUpdate> {
        (self.func)(state.clone(), ctx.clone()).await
    }
}
