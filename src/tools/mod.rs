//! Tool trait, registry and the tool-executing graph node
//!
//! Each tool is a named entry with a declared argument schema. The registry
//! validates tools when they are registered and validates arguments before
//! every call.

pub mod market;
pub mod search;

use crate::capability::{call_with_timeout, CapabilityConfig};
use crate::error::OrchestrationError;
use crate::graph::{Node, NodeContext};
use crate::models::{Message, ToolCall, ToolSchema};
use crate::state::{State, StateUpdate};
use crate::Result;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Trait for a single tool capability
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> &ToolSchema;

    fn name(&self) -> &str {
        &self.schema().name
    }

    /// Run with arguments already validated against `schema()`.
    async fn execute(&self, arguments: &Value) -> Result<String>;
}

/// Tool backed by an async closure.
pub struct FnTool<F> {
    schema: ToolSchema,
    func: F,
}

impl<F, Fut> FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String>> + Send,
{
    pub fn new(schema: ToolSchema, func: F) -> Self {
        Self { schema, func }
    }
}

#[async_trait::async_trait]
impl<F, Fut> Tool for FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String>> + Send,
{
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, arguments: &Value) -> Result<String> {
        (self.func)(arguments.clone()).await
    }
}

/// Tool registry for looking up and invoking tools
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let schema = tool.schema();
        validate_schema(schema)?;

        if self.index.contains_key(&schema.name) {
            return Err(OrchestrationError::Schema(format!(
                "tool '{}' is already registered",
                schema.name
            )));
        }

        debug!(tool = %schema.name, params = schema.parameters.len(), "Registered tool");
        self.index.insert(schema.name.clone(), self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, tool: impl Tool + 'static) -> Result<Self> {
        self.register(Arc::new(tool))?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.index.get(name).map(|&i| Arc::clone(&self.tools[i]))
    }

    /// Tool names in registration order.
    pub fn list(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Schemas in registration order, for binding to a model.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(|t| t.schema().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate `call` against the tool's schema and run it under the
    /// capability timeout.
    pub async fn invoke(
        &self,
        call: &ToolCall,
        config: &CapabilityConfig,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let tool = self
            .get(&call.name)
            .ok_or_else(|| OrchestrationError::ToolNotFound(call.name.clone()))?;
        tool.schema().validate_arguments(&call.arguments)?;

        info!(tool = %call.name, call_id = %call.id, "Invoking tool");
        call_with_timeout(&call.name, config, cancel, tool.execute(&call.arguments)).await
    }
}

fn validate_schema(schema: &ToolSchema) -> Result<()> {
    let valid_name = !schema.name.is_empty()
        && schema
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid_name {
        return Err(OrchestrationError::Schema(format!(
            "invalid tool name '{}'",
            schema.name
        )));
    }

    let mut seen = HashSet::new();
    for param in &schema.parameters {
        if param.name.is_empty() || !seen.insert(param.name.as_str()) {
            return Err(OrchestrationError::Schema(format!(
                "tool '{}' declares parameter '{}' more than once or without a name",
                schema.name, param.name
            )));
        }
    }
    Ok(())
}

/// Graph node that runs the tool calls of the latest AI message.
///
/// Calls run in the order the model requested them, each appending one tool
/// message to the messages field. With `recover_errors` a failing tool
/// produces an error message instead of failing the node; cancellation always
/// propagates.
pub struct ToolNode {
    registry: Arc<ToolRegistry>,
    messages_field: String,
    capability: CapabilityConfig,
    recover_errors: bool,
}

impl ToolNode {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            messages_field: "messages".to_string(),
            capability: CapabilityConfig::default(),
            recover_errors: false,
        }
    }

    pub fn with_messages_field(mut self, field: impl Into<String>) -> Self {
        self.messages_field = field.into();
        self
    }

    pub fn with_capability_config(mut self, config: CapabilityConfig) -> Self {
        self.capability = config;
        self
    }

    pub fn recover_errors(mut self, recover: bool) -> Self {
        self.recover_errors = recover;
        self
    }
}

#[async_trait::async_trait]
impl Node for ToolNode {
    async fn run(&self, state: &State, ctx: &NodeContext) -> Result<StateUpdate> {
        let last = match state.get_list(&self.messages_field).and_then(|m| m.last()) {
            Some(value) => serde_json::from_value::<Message>(value.clone())?,
            None => return Ok(StateUpdate::new()),
        };

        let mut update = StateUpdate::new();
        for call in last.tool_calls() {
            let content = match self.registry.invoke(call, &self.capability, &ctx.cancel).await {
                Ok(output) => output,
                Err(OrchestrationError::Cancelled) => return Err(OrchestrationError::Cancelled),
                Err(err) if self.recover_errors => {
                    warn!(tool = %call.name, error = %err, "Tool call failed, reporting to model");
                    format!("Error: {}", err)
                }
                Err(err) => return Err(err),
            };
            update = update.push(self.messages_field.as_str(), Message::tool(call, content).to_value()?);
        }

        Ok(update)
    }
}
