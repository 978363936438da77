//! Agent patterns built on the graph engine
//!
//! THINK → (tool calls?) → ACT → THINK → ... → DONE
//!
//! `ToolLoop` wires a model-calling `agent` node and a `tools` node into the
//! two-node cycle; `tools_condition` is its router. `Failsafe` forces a tool
//! call from state when the model is expected to request one but does not.

pub mod stock;
pub mod travel;

use crate::capability::CapabilityConfig;
use crate::error::OrchestrationError;
use crate::graph::{CompiledGraph, Node, NodeContext, StateGraph, END};
use crate::model::{call_model, ModelCapability};
use crate::models::{Message, ToolCall, ToolSchema};
use crate::state::{FieldSpec, State, StateSchema, StateUpdate};
use crate::tools::{ToolNode, ToolRegistry};
use crate::Result;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Conversation log (append).
pub const MESSAGES: &str = "messages";
/// Recovered problems worth surfacing to the caller (append).
pub const WARNINGS: &str = "warnings";

pub const AGENT_NODE: &str = "agent";
pub const TOOLS_NODE: &str = "tools";

/// Last message of the conversation stored in `field`, if any.
pub fn last_message(state: &State, field: &str) -> Result<Option<Message>> {
    match state.get_list(field).and_then(|m| m.last()) {
        Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        None => Ok(None),
    }
}

/// Whether the latest message in `field` requests at least one tool call.
pub fn has_pending_tool_calls(state: &State, field: &str) -> Result<bool> {
    Ok(last_message(state, field)?.is_some_and(|message| !message.tool_calls().is_empty()))
}

/// Router of the tool loop: `tools` while the model requests calls, else END.
///
/// An unreadable last message also goes to `tools`, which fails on it with
/// the decode error instead of the run ending quietly.
pub fn tools_condition(state: &State) -> &'static str {
    match has_pending_tool_calls(state, MESSAGES) {
        Ok(true) => TOOLS_NODE,
        Ok(false) => END,
        Err(err) => {
            warn!(field = MESSAGES, error = %err, "Last message is unreadable");
            TOOLS_NODE
        }
    }
}

/// The final assistant reply of a finished tool loop.
pub fn final_answer(state: &State) -> Option<String> {
    let messages = state.get_list(MESSAGES)?;
    messages
        .iter()
        .rev()
        .filter_map(|value| serde_json::from_value::<Message>(value.clone()).ok())
        .find(|message| matches!(message, Message::Ai { .. }) && message.tool_calls().is_empty())
        .map(|message| message.content().to_string())
}

/// Initial input for a tool loop: one human message.
pub fn input(question: impl Into<String>) -> Result<StateUpdate> {
    StateUpdate::new().set_serialized(MESSAGES, &vec![Message::human(question)])
}

type DeriveArgs = Arc<dyn Fn(&State) -> Result<Value> + Send + Sync>;

/// Forced tool call used when the model answers without the tool call the
/// workflow depends on.
#[derive(Clone)]
pub struct Failsafe {
    tool: String,
    derive: DeriveArgs,
}

impl Failsafe {
    pub fn new<F>(tool: impl Into<String>, derive: F) -> Self
    where
        F: Fn(&State) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            tool: tool.into(),
            derive: Arc::new(derive),
        }
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn synthesize(&self, state: &State) -> Result<ToolCall> {
        Ok(ToolCall::new(self.tool.clone(), (self.derive)(state)?))
    }
}

/// Model-calling node of the tool loop.
pub struct AgentNode {
    model: Arc<dyn ModelCapability>,
    tools: Vec<ToolSchema>,
    system_prompt: Option<String>,
    failsafe: Option<Failsafe>,
    capability: CapabilityConfig,
}

impl AgentNode {
    pub fn new(model: Arc<dyn ModelCapability>, tools: Vec<ToolSchema>) -> Self {
        Self {
            model,
            tools,
            system_prompt: None,
            failsafe: None,
            capability: CapabilityConfig::default(),
        }
    }
}

/// Whether a tool result arrived after the latest human message.
fn answered_since_last_question(conversation: &[Message]) -> bool {
    conversation
        .iter()
        .rev()
        .take_while(|m| !matches!(m, Message::Human { .. }))
        .any(|m| matches!(m, Message::Tool { .. }))
}

#[async_trait::async_trait]
impl Node for AgentNode {
    async fn run(&self, state: &State, ctx: &NodeContext) -> Result<StateUpdate> {
        let mut conversation: Vec<Message> = state.get_as(MESSAGES)?;
        if let Some(prompt) = &self.system_prompt {
            conversation.insert(0, Message::system(prompt.as_str()));
        }

        let tools = (!self.tools.is_empty()).then_some(self.tools.as_slice());
        let mut response = call_model(
            self.model.as_ref(),
            &conversation,
            tools,
            &self.capability,
            &ctx.cancel,
        )
        .await?;

        let mut update = StateUpdate::new();
        if response.tool_calls.is_empty() {
            if let Some(failsafe) = &self.failsafe {
                if !answered_since_last_question(&conversation) {
                    warn!(
                        node = %ctx.node,
                        tool = %failsafe.tool(),
                        "Model skipped the expected tool call, forcing it"
                    );
                    response.tool_calls.push(failsafe.synthesize(state)?);
                    update = update.push(
                        WARNINGS,
                        format!("{}: forced '{}' call", ctx.node, failsafe.tool()),
                    );
                }
            }
        }

        debug!(
            node = %ctx.node,
            step = ctx.step,
            tool_calls = response.tool_calls.len(),
            "Agent turn complete"
        );
        Ok(update.push(MESSAGES, response.into_message().to_value()?))
    }
}

/// Builder for the agent/tools cycle.
pub struct ToolLoop {
    name: String,
    model: Arc<dyn ModelCapability>,
    registry: Arc<ToolRegistry>,
    system_prompt: Option<String>,
    failsafe: Option<Failsafe>,
    recover_tool_errors: bool,
    capability: CapabilityConfig,
    extra_fields: Vec<FieldSpec>,
}

impl ToolLoop {
    pub fn new(model: Arc<dyn ModelCapability>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            name: "tool_loop".to_string(),
            model,
            registry,
            system_prompt: None,
            failsafe: None,
            recover_tool_errors: false,
            capability: CapabilityConfig::default(),
            extra_fields: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_failsafe(mut self, failsafe: Failsafe) -> Self {
        self.failsafe = Some(failsafe);
        self
    }

    /// Report tool failures to the model as tool messages instead of
    /// failing the invocation.
    pub fn recover_tool_errors(mut self, recover: bool) -> Self {
        self.recover_tool_errors = recover;
        self
    }

    pub fn with_capability_config(mut self, config: CapabilityConfig) -> Self {
        self.capability = config;
        self
    }

    /// Extra state fields, e.g. inputs a failsafe derives arguments from.
    pub fn with_field(mut self, field: FieldSpec) -> Self {
        self.extra_fields.push(field);
        self
    }

    pub fn schema(&self) -> Result<StateSchema> {
        self.extra_fields
            .iter()
            .cloned()
            .fold(
                StateSchema::builder()
                    .field(FieldSpec::append(MESSAGES))
                    .field(FieldSpec::append(WARNINGS)),
                |builder, field| builder.field(field),
            )
            .build()
    }

    pub fn compile(self) -> Result<CompiledGraph> {
        if let Some(failsafe) = &self.failsafe {
            if self.registry.get(failsafe.tool()).is_none() {
                return Err(OrchestrationError::ToolNotFound(failsafe.tool().to_string()));
            }
        }

        let schema = self.schema()?;
        let agent = AgentNode {
            model: Arc::clone(&self.model),
            tools: self.registry.schemas(),
            system_prompt: self.system_prompt,
            failsafe: self.failsafe,
            capability: self.capability,
        };
        let tools = ToolNode::new(Arc::clone(&self.registry))
            .with_messages_field(MESSAGES)
            .with_capability_config(self.capability)
            .recover_errors(self.recover_tool_errors);

        info!(
            graph = %self.name,
            model = %self.model.name(),
            tools = ?self.registry.list(),
            "Building tool loop"
        );

        let mut graph = StateGraph::new(self.name, schema);
        graph
            .add_node(AGENT_NODE, agent)
            .add_node(TOOLS_NODE, tools)
            .set_entry(AGENT_NODE)
            .add_conditional_edges(AGENT_NODE, tools_condition, [TOOLS_NODE, END])
            .add_edge(TOOLS_NODE, AGENT_NODE);

        Ok(graph.compile()?)
    }
}

/// Outcome of [`call_single_tool`].
#[derive(Debug)]
pub struct SingleToolCall {
    pub call: ToolCall,
    /// The model did not request the tool; the failsafe call was used.
    pub forced: bool,
    pub output: Result<String>,
}

/// Ask the model (with the registry's tools bound) and run the first tool it
/// requests, or the failsafe call when it requests none.
///
/// Model failures are returned as errors; the tool's own result, success or
/// failure, is reported in `output` so the caller decides how to recover.
pub async fn call_single_tool(
    model: &dyn ModelCapability,
    registry: &ToolRegistry,
    prompt: &str,
    failsafe: &Failsafe,
    state: &State,
    config: &CapabilityConfig,
    cancel: &CancellationToken,
) -> Result<SingleToolCall> {
    let schemas = registry.schemas();
    let response = call_model(
        model,
        &[Message::human(prompt)],
        Some(schemas.as_slice()),
        config,
        cancel,
    )
    .await?;

    let (call, forced) = match response.tool_calls.into_iter().next() {
        Some(call) => (call, false),
        None => {
            warn!(tool = %failsafe.tool(), "Model forgot to call tool, forcing execution");
            (failsafe.synthesize(state)?, true)
        }
    };

    let output = match registry.invoke(&call, config, cancel).await {
        Err(OrchestrationError::Cancelled) => return Err(OrchestrationError::Cancelled),
        other => other,
    };

    Ok(SingleToolCall {
        call,
        forced,
        output,
    })
}
