//! Model capability: a chat model that may request tool calls
//!
//! `ScriptedModel` replays queued responses and records what it was asked,
//! which is what tests and offline runs use. `gemini::GeminiModel` talks to
//! the hosted API.

pub mod gemini;

use crate::capability::{call_with_timeout, CapabilityConfig};
use crate::error::OrchestrationError;
use crate::models::{Message, ModelResponse, ToolSchema};
use crate::Result;
use std::collections::VecDeque;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[async_trait::async_trait]
pub trait ModelCapability: Send + Sync {
    fn name(&self) -> &str;

    /// One model turn over the conversation so far. `tools` are the schemas
    /// the model may request calls for.
    async fn invoke(
        &self,
        conversation: &[Message],
        tools: Option<&[ToolSchema]>,
    ) -> Result<ModelResponse>;
}

/// Invoke `model` bounded by the capability timeout and the run's token.
pub async fn call_model(
    model: &dyn ModelCapability,
    conversation: &[Message],
    tools: Option<&[ToolSchema]>,
    config: &CapabilityConfig,
    cancel: &CancellationToken,
) -> Result<ModelResponse> {
    debug!(
        model = %model.name(),
        messages = conversation.len(),
        tools = tools.map(|t| t.len()).unwrap_or(0),
        "Invoking model"
    );
    call_with_timeout(model.name(), config, cancel, model.invoke(conversation, tools)).await
}

/// A recorded `ScriptedModel` call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub conversation: Vec<Message>,
    pub tools: Vec<String>,
}

/// Deterministic model that answers with queued responses in order.
pub struct ScriptedModel {
    name: String,
    responses: Mutex<VecDeque<Result<ModelResponse>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedModel {
    pub fn new(responses: impl IntoIterator<Item = ModelResponse>) -> Self {
        Self {
            name: "scripted".to_string(),
            responses: Mutex::new(responses.into_iter().map(Ok).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Queue a failing turn after the responses queued so far.
    pub async fn push_error(&self, message: impl Into<String>) {
        self.responses
            .lock()
            .await
            .push_back(Err(OrchestrationError::Capability(message.into())));
    }

    pub async fn push(&self, response: ModelResponse) {
        self.responses.lock().await.push_back(Ok(response));
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().await.clone()
    }

    pub async fn remaining(&self) -> usize {
        self.responses.lock().await.len()
    }
}

#[async_trait::async_trait]
impl ModelCapability for ScriptedModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        conversation: &[Message],
        tools: Option<&[ToolSchema]>,
    ) -> Result<ModelResponse> {
        self.calls.lock().await.push(RecordedCall {
            conversation: conversation.to_vec(),
            tools: tools
                .unwrap_or_default()
                .iter()
                .map(|t| t.name.clone())
                .collect(),
        });

        self.responses.lock().await.pop_front().unwrap_or_else(|| {
            Err(OrchestrationError::Capability(format!(
                "model '{}' has no scripted response left",
                self.name
            )))
        })
    }
}
