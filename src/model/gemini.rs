//! Gemini `generateContent` client as a model capability
//!
//! Uses a long-lived reqwest::Client for connection pooling. Tool schemas are
//! sent as function declarations and `functionCall` parts come back as
//! `ToolCall`s.

use super::ModelCapability;
use crate::error::OrchestrationError;
use crate::models::{Message, ModelResponse, ToolCall, ToolSchema};
use crate::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, info};

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

pub struct GeminiModel {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f32,
}

impl GeminiModel {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            base_url: GEMINI_BASE_URL.to_string(),
            temperature: 0.0,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn build_request(&self, conversation: &[Message], tools: Option<&[ToolSchema]>) -> GeminiRequest {
        let mut system_parts = Vec::new();
        let mut contents = Vec::new();

        for message in conversation {
            match message {
                Message::System { content } => system_parts.push(Part::text(content)),
                Message::Human { content } => contents.push(Content {
                    role: "user".to_string(),
                    parts: vec![Part::text(content)],
                }),
                Message::Ai {
                    content,
                    tool_calls,
                } => {
                    let mut parts = Vec::new();
                    if !content.is_empty() {
                        parts.push(Part::text(content));
                    }
                    parts.extend(tool_calls.iter().map(|call| Part {
                        function_call: Some(FunctionCall {
                            name: call.name.clone(),
                            args: call.arguments.clone(),
                        }),
                        ..Part::default()
                    }));
                    contents.push(Content {
                        role: "model".to_string(),
                        parts,
                    });
                }
                Message::Tool { name, content, .. } => contents.push(Content {
                    role: "user".to_string(),
                    parts: vec![Part {
                        function_response: Some(FunctionResponse {
                            name: name.clone(),
                            response: json!({ "content": content }),
                        }),
                        ..Part::default()
                    }],
                }),
            }
        }

        let tools = tools.filter(|t| !t.is_empty()).map(|schemas| {
            vec![ToolDeclarations {
                function_declarations: schemas
                    .iter()
                    .map(|schema| FunctionDeclaration {
                        name: schema.name.clone(),
                        description: schema.description.clone(),
                        parameters: (!schema.parameters.is_empty())
                            .then(|| schema.to_json_schema()),
                    })
                    .collect(),
            }]
        });

        GeminiRequest {
            contents,
            system_instruction: (!system_parts.is_empty()).then(|| SystemInstruction {
                parts: system_parts,
            }),
            tools,
            generation_config: GenerationConfig {
                temperature: self.temperature,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 2048,
            },
        }
    }
}

#[async_trait::async_trait]
impl ModelCapability for GeminiModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn invoke(
        &self,
        conversation: &[Message],
        tools: Option<&[ToolSchema]>,
    ) -> Result<ModelResponse> {
        if self.api_key.is_empty() {
            return Err(OrchestrationError::Capability(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let url = format!(
            "{}/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let request = self.build_request(conversation, tools);

        info!(model = %self.model, messages = conversation.len(), "Calling Gemini API");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                OrchestrationError::Capability(format!("Gemini API error: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, "Gemini API error response: {}", error_text);
            return Err(OrchestrationError::Capability(format!(
                "Gemini API returned {}: {}",
                status, error_text
            )));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            OrchestrationError::Capability(format!("Gemini parse error: {}", e))
        })?;

        let parsed = parse_response(gemini_response)?;
        info!(
            model = %self.model,
            tool_calls = parsed.tool_calls.len(),
            "Gemini response received"
        );
        Ok(parsed)
    }
}

fn parse_response(response: GeminiResponse) -> Result<ModelResponse> {
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| OrchestrationError::Capability("No response from Gemini API".to_string()))?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(chunk) = part.text {
            text.push_str(&chunk);
        }
        if let Some(call) = part.function_call {
            tool_calls.push(ToolCall::new(call.name, call.args));
        }
    }

    if text.is_empty() && tool_calls.is_empty() {
        return Err(OrchestrationError::Capability(format!(
            "Empty response from Gemini (finish reason: {})",
            candidate.finish_reason.as_deref().unwrap_or("unknown")
        )));
    }

    Ok(ModelResponse {
        content: text,
        tool_calls,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDeclarations>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    role: String,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

impl Part {
    fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolDeclarations {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}
