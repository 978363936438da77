//! Core data models for capabilities: conversation messages, tool calls and
//! tool argument schemas

use crate::error::OrchestrationError;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use uuid::Uuid;

//
// ================= Conversation =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    System {
        content: String,
    },
    Human {
        content: String,
    },
    Ai {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: String,
        name: String,
        content: String,
    },
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message::System {
            content: content.into(),
        }
    }

    pub fn human(content: impl Into<String>) -> Self {
        Message::Human {
            content: content.into(),
        }
    }

    pub fn ai(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Message::Ai {
            content: content.into(),
            tool_calls,
        }
    }

    pub fn tool(call: &ToolCall, content: impl Into<String>) -> Self {
        Message::Tool {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            content: content.into(),
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Message::System { content }
            | Message::Human { content }
            | Message::Ai { content, .. }
            | Message::Tool { content, .. } => content,
        }
    }

    /// Tool calls requested by an AI message; empty for every other role.
    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Message::Ai { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

//
// ================= Tool I/O =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: format!("call_{}", Uuid::new_v4().simple()),
            name: name.into(),
            arguments,
        }
    }
}

/// What a model capability returns for one turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelResponse {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_call(mut self, name: impl Into<String>, arguments: Value) -> Self {
        self.tool_calls.push(ToolCall::new(name, arguments));
        self
    }

    pub fn into_message(self) -> Message {
        Message::ai(self.content, self.tool_calls)
    }
}

//
// ================= Tool Schema =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
}

impl ParamType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolParam {
    pub name: String,
    pub param_type: ParamType,
    pub description: String,
    pub required: bool,
}

/// Declared argument schema of a tool, bound to the model on each call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParam>,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    pub fn param(mut self, name: &str, param_type: ParamType, description: &str) -> Self {
        self.parameters.push(ToolParam {
            name: name.to_string(),
            param_type,
            description: description.to_string(),
            required: true,
        });
        self
    }

    pub fn optional_param(mut self, name: &str, param_type: ParamType, description: &str) -> Self {
        self.parameters.push(ToolParam {
            name: name.to_string(),
            param_type,
            description: description.to_string(),
            required: false,
        });
        self
    }

    /// Check call arguments: a JSON object, every required parameter present
    /// and every known parameter of the declared type. Extra keys are ignored.
    pub fn validate_arguments(&self, arguments: &Value) -> Result<()> {
        let object = arguments.as_object().ok_or_else(|| {
            OrchestrationError::InvalidToolInput(format!(
                "{}: arguments must be a JSON object",
                self.name
            ))
        })?;

        for param in &self.parameters {
            match object.get(&param.name) {
                None | Some(Value::Null) if param.required => {
                    return Err(OrchestrationError::InvalidToolInput(format!(
                        "{}: missing required argument '{}'",
                        self.name, param.name
                    )));
                }
                Some(value) if !value.is_null() && !param.param_type.matches(value) => {
                    return Err(OrchestrationError::InvalidToolInput(format!(
                        "{}: argument '{}' must be {}",
                        self.name, param.name, param.param_type
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// JSON-schema rendering used in model function declarations.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for param in &self.parameters {
            properties.insert(
                param.name.clone(),
                json!({
                    "type": param.param_type.to_string(),
                    "description": param.description,
                }),
            );
        }

        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}
