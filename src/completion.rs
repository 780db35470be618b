//! Language-model completion client used by the chat agent loop.
//!
//! The model is an opaque collaborator behind [`CompletionModel`]; the default
//! implementation speaks the OpenAI-compatible `/chat/completions` shape with
//! function tools.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::{config::CompletionConfig, models::ToolDescriptor};

const MAX_ERROR_TEXT_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("completion endpoint returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("unreadable completion response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatMessage {
    System(String),
    User(String),
    Assistant {
        content: String,
        tool_calls: Vec<RequestedToolCall>,
    },
    Tool {
        call_id: String,
        content: String,
    },
}

impl ChatMessage {
    fn to_wire(&self) -> Value {
        match self {
            Self::System(content) => json!({ "role": "system", "content": content }),
            Self::User(content) => json!({ "role": "user", "content": content }),
            Self::Assistant {
                content,
                tool_calls,
            } if tool_calls.is_empty() => json!({ "role": "assistant", "content": content }),
            Self::Assistant {
                content,
                tool_calls,
            } => {
                let calls: Vec<Value> = tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": call.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
                let content = if content.is_empty() {
                    Value::Null
                } else {
                    json!(content)
                };
                json!({ "role": "assistant", "content": content, "tool_calls": calls })
            }
            Self::Tool { call_id, content } => {
                json!({ "role": "tool", "tool_call_id": call_id, "content": content })
            }
        }
    }
}

/// One model turn: text, and any tools it wants run before answering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionStep {
    pub text: String,
    pub tool_calls: Vec<RequestedToolCall>,
}

#[async_trait]
pub trait CompletionModel: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDescriptor],
    ) -> Result<CompletionStep, CompletionError>;
}

pub struct OpenAiCompatModel {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl OpenAiCompatModel {
    pub fn new(config: &CompletionConfig) -> Result<Self, CompletionError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(CompletionError::Transport)?;
        Ok(Self {
            endpoint: completions_endpoint(&config.url),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            http,
        })
    }
}

#[async_trait]
impl CompletionModel for OpenAiCompatModel {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDescriptor],
    ) -> Result<CompletionStep, CompletionError> {
        let mut body = json!({
            "model": self.model,
            "messages": messages.iter().map(ChatMessage::to_wire).collect::<Vec<_>>(),
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(function_tool).collect());
        }

        debug!(model = %self.model, messages = messages.len(), tools = tools.len(), "Requesting completion");
        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(CompletionError::Transport)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CompletionError::Status {
                status: status.as_u16(),
                message: text.trim().chars().take(MAX_ERROR_TEXT_CHARS).collect(),
            });
        }

        let payload: Value = response.json().await.map_err(CompletionError::Transport)?;
        parse_step(&payload)
    }
}

fn completions_endpoint(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    if trimmed.ends_with("/chat/completions") {
        return trimmed.to_string();
    }
    format!("{trimmed}/chat/completions")
}

fn function_tool(descriptor: &ToolDescriptor) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": descriptor.name,
            "description": descriptor.description,
            "parameters": descriptor.input_schema,
        }
    })
}

fn parse_step(payload: &Value) -> Result<CompletionStep, CompletionError> {
    let message = payload
        .pointer("/choices/0/message")
        .ok_or_else(|| CompletionError::Decode("missing choices[0].message".to_string()))?;

    let text = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .filter_map(|(idx, call)| {
                    let name = call.pointer("/function/name")?.as_str()?.to_string();
                    let id = call
                        .get("id")
                        .and_then(Value::as_str)
                        .map(ToString::to_string)
                        .unwrap_or_else(|| format!("call_{idx}"));
                    // Arguments arrive as a JSON-encoded string; unparseable text is
                    // passed through as null so argument validation reports it.
                    let arguments = match call.pointer("/function/arguments") {
                        Some(Value::String(raw)) if raw.trim().is_empty() => json!({}),
                        Some(Value::String(raw)) => serde_json::from_str(raw).unwrap_or(Value::Null),
                        Some(other) => other.clone(),
                        None => json!({}),
                    };
                    Some(RequestedToolCall {
                        id,
                        name,
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(CompletionStep { text, tool_calls })
}
