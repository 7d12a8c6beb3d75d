//! HTTP messages-API transport.

use super::{
    Message, ModelClient, ModelTurn, StopReason, TokenUsage, ToolCall, TransportError, TurnRequest,
};

use serde_json::{json, Value};

use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Messages-API client. One instance serves executor, critic, and judge
/// calls; the model id travels with each request.
#[derive(Debug, Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("reqwest client builds"),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
        }
    }

    /// Point at a different endpoint (proxies, test servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn render_messages(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|message| match message {
                Message::User { text } => json!({
                    "role": "user",
                    "content": [{"type": "text", "text": text}],
                }),
                Message::Assistant { text, tool_call } => {
                    let mut content = Vec::new();
                    if !text.is_empty() {
                        content.push(json!({"type": "text", "text": text}));
                    }
                    if let Some(call) = tool_call {
                        content.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.name,
                            "input": call.input,
                        }));
                    }
                    if content.is_empty() {
                        content.push(json!({"type": "text", "text": ""}));
                    }
                    json!({"role": "assistant", "content": content})
                }
                Message::ToolResult {
                    call_id,
                    text,
                    is_error,
                } => json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": call_id,
                        "is_error": is_error,
                        "content": [{"type": "text", "text": text}],
                    }],
                }),
            })
            .collect()
    }

    fn parse_response(body: Value) -> Result<ModelTurn, TransportError> {
        let mut text_blocks = Vec::new();
        let mut tool_call = None;

        let content = body
            .get("content")
            .and_then(Value::as_array)
            .ok_or_else(|| TransportError::Parse("response missing content array".into()))?;
        for block in content {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        text_blocks.push(text.to_owned());
                    }
                }
                // The turn contract is zero-or-one tool call; keep the first.
                Some("tool_use") if tool_call.is_none() => {
                    tool_call = Some(ToolCall {
                        id: block
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_owned(),
                        name: block
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_owned(),
                        input: block.get("input").cloned().unwrap_or(Value::Null),
                    });
                }
                _ => {}
            }
        }

        let stop_reason = match body.get("stop_reason").and_then(Value::as_str) {
            Some("end_turn") => StopReason::EndTurn,
            Some("tool_use") => StopReason::ToolUse,
            Some("max_tokens") => StopReason::MaxTokens,
            _ => StopReason::Other,
        };
        let usage = TokenUsage {
            input_tokens: body
                .pointer("/usage/input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            output_tokens: body
                .pointer("/usage/output_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        };

        Ok(ModelTurn {
            text_blocks,
            tool_call,
            stop_reason,
            usage,
        })
    }
}

impl ModelClient for AnthropicClient {
    async fn turn(&self, request: TurnRequest<'_>) -> Result<ModelTurn, TransportError> {
        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": Self::render_messages(request.messages),
        });
        if !request.system.is_empty() {
            body["system"] = json!(request.system);
        }
        if !request.tools.is_empty() {
            body["tools"] = json!(request
                .tools
                .iter()
                .map(|tool| json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.input_schema,
                }))
                .collect::<Vec<_>>());
        }

        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Http(error.to_string())
                }
            })?;

        let status = response.status();
        let payload = response
            .text()
            .await
            .map_err(|error| TransportError::Http(error.to_string()))?;
        if !status.is_success() {
            return Err(TransportError::Status {
                code: status.as_u16(),
                body: payload.chars().take(600).collect(),
            });
        }

        let parsed: Value = serde_json::from_str(&payload)
            .map_err(|error| TransportError::Parse(error.to_string()))?;
        Self::parse_response(parsed)
    }
}
