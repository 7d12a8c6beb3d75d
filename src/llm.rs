//! Model SPI: the narrow turn contract the core consumes.
//!
//! A transport takes the conversation so far plus the tool schemas and
//! returns one [`ModelTurn`]: optional narration text and zero-or-one
//! tool-call intent. Transports must be idempotent-safe under retry; the
//! core never replays a completed turn.

pub mod anthropic;
pub mod mock;
pub mod subprocess;

pub use anthropic::AnthropicClient;
pub use mock::ScriptedModel;
pub use subprocess::SubprocessClient;

use crate::adapter::ToolSpec;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::time::Duration;

/// One tool-call intent from the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Why the transport stopped producing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Other,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One model turn: narration plus at most one tool call.
#[derive(Debug, Clone)]
pub struct ModelTurn {
    pub text_blocks: Vec<String>,
    pub tool_call: Option<ToolCall>,
    pub stop_reason: StopReason,
    pub usage: TokenUsage,
}

impl ModelTurn {
    pub fn text(&self) -> String {
        self.text_blocks.join("\n")
    }
}

/// Conversation message in transport-neutral form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User {
        text: String,
    },
    Assistant {
        text: String,
        tool_call: Option<ToolCall>,
    },
    ToolResult {
        call_id: String,
        text: String,
        is_error: bool,
    },
}

/// One turn request. `system` carries the assembled system prompt; `tools`
/// is empty for no-tool calls (critic, judge, reflection-only prompts).
#[derive(Debug, Clone)]
pub struct TurnRequest<'a> {
    pub model: &'a str,
    pub system: &'a str,
    pub messages: &'a [Message],
    pub tools: &'a [ToolSpec],
    pub max_tokens: u32,
}

/// Transport-level failure. Only these surface to the session caller.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http error: {0}")]
    Http(String),

    #[error("api status {code}: {body}")]
    Status { code: u16, body: String },

    #[error("transport timed out")]
    Timeout,

    #[error("unparseable model output: {0}")]
    Parse(String),

    #[error("subprocess error: {0}")]
    Process(String),
}

impl TransportError {
    /// Rate limits, server errors, network failures, and timeouts are worth
    /// retrying; schema/auth problems are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout => true,
            Self::Status { code, .. } => *code == 429 || *code >= 500,
            Self::Parse(_) | Self::Process(_) => false,
        }
    }
}

/// The model turn interface.
pub trait ModelClient: Send + Sync {
    fn turn(
        &self,
        request: TurnRequest<'_>,
    ) -> impl std::future::Future<Output = Result<ModelTurn, TransportError>> + Send;
}

/// Bounded-backoff retry wrapper around one turn.
///
/// Retries only retryable transport failures, sleeping `base_delay * 2^n`
/// between attempts. The final error propagates to the caller, which ends
/// the session with reason=transport.
pub async fn turn_with_retry<M: ModelClient>(
    client: &M,
    request: TurnRequest<'_>,
    max_retries: u32,
    base_delay: Duration,
) -> Result<ModelTurn, TransportError> {
    let mut attempt = 0u32;
    loop {
        match client.turn(request.clone()).await {
            Ok(turn) => return Ok(turn),
            Err(error) if error.is_retryable() && attempt < max_retries => {
                let delay = base_delay * 2u32.saturating_pow(attempt);
                tracing::warn!(%error, attempt, delay_ms = delay.as_millis() as u64, "model turn failed; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

/// Pull the first JSON object out of possibly fenced or chatty model output.
pub(crate) fn extract_json_object(raw: &str) -> Option<serde_json::Value> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    let unfenced = strip_code_fence(text);
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(unfenced) {
        if value.is_object() {
            return Some(value);
        }
    }
    scan_balanced(unfenced, '{', '}')
}

/// Pull the first JSON array out of possibly fenced or chatty model output.
pub(crate) fn extract_json_array(raw: &str) -> Option<serde_json::Value> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    let unfenced = strip_code_fence(text);
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(unfenced) {
        if value.is_array() {
            return Some(value);
        }
    }
    scan_balanced(unfenced, '[', ']')
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim();
        }
    }
    trimmed
}

/// Scan for the first balanced `open..close` span that parses. Tracks string
/// literals so braces inside quoted text don't end the span early.
fn scan_balanced(text: &str, open: char, close: char) -> Option<serde_json::Value> {
    let start = text.find(open)?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, character) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if character == '\\' {
                escaped = true;
            } else if character == '"' {
                in_string = false;
            }
            continue;
        }
        match character {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..start + offset + character.len_utf8()];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}
