//! Deterministic scripted transport for tests and offline demos.
//!
//! A `ScriptedModel` replays a fixed sequence of steps: replies (optionally
//! carrying one tool call) or injected transport failures. Once the script
//! is exhausted it ends the turn with no tool call, which the step loop
//! treats as the model stopping. Every request's rendered context is kept
//! so tests can assert on prompt contents (hint injection, reflection).

use super::{
    Message, ModelClient, ModelTurn, StopReason, TokenUsage, ToolCall, TransportError, TurnRequest,
};

use std::collections::VecDeque;
use std::sync::Mutex;

/// One scripted step.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    /// Narration plus an optional tool call.
    Reply {
        text: String,
        tool: Option<(String, serde_json::Value)>,
    },
    /// Transport failure with chosen retryability.
    Fail { message: String, retryable: bool },
}

impl ScriptedStep {
    pub fn tool_call(name: &str, input: serde_json::Value) -> Self {
        Self::Reply {
            text: String::new(),
            tool: Some((name.to_owned(), input)),
        }
    }

    pub fn text(text: &str) -> Self {
        Self::Reply {
            text: text.to_owned(),
            tool: None,
        }
    }

    pub fn fail(message: &str, retryable: bool) -> Self {
        Self::Fail {
            message: message.to_owned(),
            retryable,
        }
    }
}

/// Fixed-script model. Interior mutability keeps the SPI signature shared
/// with real transports.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    steps: Mutex<VecDeque<ScriptedStep>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// What the model saw for one turn, for assertions.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub system: String,
    pub last_message: String,
    pub message_count: usize,
}

impl ScriptedModel {
    pub fn new(steps: impl IntoIterator<Item = ScriptedStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every request observed so far, in order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("requests lock poisoned").clone()
    }

    pub fn remaining_steps(&self) -> usize {
        self.steps.lock().expect("steps lock poisoned").len()
    }

    fn record(&self, request: &TurnRequest<'_>) {
        let last_message = request
            .messages
            .last()
            .map(|message| match message {
                Message::User { text } => text.clone(),
                Message::Assistant { text, .. } => text.clone(),
                Message::ToolResult { text, .. } => text.clone(),
            })
            .unwrap_or_default();
        self.requests
            .lock()
            .expect("requests lock poisoned")
            .push(RecordedRequest {
                system: request.system.to_owned(),
                last_message,
                message_count: request.messages.len(),
            });
    }
}

impl ModelClient for ScriptedModel {
    async fn turn(&self, request: TurnRequest<'_>) -> Result<ModelTurn, TransportError> {
        self.record(&request);
        let step = self.steps.lock().expect("steps lock poisoned").pop_front();
        match step {
            Some(ScriptedStep::Reply { text, tool }) => {
                let tool_call = tool.map(|(name, input)| ToolCall {
                    id: format!("toolu_mock_{}", uuid::Uuid::new_v4().simple()),
                    name,
                    input,
                });
                let stop_reason = if tool_call.is_some() {
                    StopReason::ToolUse
                } else {
                    StopReason::EndTurn
                };
                Ok(ModelTurn {
                    text_blocks: if text.is_empty() { Vec::new() } else { vec![text] },
                    tool_call,
                    stop_reason,
                    usage: TokenUsage::default(),
                })
            }
            Some(ScriptedStep::Fail { message, retryable }) => {
                if retryable {
                    Err(TransportError::Http(message))
                } else {
                    Err(TransportError::Status {
                        code: 400,
                        body: message,
                    })
                }
            }
            None => Ok(ModelTurn {
                text_blocks: vec!["(script exhausted)".into()],
                tool_call: None,
                stop_reason: StopReason::EndTurn,
                usage: TokenUsage::default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(messages: &'a [Message]) -> TurnRequest<'a> {
        TurnRequest {
            model: "scripted",
            system: "system prompt",
            messages,
            tools: &[],
            max_tokens: 100,
        }
    }

    #[tokio::test]
    async fn test_replays_steps_in_order_then_stops() {
        let model = ScriptedModel::new([
            ScriptedStep::tool_call("run_gridtool", serde_json::json!({"script": "SHOW"})),
            ScriptedStep::text("done"),
        ]);
        let messages = vec![Message::User { text: "go".into() }];

        let first = model.turn(request(&messages)).await.unwrap();
        assert_eq!(first.tool_call.unwrap().name, "run_gridtool");

        let second = model.turn(request(&messages)).await.unwrap();
        assert!(second.tool_call.is_none());
        assert_eq!(second.text(), "done");

        let exhausted = model.turn(request(&messages)).await.unwrap();
        assert_eq!(exhausted.stop_reason, StopReason::EndTurn);
    }

    #[tokio::test]
    async fn test_records_requests_for_assertions() {
        let model = ScriptedModel::new([ScriptedStep::text("ok")]);
        let messages = vec![Message::User { text: "task text".into() }];
        model.turn(request(&messages)).await.unwrap();
        let seen = model.requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].system, "system prompt");
        assert_eq!(seen[0].last_message, "task text");
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let model = ScriptedModel::new([ScriptedStep::fail("boom", true)]);
        let messages = vec![Message::User { text: "go".into() }];
        let error = model.turn(request(&messages)).await.unwrap_err();
        assert!(error.is_retryable());
    }
}
