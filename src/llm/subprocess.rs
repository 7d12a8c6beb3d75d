//! CLI-subprocess transport.
//!
//! Shells out to a `claude -p`-style binary: the conversation and tool
//! schemas are rendered into one prompt, and the reply must be a single
//! strict-JSON object `{"assistant_text": "...", "tool_calls": [...]}`.
//! Useful where no API credentials exist but a local agent CLI does.

use super::{
    extract_json_object, Message, ModelClient, ModelTurn, StopReason, TokenUsage, ToolCall,
    TransportError, TurnRequest,
};

use serde_json::Value;
use tokio::process::Command;

use std::process::Stdio;
use std::time::Duration;

/// Runs one model turn per subprocess invocation.
#[derive(Debug, Clone)]
pub struct SubprocessClient {
    program: String,
    timeout: Duration,
}

impl SubprocessClient {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    /// Flatten block history into compact text. Only the recent tail is
    /// included so each turn does not become a huge prompt.
    fn render_history(messages: &[Message]) -> String {
        let tail_start = messages.len().saturating_sub(20);
        let mut lines: Vec<String> = Vec::new();
        for message in &messages[tail_start..] {
            match message {
                Message::User { text } => lines.push(format!("USER: {text}")),
                Message::Assistant { text, tool_call } => {
                    if !text.is_empty() {
                        lines.push(format!("ASSISTANT: {text}"));
                    }
                    if let Some(call) = tool_call {
                        lines.push(format!("TOOL_USE {}: {}", call.name, call.input));
                    }
                }
                Message::ToolResult {
                    call_id,
                    text,
                    is_error,
                } => lines.push(format!("TOOL_RESULT {call_id} error={is_error}: {text}")),
            }
        }
        lines.join("\n")
    }

    fn build_prompt(request: &TurnRequest<'_>) -> String {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                serde_json::json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.input_schema,
                })
            })
            .collect();
        format!(
            "You are the planner for a tool-using loop.\n\
             Return exactly one JSON object with this shape:\n\
             {{\n  \"assistant_text\": \"short reasoning\",\n  \"tool_calls\": [{{\"name\":\"tool_name\",\"input\":{{...}}}}]\n}}\n\
             Rules:\n\
             - Use ONLY tools listed below.\n\
             - At most one tool call; tool_calls may be empty if the task is done.\n\
             - input must match the tool input_schema.\n\
             - Do not wrap JSON in markdown.\n\n\
             SYSTEM_PROMPT:\n{}\n\n\
             TOOLS:\n{}\n\n\
             MESSAGE_HISTORY:\n{}\n",
            request.system,
            serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".into()),
            Self::render_history(request.messages),
        )
    }

    fn parse_payload(
        payload: &Value,
        allowed_tools: &[&str],
    ) -> Result<ModelTurn, TransportError> {
        let text = payload
            .get("assistant_text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let calls = match payload.get("tool_calls") {
            None | Some(Value::Null) => &[] as &[Value],
            Some(Value::Array(calls)) => calls.as_slice(),
            Some(other) => {
                return Err(TransportError::Parse(format!(
                    "tool_calls must be a list, got {other}"
                )))
            }
        };

        let mut tool_call = None;
        if let Some(call) = calls.first() {
            let name = call
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| TransportError::Parse("tool call missing name".into()))?;
            if !allowed_tools.contains(&name) {
                return Err(TransportError::Parse(format!(
                    "unknown tool {name:?}; allowed: {allowed_tools:?}"
                )));
            }
            tool_call = Some(ToolCall {
                id: format!("toolu_cli_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]),
                name: name.to_owned(),
                input: call.get("input").cloned().unwrap_or(Value::Null),
            });
        }

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
}

impl ModelClient for SubprocessClient {
    async fn turn(&self, request: TurnRequest<'_>) -> Result<ModelTurn, TransportError> {
        let prompt = Self::build_prompt(&request);
        let mut command = Command::new(&self.program);
        command
            .arg("-p")
            .arg(&prompt)
            .arg("--output-format")
            .arg("text")
            .arg("--model")
            .arg(request.model)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|error| TransportError::Process(format!("spawn failed: {error}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(TransportError::Process(format!(
                "exit code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.chars().take(600).collect::<String>(),
            )));
        }

        let payload = extract_json_object(&stdout).ok_or_else(|| {
            TransportError::Parse(format!(
                "no JSON object in output: {}",
                stdout.chars().take(400).collect::<String>()
            ))
        })?;
        let allowed: Vec<&str> = request.tools.iter().map(|tool| tool.name.as_str()).collect();
        Self::parse_payload(&payload, &allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_payload_with_tool_call() {
        let payload = serde_json::json!({
            "assistant_text": "loading the fixture",
            "tool_calls": [{"name": "run_gridtool", "input": {"script": "SHOW"}}],
        });
        let turn = SubprocessClient::parse_payload(&payload, &["run_gridtool"]).unwrap();
        assert_eq!(turn.text(), "loading the fixture");
        assert_eq!(turn.tool_call.unwrap().name, "run_gridtool");
        assert_eq!(turn.stop_reason, StopReason::ToolUse);
    }

    #[test]
    fn test_parse_payload_rejects_unknown_tool() {
        let payload = serde_json::json!({
            "tool_calls": [{"name": "rm_rf", "input": {}}],
        });
        let error = SubprocessClient::parse_payload(&payload, &["run_gridtool"]).unwrap_err();
        assert!(matches!(error, TransportError::Parse(_)));
    }

    #[test]
    fn test_parse_payload_empty_calls_ends_turn() {
        let payload = serde_json::json!({"assistant_text": "done", "tool_calls": []});
        let turn = SubprocessClient::parse_payload(&payload, &[]).unwrap();
        assert!(turn.tool_call.is_none());
        assert_eq!(turn.stop_reason, StopReason::EndTurn);
    }

    #[test]
    fn test_history_rendering_includes_tool_results() {
        let rendered = SubprocessClient::render_history(&[
            Message::User { text: "task".into() },
            Message::ToolResult {
                call_id: "toolu_1".into(),
                text: "ERROR at line 1".into(),
                is_error: true,
            },
        ]);
        assert!(rendered.contains("USER: task"));
        assert!(rendered.contains("TOOL_RESULT toolu_1 error=true"));
    }
}
