//! LLM judge: independent pass/fail scoring of the final observable state.

use crate::learning::critic::TraceStep;
use crate::llm::{extract_json_object, Message, ModelClient, TransportError, TurnRequest};

use serde_json::Value;

/// Parsed judge verdict.
#[derive(Debug, Clone)]
pub struct JudgeVerdict {
    pub passed: bool,
    pub score: f64,
    pub reasons: Vec<String>,
}

/// Judge configuration: which model adjudicates and under which rubric.
#[derive(Debug, Clone)]
pub struct LlmJudge {
    model: String,
    domain_name: String,
    rubric: Option<String>,
}

const JUDGE_SYSTEM: &str = "\
You are a strict task evaluator for a self-improving agent system.\n\
Your job: judge whether the agent completed the assigned task correctly.\n\
Return STRICT JSON only:\n\
{\"passed\": true|false, \"score\": 0.0-1.0, \"reasons\": [\"specific reason\", ...]}\n\
Scoring guide:\n\
- 1.0: task fully completed, correct output\n\
- 0.75: mostly complete, minor issues\n\
- 0.5: partial completion, significant issues\n\
- 0.25: attempted but largely wrong\n\
- 0.0: did not complete or completely wrong\n\
Rules:\n\
- Each reason MUST reference concrete evidence: error messages, wrong output, or missing steps.\n\
- Judge against the TASK REQUIREMENTS, not style.\n\
- If the final state shows correct results, the task passes regardless of how many errors occurred along the way.\n";

impl LlmJudge {
    pub fn new(model: impl Into<String>, domain_name: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            domain_name: domain_name.into(),
            rubric: None,
        }
    }

    /// Attach a task-specific rubric paragraph.
    pub fn with_rubric(mut self, rubric: impl Into<String>) -> Self {
        self.rubric = Some(rubric.into());
        self
    }

    /// One judge call over the trace tail and captured final state.
    ///
    /// Transport and parse failures surface as errors so the referee can
    /// apply its fallback rules.
    pub async fn judge<M: ModelClient>(
        &self,
        client: &M,
        task_text: &str,
        trace_tail: &[TraceStep],
        final_state: &str,
    ) -> Result<JudgeVerdict, TransportError> {
        let mut system = format!("{JUDGE_SYSTEM}Domain: {}\n", self.domain_name);
        if let Some(rubric) = &self.rubric {
            system.push_str("Rubric:\n");
            system.push_str(rubric);
            system.push('\n');
        }

        let user = format!(
            "TASK:\n{task_text}\n\nEVENT LOG (last {} events):\n{}\n\nFINAL STATE:\n{final_state}\n",
            trace_tail.len(),
            serde_json::to_string_pretty(trace_tail).unwrap_or_else(|_| "[]".into()),
        );
        let messages = [Message::User { text: user }];
        let turn = client
            .turn(TurnRequest {
                model: &self.model,
                system: &system,
                messages: &messages,
                tools: &[],
                max_tokens: 600,
            })
            .await?;

        let raw = turn.text();
        let object = extract_json_object(&raw).ok_or_else(|| {
            TransportError::Parse(format!(
                "judge output had no JSON object: {}",
                raw.chars().take(300).collect::<String>()
            ))
        })?;
        Ok(Self::parse_verdict(&object))
    }

    fn parse_verdict(object: &Value) -> JudgeVerdict {
        let passed = object.get("passed").and_then(Value::as_bool).unwrap_or(false);
        let score = object
            .get("score")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);
        let reasons = object
            .get("reasons")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .filter(|reason| !reason.trim().is_empty())
                    .map(|reason| reason.chars().take(280).collect())
                    .take(6)
                    .collect()
            })
            .unwrap_or_default();
        JudgeVerdict {
            passed,
            score,
            reasons,
        }
    }
}
