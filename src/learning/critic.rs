//! Post-run critic: turns a session trace into candidate lessons.
//!
//! The critic asks the model for a strict JSON array of candidates, then
//! runs every item through a quality filter before anything reaches the
//! store. The filter is the defense against lesson poisoning: generic
//! advice, known-wrong claims about the tools, and candidates whose
//! triggers never appeared in the session are all rejected.

use super::types::CandidateLesson;
use crate::config::LearningMode;
use crate::llm::{extract_json_array, Message, ModelClient, TurnRequest};

use regex::Regex;
use serde_json::json;

use std::sync::LazyLock;

/// Compact view of one executed step, fed to the critic prompt.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TraceStep {
    pub step: u32,
    pub tool: String,
    pub input_summary: String,
    pub ok: bool,
    pub error: Option<String>,
}

/// Everything the critic needs from a finished session.
#[derive(Debug, Clone)]
pub struct CriticInput<'a> {
    pub task_text: &'a str,
    /// e.g. "fail (score 0.25): insufficient_rows".
    pub verdict_summary: String,
    pub trace_tail: &'a [TraceStep],
    /// Fingerprints that actually fired this session; candidates must
    /// reference at least one of them.
    pub session_fingerprints: &'a [String],
    /// Strict-mode knowledge-provider chunks; empty in legacy mode.
    pub context: String,
}

/// What one critic pass produced.
#[derive(Debug, Clone, Default)]
pub struct CriticReport {
    pub accepted: Vec<CandidateLesson>,
    /// Rejected candidates with the filter reason, for metrics.
    pub rejected: Vec<(CandidateLesson, String)>,
    pub raw_count: usize,
}

const MAX_RULE_CHARS: usize = 160;
const MAX_CANDIDATES: usize = 4;

static GENERIC_PHRASES: &[&str] = &[
    "be careful",
    "be more careful",
    "read the docs",
    "read the documentation",
    "double-check",
    "double check",
    "pay attention",
    "make sure",
    "remember to",
    "try harder",
];

/// Known-wrong claims about the tool surface. A critic that hallucinates
/// one of these would poison the store with advice the tools reject.
static KNOWN_WRONG_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // Aggregations never take a wildcard argument.
        r"(?i)(?:supports?|use|allows?|accepts?)\s+(?:the\s+)?wildcard",
        r"(?i)\b(?:sum|count|avg|min|max)\s*\(\s*\*\s*\)",
        // Symbol operators are rejected by every bundled DSL.
        r"(?i)symbol operators?\s+(?:are|work|can|is)\b",
        r"(?i)use\s+[<>!=]=?\s+instead of\s+(?:gt|lt|eq|above|below|is)\b",
        // Function names are lowercase-only.
        r"(?i)functions?\s+(?:are|can be|may be)\s+uppercase",
        // Paths are always quoted.
        r"(?i)paths?\s+(?:don'?t|do not|never)\s+need\s+(?:to be\s+)?quot",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("hardcoded regex"))
    .collect()
});

/// Pre-store gate over critic output.
#[derive(Debug, Clone, Default)]
pub struct QualityFilter;

impl QualityFilter {
    /// Validate one candidate. Returns the cleaned candidate or the
    /// rejection reason. Triggers that never fired are dropped; a candidate
    /// with no surviving trigger is rejected.
    pub fn check(
        &self,
        mut candidate: CandidateLesson,
        session_fingerprints: &[String],
    ) -> Result<CandidateLesson, (CandidateLesson, String)> {
        let rule = candidate.rule_text.trim();
        if rule.len() < 15 {
            return Err((candidate.clone(), "rule_too_short".into()));
        }
        let lowered = rule.to_lowercase();
        if GENERIC_PHRASES.iter().any(|phrase| lowered.contains(phrase)) {
            return Err((candidate.clone(), "generic_rule".into()));
        }
        if KNOWN_WRONG_PATTERNS.iter().any(|pattern| pattern.is_match(rule)) {
            return Err((candidate.clone(), "known_wrong_pattern".into()));
        }

        candidate.trigger_fingerprints.retain(|trigger| {
            let trigger = trigger.trim();
            !trigger.is_empty()
                && session_fingerprints.iter().any(|fingerprint| {
                    fingerprint == trigger
                        || fingerprint.starts_with(trigger)
                        || trigger.starts_with(fingerprint.as_str())
                })
        });
        if candidate.trigger_fingerprints.is_empty() {
            return Err((candidate, "triggers_not_in_session".into()));
        }

        if candidate.rule_text.len() > MAX_RULE_CHARS {
            crate::learning::types::truncate_at_boundary(&mut candidate.rule_text, MAX_RULE_CHARS);
            if let Some(cut) = candidate.rule_text.rfind(' ') {
                candidate.rule_text.truncate(cut);
            }
        }
        Ok(candidate)
    }
}

/// Model-backed candidate generator.
#[derive(Debug, Clone)]
pub struct Critic {
    model: String,
    mode: LearningMode,
    filter: QualityFilter,
}

impl Critic {
    /// `Auto` is resolved by the session runner before the critic runs;
    /// an unresolved `Auto` here falls back to the strict prompt path.
    pub fn new(model: impl Into<String>, mode: LearningMode) -> Self {
        let mode = match mode {
            LearningMode::Auto => LearningMode::Strict,
            resolved => resolved,
        };
        Self {
            model: model.into(),
            mode,
            filter: QualityFilter,
        }
    }

    fn system_prompt(&self) -> String {
        let mut prompt = String::from(
            "You are a post-run learning critic for a tool-using agent.\n\
             Return a STRICT JSON array only. Each item:\n\
             {\"trigger_fingerprints\":[\"...\"],\"rule_text\":\"WRONG X -> CORRECT Y\",\
             \"scope_hint\":\"task|domain|global\",\"tags\":[\"...\"]}\n\
             Rules:\n\
             - Be specific and concise; rule_text under 160 characters.\n\
             - trigger_fingerprints must be copied from the FINGERPRINTS list.\n\
             - No generic advice.\n\
             - 1 to 4 lessons total; return [] when nothing durable was learned.\n",
        );
        match self.mode {
            LearningMode::Strict | LearningMode::Auto => {
                prompt.push_str(
                    "- Ground every rule in the CONTEXT excerpts; do not invent tool syntax.\n",
                );
            }
            LearningMode::Legacy => {
                prompt.push_str(
                    "Example: {\"trigger_fingerprints\":[\"gridtool:keep requires word operator\"],\
                     \"rule_text\":\"WRONG symbol operators like > -> CORRECT word operators gt, lt, eq\",\
                     \"scope_hint\":\"domain\",\"tags\":[\"operator_mismatch\"]}\n",
                );
            }
        }
        prompt
    }

    fn user_prompt(&self, input: &CriticInput<'_>) -> String {
        let mut prompt = format!(
            "TASK:\n{}\n\nVERDICT:\n{}\n\nEVENTS_TAIL:\n{}\n\nFINGERPRINTS:\n{}\n",
            input.task_text,
            input.verdict_summary,
            serde_json::to_string(&json!(input.trace_tail)).unwrap_or_else(|_| "[]".into()),
            serde_json::to_string(input.session_fingerprints).unwrap_or_else(|_| "[]".into()),
        );
        if !input.context.is_empty() {
            prompt.push_str("\nCONTEXT:\n");
            prompt.push_str(&input.context);
            prompt.push('\n');
        }
        prompt
    }

    /// Ask the model for candidates and run the quality filter.
    ///
    /// Transport or parse failures yield an empty report: the critic is
    /// best-effort and must never fail a session.
    pub async fn generate<M: ModelClient>(
        &self,
        client: &M,
        input: &CriticInput<'_>,
    ) -> CriticReport {
        let system = self.system_prompt();
        let user = self.user_prompt(input);
        let messages = [Message::User { text: user }];
        let request = TurnRequest {
            model: &self.model,
            system: &system,
            messages: &messages,
            tools: &[],
            max_tokens: 700,
        };

        let raw = match client.turn(request).await {
            Ok(turn) => turn.text(),
            Err(error) => {
                tracing::warn!(%error, "critic model call failed; no candidates this session");
                return CriticReport::default();
            }
        };

        let Some(array) = extract_json_array(&raw) else {
            tracing::warn!("critic output had no JSON array; no candidates this session");
            return CriticReport::default();
        };
        let items = array.as_array().cloned().unwrap_or_default();

        let mut report = CriticReport::default();
        for item in items.into_iter().take(MAX_CANDIDATES) {
            let Ok(candidate) = serde_json::from_value::<CandidateLesson>(item) else {
                continue;
            };
            report.raw_count += 1;
            match self.filter.check(candidate, input.session_fingerprints) {
                Ok(accepted) => report.accepted.push(accepted),
                Err(rejected) => report.rejected.push(rejected),
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::types::ScopeHint;
    use crate::llm::mock::{ScriptedModel, ScriptedStep};

    fn candidate(rule: &str, triggers: &[&str]) -> CandidateLesson {
        CandidateLesson {
            trigger_fingerprints: triggers.iter().map(|t| t.to_string()).collect(),
            rule_text: rule.into(),
            scope_hint: ScopeHint::Domain,
            tags: vec![],
        }
    }

    fn session_fps() -> Vec<String> {
        vec!["gridtool:keep requires word operator eq neq gt lt gte lte got".into()]
    }

    #[test]
    fn test_filter_rejects_generic_rules() {
        let filter = QualityFilter;
        let result = filter.check(
            candidate("be careful with the tool syntax", &["gridtool:keep requires word operator"]),
            &session_fps(),
        );
        assert_eq!(result.unwrap_err().1, "generic_rule");
    }

    #[test]
    fn test_filter_rejects_known_wrong_wildcard_claim() {
        let filter = QualityFilter;
        let result = filter.check(
            candidate(
                "aggregation supports wildcard * so use count(*) for row counts",
                &["gridtool:keep requires word operator"],
            ),
            &session_fps(),
        );
        assert_eq!(result.unwrap_err().1, "known_wrong_pattern");
    }

    #[test]
    fn test_filter_rejects_unseen_triggers() {
        let filter = QualityFilter;
        let result = filter.check(
            candidate("operators are words; use gt, lt, eq", &["fluxtool:something else"]),
            &session_fps(),
        );
        assert_eq!(result.unwrap_err().1, "triggers_not_in_session");
    }

    #[test]
    fn test_filter_accepts_prefix_trigger_and_clips_length() {
        let filter = QualityFilter;
        let long_tail = "use gt lt eq instead of symbols ".repeat(10);
        let result = filter
            .check(
                candidate(&long_tail, &["gridtool:keep requires word operator"]),
                &session_fps(),
            )
            .unwrap();
        assert!(result.rule_text.len() <= MAX_RULE_CHARS);
        assert_eq!(result.trigger_fingerprints.len(), 1);
    }

    #[tokio::test]
    async fn test_generate_parses_and_filters() {
        let reply = r#"[
            {"trigger_fingerprints":["gridtool:keep requires word operator"],
             "rule_text":"WRONG symbol operators like > -> CORRECT word operators gt, lt, eq",
             "scope_hint":"domain","tags":["operator_mismatch"]},
            {"trigger_fingerprints":["gridtool:keep requires word operator"],
             "rule_text":"be careful","scope_hint":"task","tags":[]}
        ]"#;
        let model = ScriptedModel::new([ScriptedStep::text(reply)]);
        let critic = Critic::new("critic-model", LearningMode::Legacy);
        let fps = session_fps();
        let input = CriticInput {
            task_text: "filter rows",
            verdict_summary: "fail (score 0.0)".into(),
            trace_tail: &[],
            session_fingerprints: &fps,
            context: String::new(),
        };
        let report = critic.generate(&model, &input).await;
        assert_eq!(report.raw_count, 2);
        assert_eq!(report.accepted.len(), 1);
        assert_eq!(report.rejected.len(), 1);
        assert!(report.accepted[0].rule_text.contains("word operators"));
    }

    #[tokio::test]
    async fn test_generate_survives_transport_failure() {
        let model = ScriptedModel::new([ScriptedStep::fail("down", false)]);
        let critic = Critic::new("critic-model", LearningMode::Strict);
        let fps = session_fps();
        let input = CriticInput {
            task_text: "filter rows",
            verdict_summary: "fail".into(),
            trace_tail: &[],
            session_fingerprints: &fps,
            context: String::new(),
        };
        let report = critic.generate(&model, &input).await;
        assert!(report.accepted.is_empty());
        assert_eq!(report.raw_count, 0);
    }

    #[tokio::test]
    async fn test_generate_handles_chatty_output() {
        let reply = "Here are the lessons:\n```json\n[{\"trigger_fingerprints\":[\"gridtool:keep requires word operator\"],\"rule_text\":\"WRONG > symbol -> CORRECT gt word operator in KEEP filters\",\"scope_hint\":\"domain\"}]\n```";
        let model = ScriptedModel::new([ScriptedStep::text(reply)]);
        let critic = Critic::new("critic-model", LearningMode::Legacy);
        let fps = session_fps();
        let input = CriticInput {
            task_text: "filter rows",
            verdict_summary: "fail".into(),
            trace_tail: &[],
            session_fingerprints: &fps,
            context: String::new(),
        };
        let report = critic.generate(&model, &input).await;
        assert_eq!(report.accepted.len(), 1);
    }
}
