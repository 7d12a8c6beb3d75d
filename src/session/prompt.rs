//! System-prompt assembly and injection formatting.

use crate::learning::retriever::RetrievalMatch;

/// Build the session system prompt: domain instructions, active task id,
/// and the pre-run lessons block.
pub fn build_system_prompt(
    domain_fragment: &str,
    task_id: &str,
    lessons_block: &str,
) -> String {
    let mut prompt = String::new();
    prompt.push_str(domain_fragment);
    prompt.push_str(&format!("- Active task_id: {task_id}\n\n"));
    if lessons_block.is_empty() {
        prompt.push_str("No prior lessons loaded.\n");
    } else {
        prompt.push_str(lessons_block);
        prompt.push('\n');
    }
    prompt
}

/// Render the pre-run lessons block with ids visible for observability.
/// Returns the block and the injected ids; both empty when nothing matched.
pub fn format_lessons_block(matches: &[RetrievalMatch]) -> (String, Vec<String>) {
    if matches.is_empty() {
        return (String::new(), Vec::new());
    }
    let mut lines = vec!["Lessons from prior sessions (apply only when relevant):".to_owned()];
    let mut ids = Vec::with_capacity(matches.len());
    for matched in matches {
        ids.push(matched.lesson.id.clone());
        lines.push(format!(
            "- [{}] ({:.2}, {}) {}",
            matched.lesson.id, matched.score.total, matched.lane, matched.lesson.rule_text,
        ));
    }
    (lines.join("\n"), ids)
}

/// Render on-error hints appended to a failing tool result so the model
/// sees them on the next turn.
pub fn format_hint_block(hints: &[String]) -> String {
    if hints.is_empty() {
        return String::new();
    }
    let mut block = String::from("\n\n--- HINT from prior sessions ---\n");
    for hint in hints {
        block.push_str("- ");
        block.push_str(hint);
        block.push('\n');
    }
    block
}

/// Deterministic reflection request for stuck or error-heavy runs: diagnosis
/// plus the smallest corrective change, then back to tool use.
pub fn build_reflection_prompt(error_text: &str, fingerprint: &str, reason: &str) -> String {
    format!(
        "Reflection required before the next tool call.\n\
         Trigger: {reason}.\n\
         Last error: {}\n\
         Fingerprint: {fingerprint}\n\
         State what you have tried, why it failed, and what you will do \
         differently. Then proceed with the next tool call.",
        error_text.trim(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::retriever::{RetrievalLane, RetrievalScore};
    use crate::learning::types::{CandidateLesson, Lesson};

    fn sample_match() -> RetrievalMatch {
        let lesson = Lesson::from_candidate(
            &CandidateLesson {
                trigger_fingerprints: vec!["gridtool:keep".into()],
                rule_text: "operators are words; use gt, lt, eq".into(),
                scope_hint: Default::default(),
                tags: vec![],
            },
            1,
            "cli:gridtool",
            "task-1",
            vec![],
            false,
            chrono::Utc::now(),
        );
        RetrievalMatch {
            lesson,
            score: RetrievalScore {
                total: 0.62,
                fingerprint_match: 1.0,
                tag_overlap: 0.0,
                text_similarity: 0.1,
                reliability: 0.5,
                recency: 1.0,
            },
            lane: RetrievalLane::Strict,
        }
    }

    #[test]
    fn test_lessons_block_shows_ids() {
        let matched = sample_match();
        let id = matched.lesson.id.clone();
        let (block, ids) = format_lessons_block(&[matched]);
        assert!(block.contains(&id));
        assert!(block.contains("operators are words"));
        assert_eq!(ids, vec![id]);
    }

    #[test]
    fn test_empty_retrieval_produces_no_block() {
        let (block, ids) = format_lessons_block(&[]);
        assert!(block.is_empty());
        assert!(ids.is_empty());
        let prompt = build_system_prompt("domain\n", "task-1", &block);
        assert!(prompt.contains("No prior lessons loaded."));
        assert!(!prompt.contains("Lessons from prior sessions"));
    }

    #[test]
    fn test_hint_block_format() {
        let block = format_hint_block(&["use gt instead of >".into()]);
        assert!(block.contains("--- HINT from prior sessions ---"));
        assert!(block.contains("- use gt instead of >"));
        assert!(format_hint_block(&[]).is_empty());
    }

    #[test]
    fn test_reflection_prompt_carries_trigger() {
        let prompt = build_reflection_prompt("ERROR at line 1", "gridtool:keep", "repeat_fingerprint");
        assert!(prompt.contains("Trigger: repeat_fingerprint."));
        assert!(prompt.contains("gridtool:keep"));
    }
}
