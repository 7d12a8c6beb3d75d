//! Per-session metrics artifact.
//!
//! Every operational error becomes a metrics field rather than a process
//! failure, so downstream reporting and the promoter's evidence window can
//! see them. The snapshot size at load (`v2_lessons_loaded`) is deliberately
//! distinct from what was actually injected (`v2_prerun_lesson_ids`,
//! `v2_lesson_activations`).

use crate::referee::{EvalSource, Verdict};
use crate::session::EndReason;

use serde::{Deserialize, Serialize};

use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub session_id: u64,
    pub task_id: String,
    pub task_cluster: String,
    pub domain: String,

    pub passed: bool,
    pub final_verdict: Verdict,
    pub score: f64,
    pub eval_source: EvalSource,
    pub eval_reasons: Vec<String>,
    pub eval_disagreement: bool,
    pub contract_passed: Option<bool>,
    pub judge_passed: Option<bool>,

    pub steps: u32,
    pub tool_actions: u32,
    pub tool_errors: u32,
    pub end_reason: EndReason,

    /// Store snapshot size observed at session load.
    pub v2_lessons_loaded: usize,
    /// Lesson ids injected into the pre-run prompt block.
    pub v2_prerun_lesson_ids: Vec<String>,
    /// Lessons shown to the model: pre-run injections plus on-error hints.
    pub v2_lesson_activations: u32,
    pub v2_transfer_lane_activations: u32,
    pub v2_error_events: u32,
    /// Fraction of failing steps whose fingerprint appeared in prior sessions.
    pub fingerprint_recurrence_before: f64,
    /// Fraction of failing steps whose fingerprint recurred after a hint
    /// injection for that fingerprint within this session.
    pub fingerprint_recurrence_after: f64,

    pub validation_retry_attempts: u32,
    pub validation_retry_capped_events: u32,
    pub reflection_turns: u32,

    pub critic_raw_candidates: usize,
    pub critic_accepted_candidates: usize,
    pub critic_rejected_candidates: Vec<String>,
    pub v2_lessons_generated: usize,
    pub v2_lessons_merged: usize,
    pub v2_promoted: usize,
    pub v2_suppressed: usize,
    pub v2_archived: usize,

    pub store_degraded: bool,
    pub elapsed_s: f64,
}

impl SessionMetrics {
    pub fn new(session_id: u64, task_id: &str, domain: &str) -> Self {
        Self {
            session_id,
            task_id: task_id.to_owned(),
            // Cluster key starts as the task id; see promoter evidence window.
            task_cluster: task_id.to_owned(),
            domain: domain.to_owned(),
            passed: false,
            final_verdict: Verdict::Fail,
            score: 0.0,
            eval_source: EvalSource::None,
            eval_reasons: Vec::new(),
            eval_disagreement: false,
            contract_passed: None,
            judge_passed: None,
            steps: 0,
            tool_actions: 0,
            tool_errors: 0,
            end_reason: EndReason::ModelStopped,
            v2_lessons_loaded: 0,
            v2_prerun_lesson_ids: Vec::new(),
            v2_lesson_activations: 0,
            v2_transfer_lane_activations: 0,
            v2_error_events: 0,
            fingerprint_recurrence_before: 0.0,
            fingerprint_recurrence_after: 0.0,
            validation_retry_attempts: 0,
            validation_retry_capped_events: 0,
            reflection_turns: 0,
            critic_raw_candidates: 0,
            critic_accepted_candidates: 0,
            critic_rejected_candidates: Vec::new(),
            v2_lessons_generated: 0,
            v2_lessons_merged: 0,
            v2_promoted: 0,
            v2_suppressed: 0,
            v2_archived: 0,
            store_degraded: false,
            elapsed_s: 0.0,
        }
    }

    /// Write the metrics artifact. Always called, even for failed sessions.
    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let rendered = serde_json::to_string_pretty(self)
            .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidData, error))?;
        std::fs::write(path, rendered)
    }

    /// Load a prior session's metrics, if readable.
    pub fn load(path: &Path) -> Option<Self> {
        let text = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&text).ok()
    }
}

/// Recent evaluation scores for the promoter's referee-gain baseline.
///
/// Evidence window: same domain first; when fewer than `min_window` exist,
/// widen to task-cluster neighbors so rarely-used domains are not starved.
pub fn recent_scores(
    sessions_root: &Path,
    domain: &str,
    task_cluster: &str,
    exclude_session: u64,
    min_window: usize,
    limit: usize,
) -> Vec<f64> {
    let Ok(entries) = std::fs::read_dir(sessions_root) else {
        return Vec::new();
    };
    let mut all: Vec<SessionMetrics> = entries
        .flatten()
        .map(|entry| entry.path().join("metrics.json"))
        .filter_map(|path| SessionMetrics::load(&path))
        .filter(|metrics| metrics.session_id != exclude_session)
        .collect();
    all.sort_by_key(|metrics| std::cmp::Reverse(metrics.session_id));

    let mut scores: Vec<f64> = all
        .iter()
        .filter(|metrics| metrics.domain == domain)
        .take(limit)
        .map(|metrics| metrics.score)
        .collect();
    if scores.len() < min_window {
        scores.extend(
            all.iter()
                .filter(|metrics| metrics.domain != domain && metrics.task_cluster == task_cluster)
                .take(limit - scores.len().min(limit))
                .map(|metrics| metrics.score),
        );
    }
    scores
}
