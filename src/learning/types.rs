//! Lesson records and the candidate shape the critic emits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use std::collections::BTreeSet;

/// Lesson lifecycle status.
///
/// Archived is terminal; nothing is hard-deleted by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonStatus {
    Candidate,
    Promoted,
    Suppressed,
    Archived,
}

impl LessonStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Archived)
    }

    /// Suppressed and archived lessons never appear in retrieval results.
    pub fn is_retrievable(&self) -> bool {
        matches!(self, Self::Candidate | Self::Promoted)
    }
}

impl std::fmt::Display for LessonStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Candidate => write!(f, "candidate"),
            Self::Promoted => write!(f, "promoted"),
            Self::Suppressed => write!(f, "suppressed"),
            Self::Archived => write!(f, "archived"),
        }
    }
}

impl std::str::FromStr for LessonStatus {
    type Err = anyhow::Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text {
            "candidate" => Ok(Self::Candidate),
            "promoted" => Ok(Self::Promoted),
            "suppressed" => Ok(Self::Suppressed),
            "archived" => Ok(Self::Archived),
            other => Err(anyhow::anyhow!("unknown lesson status: {other}")),
        }
    }
}

/// How broadly the critic believes a lesson applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScopeHint {
    Task,
    #[default]
    Domain,
    Global,
}

/// Current on-disk encoding version for lesson rows.
pub const LESSON_SCHEMA_VERSION: u32 = 1;

const MAX_RULE_TEXT_CHARS: usize = 420;

/// A persisted lesson: a short natural-language rule with its triggering
/// fingerprints, lifecycle counters, and conflict links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lesson {
    /// Stable identity derived from normalized rule text + trigger set.
    pub id: String,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub status: LessonStatus,
    /// Typically "WRONG X → CORRECT Y" form.
    pub rule_text: String,
    pub trigger_fingerprints: Vec<String>,
    /// Trusted tags produced by the fingerprinter.
    pub tags: Vec<String>,
    /// Advisory tags proposed by the critic model.
    #[serde(default)]
    pub model_tags: Vec<String>,
    /// Execution tool family + adapter name; strict-lane scope.
    pub domain_key: String,
    /// Coarse grouping of related tasks. Currently the task id.
    #[serde(default)]
    pub task_cluster: String,
    pub source_session_ids: Vec<u64>,
    pub retrieval_count: u32,
    pub helpful_count: u32,
    pub harmful_count: u32,
    /// Recent per-activation utilities, newest last.
    #[serde(default)]
    pub utility_history: Vec<f64>,
    #[serde(default)]
    pub major_regressions: u32,
    /// Conflict losses keyed by opposing lesson id.
    #[serde(default)]
    pub conflict_losses: Vec<(String, u32)>,
    /// Symmetric links to lessons recommending incompatible fixes.
    #[serde(default)]
    pub conflicts_with: Vec<String>,
    /// Set when the lesson came from an uncertain-verdict session; cleared
    /// once the same lesson re-emerges from a different session.
    #[serde(default)]
    pub promotion_blocked: bool,
    #[serde(default)]
    pub archived_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_schema_version() -> u32 {
    LESSON_SCHEMA_VERSION
}

/// Lowercase alphanumeric word tokens minus a small stop-word list.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    const STOP_WORDS: &[&str] = &[
        "the", "a", "an", "is", "are", "was", "were", "be", "been", "have", "has", "had", "do",
        "does", "did", "will", "would", "could", "it", "its", "of", "in", "to", "for", "on", "at",
        "by", "with", "from", "this", "that", "and", "or", "but",
    ];
    text.to_lowercase()
        .split(|character: char| !character.is_alphanumeric())
        .filter(|token| !token.is_empty() && !STOP_WORDS.contains(token))
        .map(String::from)
        .collect()
}

/// Jaccard similarity over word tokens. Zero when either side is empty.
pub fn text_jaccard(text_a: &str, text_b: &str) -> f64 {
    let tokens_a = tokenize(text_a);
    let tokens_b = tokenize(text_b);
    let intersection = tokens_a.intersection(&tokens_b).count();
    let union = tokens_a.union(&tokens_b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

fn normalize_rule_text(rule_text: &str) -> String {
    let tokens: Vec<String> = tokenize(rule_text).into_iter().collect();
    tokens.join(" ")
}

/// Truncate in place without splitting a UTF-8 character.
pub(crate) fn truncate_at_boundary(text: &mut String, max_bytes: usize) {
    if text.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

/// Stable id from semantic identity, not run-local metadata, so re-emergence
/// of the same rule in a later session maps onto the same record.
pub fn stable_lesson_id(rule_text: &str, trigger_fingerprints: &[String]) -> String {
    let mut fingerprints: Vec<&str> =
        trigger_fingerprints.iter().map(String::as_str).collect();
    fingerprints.sort_unstable();
    fingerprints.dedup();
    let key = format!("{}|{}", normalize_rule_text(rule_text), fingerprints.join(","));
    let digest = Sha256::digest(key.as_bytes());
    format!("lsn_{}", &hex::encode(digest)[..20])
}

impl Lesson {
    /// Build a fresh candidate from critic output.
    pub fn from_candidate(
        candidate: &CandidateLesson,
        session_id: u64,
        domain_key: &str,
        task_cluster: &str,
        system_tags: Vec<String>,
        promotion_blocked: bool,
        now: DateTime<Utc>,
    ) -> Self {
        let mut triggers: Vec<String> = candidate
            .trigger_fingerprints
            .iter()
            .map(|fingerprint| fingerprint.trim().to_owned())
            .filter(|fingerprint| !fingerprint.is_empty())
            .collect();
        triggers.sort_unstable();
        triggers.dedup();

        let mut rule_text: String =
            candidate.rule_text.split_whitespace().collect::<Vec<_>>().join(" ");
        truncate_at_boundary(&mut rule_text, MAX_RULE_TEXT_CHARS);

        Self {
            id: stable_lesson_id(&rule_text, &triggers),
            schema_version: LESSON_SCHEMA_VERSION,
            status: LessonStatus::Candidate,
            rule_text,
            trigger_fingerprints: triggers,
            tags: system_tags,
            model_tags: candidate.tags.clone(),
            domain_key: domain_key.to_owned(),
            task_cluster: task_cluster.to_owned(),
            source_session_ids: vec![session_id],
            retrieval_count: 0,
            helpful_count: 0,
            harmful_count: 0,
            utility_history: Vec::new(),
            major_regressions: 0,
            conflict_losses: Vec::new(),
            conflicts_with: Vec::new(),
            promotion_blocked,
            archived_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Laplace-smoothed reliability from outcome counters.
    pub fn reliability(&self) -> f64 {
        (self.helpful_count as f64 + 1.0)
            / (self.helpful_count as f64 + self.harmful_count as f64 + 2.0)
    }

    /// Trigger sets are kept sorted, so equality is set equality.
    pub fn same_trigger_set(&self, other: &Self) -> bool {
        self.trigger_fingerprints == other.trigger_fingerprints
    }

    pub fn shares_trigger(&self, other: &Self) -> bool {
        self.trigger_fingerprints
            .iter()
            .any(|fingerprint| other.trigger_fingerprints.contains(fingerprint))
    }

    /// Record a conflict loss against `opponent`, returning the new count.
    pub fn record_conflict_loss(&mut self, opponent: &str) -> u32 {
        if let Some(entry) = self
            .conflict_losses
            .iter_mut()
            .find(|(id, _)| id == opponent)
        {
            entry.1 += 1;
            return entry.1;
        }
        self.conflict_losses.push((opponent.to_owned(), 1));
        1
    }
}

/// What the critic returns per candidate, before quality filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateLesson {
    pub trigger_fingerprints: Vec<String>,
    pub rule_text: String,
    #[serde(default)]
    pub scope_hint: ScopeHint,
    #[serde(default)]
    pub tags: Vec<String>,
}
